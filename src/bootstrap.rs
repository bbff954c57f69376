//! Link bootstrap.
//!
//! Finds the physical NIC that has real upstream connectivity and binds it to the management
//! bridge. Every candidate link is probed in its own throwaway namespace so that DHCP on one
//! link can never disturb the host routing table.

use crate::config::BootstrapConfig;
use crate::error::{NetworkError, Result};
use crate::kernel::{KernelNetwork, Link, LinkKind, Route};
use crate::logging::log_probe_result;
use crate::resilience::{ExponentialBackoffConfig, RetryPolicy};
use futures::StreamExt;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Addresses kept in the order they were first seen, without duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddrSet {
    addrs: Vec<IpNetwork>,
}

impl AddrSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the address was already present.
    pub fn insert(&mut self, addr: IpNetwork) -> bool {
        if self.addrs.contains(&addr) {
            return false;
        }
        self.addrs.push(addr);
        true
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpNetwork> {
        self.addrs.iter()
    }

    pub fn to_vec(&self) -> Vec<IpNetwork> {
        self.addrs.clone()
    }
}

impl FromIterator<IpNetwork> for AddrSet {
    fn from_iter<I: IntoIterator<Item = IpNetwork>>(iter: I) -> Self {
        let mut set = AddrSet::new();
        for addr in iter {
            set.insert(addr);
        }
        set
    }
}

/// What a link reported while probed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceConfig {
    pub name: String,
    pub addrs4: AddrSet,
    pub addrs6: AddrSet,
    pub routes: Vec<Route>,
}

impl IfaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    fn smallest_ipv4(&self) -> Option<Ipv4Addr> {
        self.addrs4
            .iter()
            .filter_map(|a| match a.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .min()
    }

    fn ipv4_gateways(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.routes
            .iter()
            .filter(|r| r.is_ipv4())
            .filter_map(|r| r.default_gateway())
    }
}

/// Gateways on private, link-local or loopback ranges.
pub fn is_private_gateway(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private() || ip.is_link_local(),
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];
            ip.is_loopback() || (first & 0xffc0) == 0xfe80 || (first & 0xfe00) == 0xfc00
        }
    }
}

/// Globally routable IPv6 unicast address that is not a unique local address.
pub fn is_global_ipv6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xffc0) == 0xfe80
        || (first & 0xfe00) == 0xfc00)
}

/// Pick the link to attach to the management bridge.
///
/// Links whose IPv4 default gateway is private win over links with a public gateway; among the
/// survivors the one holding the smallest IPv4 address is chosen, ties broken by name so the
/// result does not depend on probe order.
pub fn select_zos(configs: &[IfaceConfig]) -> Result<String> {
    let with_gateway: Vec<&IfaceConfig> = configs
        .iter()
        .filter(|c| c.ipv4_gateways().next().is_some())
        .collect();

    let mut selected: Vec<&IfaceConfig> = with_gateway
        .iter()
        .copied()
        .filter(|c| c.ipv4_gateways().any(is_private_gateway))
        .collect();

    if selected.is_empty() && !with_gateway.is_empty() {
        warn!("no link with a private gateway, falling back to a public gateway");
        selected = with_gateway;
    }

    selected.sort_by(|a, b| {
        // links without an IPv4 address sort last
        let key = |c: &IfaceConfig| c.smallest_ipv4().map(u32::from).unwrap_or(u32::MAX);
        key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name))
    });

    selected
        .first()
        .map(|c| c.name.clone())
        .ok_or(NetworkError::NoDefaultGateway)
}

/// Probes physical links and wires the chosen one to the management bridge.
#[derive(Clone)]
pub struct Bootstrap {
    kernel: Arc<dyn KernelNetwork>,
    config: BootstrapConfig,
    poll: Duration,
}

impl Bootstrap {
    pub fn new(kernel: Arc<dyn KernelNetwork>, config: BootstrapConfig) -> Self {
        Self {
            kernel,
            config,
            poll: Duration::from_secs(1),
        }
    }

    /// Override the interval at which carrier and addresses are polled.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Probe every plugged, unattached physical link concurrently.
    ///
    /// Links that fail to probe are logged and left out. Only a failure to list links is fatal.
    pub async fn inspect_ifaces(&self) -> Result<Vec<IfaceConfig>> {
        let links = self.kernel.list_links(None).await?;

        let mut candidates = Vec::new();
        for link in links {
            if !self.is_candidate(&link).await {
                continue;
            }
            candidates.push(link.name);
        }

        if candidates.is_empty() {
            warn!("no plugged physical link found");
            return Ok(Vec::new());
        }

        let (tx, rx) = mpsc::channel(candidates.len());
        for name in candidates {
            let tx = tx.clone();
            let probe = self.clone();
            tokio::spawn(async move {
                match probe.probe_link(&name).await {
                    Ok(config) => {
                        log_probe_result(&config.name, config.addrs4.len(), config.addrs6.len(), config.routes.len());
                        let _ = tx.send(config).await;
                    }
                    Err(e) => error!(link = %name, error = %e, "failed to probe link"),
                }
            });
        }
        // the stream ends once every probe task dropped its sender
        drop(tx);

        Ok(ReceiverStream::new(rx).collect().await)
    }

    async fn is_candidate(&self, link: &Link) -> bool {
        if link.kind != LinkKind::Device {
            return false;
        }
        if link.master.is_some() {
            debug!(link = %link.name, "link is attached to a bridge, skipping");
            return false;
        }

        match self.wait_carrier(&link.name).await {
            Ok(true) => true,
            Ok(false) => {
                info!(link = %link.name, "link has no carrier, skipping");
                false
            }
            Err(e) => {
                warn!(link = %link.name, error = %e, "failed to check link carrier");
                false
            }
        }
    }

    async fn wait_carrier(&self, name: &str) -> Result<bool> {
        self.kernel.set_link_up(None, name).await?;
        let deadline = Instant::now() + self.config.carrier_timeout;
        loop {
            if let Some(link) = self.kernel.get_link(None, name).await? {
                if link.carrier {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Probe one link inside a namespace named after it. Teardown runs whatever happens.
    async fn probe_link(&self, name: &str) -> Result<IfaceConfig> {
        self.kernel.create_namespace(name).await?;

        let result = self.probe_in_namespace(name).await;

        if let Err(e) = self.kernel.move_link(Some(name), name, None).await {
            warn!(link = %name, error = %e, "failed to move link back to host namespace");
        }
        if let Err(e) = self.kernel.delete_namespace(name).await {
            error!(namespace = %name, error = %e, "failed to delete probe namespace");
        }

        result
    }

    async fn probe_in_namespace(&self, name: &str) -> Result<IfaceConfig> {
        let ns = Some(name);
        self.kernel.move_link(None, name, ns).await?;
        self.kernel.set_link_up(ns, name).await?;
        self.kernel
            .sysctl(ns, &format!("net.ipv6.conf.{}.disable_ipv6", name), "0")
            .await?;

        info!(link = %name, "start DHCP probe");
        if let Err(e) = self.kernel.dhcp_probe(ns, name).await {
            // SLAAC may still hand out addresses
            warn!(link = %name, error = %e, "no DHCP lease on link");
        }

        let mut config = IfaceConfig::new(name);
        let deadline = Instant::now() + self.config.probe_timeout;
        loop {
            for addr in self.kernel.addrs(ns, name).await? {
                match addr.ip() {
                    IpAddr::V4(_) => {
                        config.addrs4.insert(addr);
                    }
                    IpAddr::V6(ip) if is_global_ipv6(&ip) => {
                        config.addrs6.insert(addr);
                    }
                    IpAddr::V6(_) => {}
                }
            }

            if (!config.addrs4.is_empty() && !config.addrs6.is_empty()) || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll).await;
        }

        config.routes = self
            .kernel
            .routes(ns)
            .await?
            .into_iter()
            .filter(|r| r.device.as_deref() == Some(name))
            .collect();

        Ok(config)
    }

    /// Create the management bridge with IPv6 autoconfiguration disabled.
    pub async fn create_default_bridge(&self, name: &str) -> Result<()> {
        if !self.kernel.link_exists(None, name).await? {
            info!(bridge = %name, "creating management bridge");
            self.kernel.create_bridge(name).await?;
        }
        self.kernel
            .sysctl(None, &format!("net.ipv6.conf.{}.accept_ra", name), "0")
            .await?;
        self.kernel
            .sysctl(None, &format!("net.ipv6.conf.{}.autoconf", name), "0")
            .await?;
        self.kernel.set_link_up(None, name).await
    }

    /// Enslave `link` to `bridge` and let the bridge take over the link's MAC.
    pub async fn attach_nic(&self, link: &str, bridge: &str) -> Result<()> {
        let nic = self
            .kernel
            .get_link(None, link)
            .await?
            .ok_or_else(|| NetworkError::not_found(format!("link {}", link)))?;

        if nic.master.as_deref() != Some(bridge) {
            self.kernel.set_master(link, bridge).await?;
        }
        if let Some(mac) = &nic.mac {
            self.kernel.set_mac(None, bridge, mac).await?;
        }
        self.kernel.set_link_up(None, link).await
    }

    /// Whether the management bridge already carries a physical uplink.
    pub async fn default_bridge_valid(&self, bridge: &str) -> Result<bool> {
        if !self.kernel.link_exists(None, bridge).await? {
            return Ok(false);
        }
        let links = self.kernel.list_links(None).await?;
        Ok(links
            .iter()
            .any(|l| l.is_physical() && l.master.as_deref() == Some(bridge)))
    }

    /// One full bootstrap attempt. Returns the selected link.
    pub async fn configure_once(&self, bridge: &str) -> Result<String> {
        let configs = self.inspect_ifaces().await?;
        let selected = select_zos(&configs)?;
        info!(link = %selected, bridge = %bridge, "selected uplink");

        self.create_default_bridge(bridge).await?;
        self.attach_nic(&selected, bridge).await?;
        Ok(selected)
    }

    /// Bootstrap until it succeeds. Skipped entirely when the bridge is already wired.
    pub async fn configure(&self, bridge: &str, backoff: ExponentialBackoffConfig) -> Result<Option<String>> {
        if self.default_bridge_valid(bridge).await? {
            info!(bridge = %bridge, "management bridge already configured");
            return Ok(None);
        }

        let policy = RetryPolicy::new("bootstrap", backoff);
        policy.execute(|| self.configure_once(bridge)).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DhcpLease, FakeKernel};
    use proptest::prelude::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn iface(name: &str, addr: &str, gw: &str) -> IfaceConfig {
        let mut config = IfaceConfig::new(name);
        config.addrs4.insert(net(addr));
        config.routes.push(Route::default_via(ip(gw), name));
        config
    }

    fn fast_config() -> BootstrapConfig {
        BootstrapConfig {
            carrier_timeout: Duration::from_millis(20),
            probe_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_select_prefers_private_gateway() {
        let configs = vec![
            iface("eth0", "185.69.166.20/24", "185.69.166.1"),
            iface("eth1", "192.168.1.50/24", "192.168.1.1"),
        ];
        assert_eq!(select_zos(&configs).unwrap(), "eth1");
    }

    #[test]
    fn test_select_smallest_ipv4_wins() {
        let configs = vec![
            iface("eth0", "10.0.0.9/24", "10.0.0.1"),
            iface("eth1", "10.0.0.5/24", "10.0.0.1"),
        ];
        assert_eq!(select_zos(&configs).unwrap(), "eth1");
    }

    #[test]
    fn test_select_falls_back_to_public_gateway() {
        let configs = vec![
            iface("eth0", "185.69.166.20/24", "185.69.166.1"),
            IfaceConfig::new("eth1"),
        ];
        assert_eq!(select_zos(&configs).unwrap(), "eth0");
    }

    #[test]
    fn test_select_without_gateway_fails() {
        let mut only_addr = IfaceConfig::new("eth0");
        only_addr.addrs4.insert(net("10.0.0.2/24"));

        let err = select_zos(&[only_addr]).unwrap_err();
        assert_eq!(err.to_string(), "no route with default gateway found");
        assert!(select_zos(&[]).is_err());
    }

    #[test]
    fn test_private_gateway_ranges() {
        for gw in ["10.1.2.3", "172.16.0.1", "172.31.255.254", "192.168.0.1", "169.254.1.1", "fe80::1", "fd00::1", "::1"] {
            assert!(is_private_gateway(ip(gw)), "{} should be private", gw);
        }
        for gw in ["8.8.8.8", "172.32.0.1", "2a02:1802::1"] {
            assert!(!is_private_gateway(ip(gw)), "{} should be public", gw);
        }
    }

    #[test]
    fn test_global_ipv6() {
        assert!(is_global_ipv6(&"2a02:1802:5e::10".parse().unwrap()));
        assert!(!is_global_ipv6(&"fe80::10".parse().unwrap()));
        assert!(!is_global_ipv6(&"fd12:3456::1".parse().unwrap()));
    }

    #[test]
    fn test_addr_set_keeps_first_seen_order() {
        let set: AddrSet = ["10.0.0.2/24", "10.0.0.1/24", "10.0.0.2/24"]
            .iter()
            .map(|s| net(s))
            .collect();
        assert_eq!(set.to_vec(), vec![net("10.0.0.2/24"), net("10.0.0.1/24")]);
    }

    proptest! {
        #[test]
        fn prop_select_is_order_independent(
            hosts in proptest::collection::btree_set(2u8..250, 1..6),
            private in proptest::collection::vec(any::<bool>(), 6),
            rotate in 0usize..6,
        ) {
            let configs: Vec<IfaceConfig> = hosts
                .iter()
                .enumerate()
                .map(|(i, h)| {
                    let gw = if private[i] { "10.0.0.1" } else { "185.69.166.1" };
                    iface(&format!("eth{}", i), &format!("10.0.0.{}/24", h), gw)
                })
                .collect();

            let mut rotated = configs.clone();
            let len = rotated.len();
            rotated.rotate_left(rotate % len);
            rotated.reverse();

            prop_assert_eq!(select_zos(&configs).unwrap(), select_zos(&rotated).unwrap());
        }

        #[test]
        fn prop_addr_set_has_no_duplicates(octets in proptest::collection::vec(1u8..20, 0..40)) {
            let set: AddrSet = octets
                .iter()
                .map(|o| IpNetwork::V4(ipnetwork::Ipv4Network::new(Ipv4Addr::new(10, 0, 0, *o), 24).unwrap()))
                .collect();

            let mut seen = Vec::new();
            for o in &octets {
                if !seen.contains(o) {
                    seen.push(*o);
                }
            }
            let got: Vec<u8> = set.iter().map(|a| match a.ip() {
                IpAddr::V4(v4) => v4.octets()[3],
                IpAddr::V6(_) => 0,
            }).collect();
            prop_assert_eq!(got, seen);
        }
    }

    #[tokio::test]
    async fn test_inspect_probes_plugged_physical_links() -> Result<()> {
        let kernel = FakeKernel::new();
        kernel.add_physical("eth0", "52:54:00:aa:00:01", true).await;
        kernel.add_physical("eth1", "52:54:00:aa:00:02", true).await;
        kernel.add_physical("eth2", "52:54:00:aa:00:03", false).await;
        kernel.add_bridge("docker0").await;
        kernel
            .script_dhcp(
                "eth0",
                DhcpLease {
                    addr4: net("192.168.1.50/24"),
                    gateway: ip("192.168.1.1"),
                    addrs6: vec![net("2a02:1802:5e::50/64"), net("fe80::5054:ff:feaa:1/64")],
                },
            )
            .await;

        let bootstrap = Bootstrap::new(Arc::new(kernel.clone()), fast_config()).with_poll_interval(Duration::from_millis(5));
        let configs = bootstrap.inspect_ifaces().await?;

        // eth1 probed but got nothing, eth2 has no carrier
        assert_eq!(configs.len(), 2);
        let eth0 = configs.iter().find(|c| c.name == "eth0").unwrap();
        assert_eq!(eth0.addrs4.to_vec(), vec![net("192.168.1.50/24")]);
        assert_eq!(eth0.addrs6.to_vec(), vec![net("2a02:1802:5e::50/64")]);
        assert_eq!(eth0.routes.len(), 1);

        // Verify teardown left the host as it was
        assert!(!kernel.has_namespace("eth0").await);
        assert!(!kernel.has_namespace("eth1").await);
        assert!(kernel.link(None, "eth0").await.is_some());
        assert!(kernel.link(None, "eth1").await.is_some());
        assert_eq!(kernel.call_count("dhcp_probe").await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_configure_attaches_selected_link() -> Result<()> {
        let kernel = FakeKernel::new();
        kernel.add_physical("eth0", "52:54:00:aa:00:01", true).await;
        kernel.add_physical("eth1", "52:54:00:aa:00:02", true).await;
        kernel
            .script_dhcp(
                "eth1",
                DhcpLease {
                    addr4: net("10.10.0.7/16"),
                    gateway: ip("10.10.0.1"),
                    addrs6: vec![],
                },
            )
            .await;

        let bootstrap = Bootstrap::new(Arc::new(kernel.clone()), fast_config()).with_poll_interval(Duration::from_millis(5));
        let selected = bootstrap
            .configure("zos", ExponentialBackoffConfig::constant(Duration::from_millis(1), 2))
            .await?;
        assert_eq!(selected.as_deref(), Some("eth1"));

        let bridge = kernel.link(None, "zos").await.unwrap();
        assert!(bridge.up);
        assert_eq!(bridge.mac.as_deref(), Some("52:54:00:aa:00:02"));
        assert_eq!(kernel.link(None, "eth1").await.unwrap().master.as_deref(), Some("zos"));
        assert_eq!(kernel.sysctl_value(None, "net.ipv6.conf.zos.accept_ra").await.as_deref(), Some("0"));

        // a second run sees the wired bridge and does nothing
        assert!(bootstrap.default_bridge_valid("zos").await?);
        let again = bootstrap
            .configure("zos", ExponentialBackoffConfig::constant(Duration::from_millis(1), 0))
            .await?;
        assert_eq!(again, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_attached_links_are_not_probed() -> Result<()> {
        let kernel = FakeKernel::new();
        kernel.add_physical("eth0", "52:54:00:aa:00:01", true).await;
        kernel.add_bridge("zos").await;
        kernel.set_master("eth0", "zos").await?;

        let bootstrap = Bootstrap::new(Arc::new(kernel.clone()), fast_config());
        assert!(bootstrap.inspect_ifaces().await?.is_empty());
        assert_eq!(kernel.call_count("create_namespace").await, 0);
        Ok(())
    }
}
