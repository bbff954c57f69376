//! The public gateway namespace (NDMZ).
//!
//! Every network resource reaches the outside world through one shared namespace. It holds
//! the node's public uplinks (`npub4`, `npub6`), the routing interface `tonrs` on the `br-ndmz`
//! bridge every resource plugs its `public` macvlan into, and the NAT between the two.

pub mod dhcp;
mod dualstack;
mod hidden;

pub use dhcp::DhcpMonitor;
pub use dualstack::DualStack;
pub use hidden::Hidden;

use crate::bootstrap::is_global_ipv6;
use crate::config::{DhcpConfig, NdmzConfig, NetworkerConfig};
use crate::error::{NetworkError, Result};
use crate::firewall;
use crate::ipam::IpamStore;
use crate::kernel::{has_default_route, KernelNetwork, Route};
use crate::nr::NetResource;
use crate::resilience::{ExponentialBackoffConfig, RetryPolicy};
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAC_SUFFIX_4: &str = "-ndmz4";
const MAC_SUFFIX_6: &str = "-ndmz6";

/// How the node reaches the internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayMode {
    /// Public IPv4 and IPv6 on the uplink
    DualStack,
    /// Behind a NAT, IPv4 only
    Hidden,
}

impl fmt::Display for GatewayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayMode::DualStack => write!(f, "dual-stack"),
            GatewayMode::Hidden => write!(f, "hidden"),
        }
    }
}

impl FromStr for GatewayMode {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dual-stack" | "dualstack" => Ok(GatewayMode::DualStack),
            "hidden" => Ok(GatewayMode::Hidden),
            other => Err(NetworkError::validation(format!("unknown gateway mode {}", other))),
        }
    }
}

/// A link inside the gateway namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdmzInterface {
    pub name: String,
    pub addrs: Vec<IpNetwork>,
    pub mac: Option<String>,
}

#[async_trait]
pub trait Ndmz: Send + Sync {
    /// Build the namespace and wait until the public side has connectivity.
    async fn create(&self) -> Result<()>;
    async fn delete(&self) -> Result<()>;
    /// Stop the lease watchdog and wait for it to release its service. Kernel state stays.
    async fn stop(&self);
    /// Plug a network resource into the routing bridge. Returns the address it was leased.
    async fn attach_nr(&self, network_id: &str, nr: &NetResource) -> Result<Ipv4Addr>;
    /// Give up the address leased to a network.
    async fn detach_nr(&self, network_id: &str) -> Result<()>;
    /// Add the overlay gateway address to the public IPv6 interface.
    async fn set_ip6_public_iface(&self, subnet: IpNetwork) -> Result<()>;
    fn supports_pub_ipv4(&self) -> bool;
    /// Host link the public IPv6 interface hangs off.
    fn ip6_public_iface(&self) -> String;
    async fn is_ipv4_only(&self) -> Result<bool>;
    async fn set_ip(&self, subnet: IpNetwork) -> Result<()>;
    async fn interfaces(&self) -> Result<Vec<NdmzInterface>>;
    fn namespace(&self) -> String;
}

/// Build the gateway variant for `mode`.
pub fn build_ndmz(mode: GatewayMode, gateway: Gateway) -> Arc<dyn Ndmz> {
    match mode {
        GatewayMode::DualStack => Arc::new(DualStack::new(gateway)),
        GatewayMode::Hidden => Arc::new(Hidden::new(gateway)),
    }
}

/// Stable, locally administered unicast MAC derived from `input`.
pub fn derive_mac(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&digest[..6]);
    mac[0] = (mac[0] | 0x02) & 0xfe;
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// IPv6 address an NR gets on the routing segment for its leased IPv4.
pub fn ndmz_ipv6(ip: Ipv4Addr) -> Ipv6Addr {
    let o = ip.octets();
    Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, (o[2] as u16) << 8 | o[3] as u16)
}

fn v4(addr: Ipv4Addr, prefix: u8) -> Result<IpNetwork> {
    Ok(IpNetwork::V4(Ipv4Network::new(addr, prefix).map_err(anyhow::Error::from)?))
}

fn v6(addr: Ipv6Addr, prefix: u8) -> Result<IpNetwork> {
    Ok(IpNetwork::V6(Ipv6Network::new(addr, prefix).map_err(anyhow::Error::from)?))
}

const LINK_LOCAL_GW: Ipv6Addr = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);

/// State and steps shared by both gateway variants.
pub struct Gateway {
    kernel: Arc<dyn KernelNetwork>,
    supervisor: Arc<dyn ProcessSupervisor>,
    ipam: IpamStore,
    config: NdmzConfig,
    dhcp: DhcpConfig,
    node_id: String,
    default_bridge: String,
    public_master: String,
    poll: Duration,
    shutdown: CancellationToken,
    watchdog: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Gateway {
    pub fn new(
        kernel: Arc<dyn KernelNetwork>,
        supervisor: Arc<dyn ProcessSupervisor>,
        ipam: IpamStore,
        config: &NetworkerConfig,
    ) -> Self {
        Self {
            kernel,
            supervisor,
            ipam,
            config: config.ndmz.clone(),
            dhcp: config.dhcp.clone(),
            node_id: config.node_id.clone(),
            default_bridge: config.default_bridge.clone(),
            public_master: config.default_bridge.clone(),
            poll: Duration::from_secs(1),
            shutdown: CancellationToken::new(),
            watchdog: Mutex::new(None),
        }
    }

    /// Host link for `npub6` on dual stack nodes with a dedicated public NIC.
    pub fn with_public_master(mut self, master: impl Into<String>) -> Self {
        self.public_master = master.into();
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Token cancelled when the gateway is torn down; stops pending waits.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn ns(&self) -> &str {
        &self.config.namespace
    }

    async fn ensure_namespace(&self) -> Result<()> {
        if !self.kernel.namespace_exists(self.ns()).await? {
            info!(namespace = %self.ns(), "create ndmz namespace");
            self.kernel.create_namespace(self.ns()).await?;
        }
        Ok(())
    }

    async fn ensure_addrs(&self, iface: &str, wanted: &[IpNetwork]) -> Result<()> {
        let current = self.kernel.addrs(Some(self.ns()), iface).await?;
        for addr in wanted {
            if !current.contains(addr) {
                self.kernel.add_addr(Some(self.ns()), iface, *addr).await?;
            }
        }
        Ok(())
    }

    /// `br-ndmz` on the host and its `tonrs` leg inside the namespace.
    async fn create_routing_bridge(&self) -> Result<()> {
        let bridge = &self.config.bridge;
        let tonrs = &self.config.tonrs_iface;
        let ns = Some(self.ns());

        if !self.kernel.link_exists(None, bridge).await? {
            self.kernel.create_bridge(bridge).await?;
        }
        self.kernel
            .sysctl(None, &format!("net.ipv6.conf.{}.disable_ipv6", bridge), "1")
            .await?;
        self.kernel.set_link_up(None, bridge).await?;

        if !self.kernel.link_exists(ns, tonrs).await? {
            self.kernel.create_macvlan(tonrs, bridge, ns).await?;
        }
        self.kernel
            .sysctl(ns, &format!("net.ipv6.conf.{}.disable_ipv6", tonrs), "0")
            .await?;

        let wanted = [
            v4(self.config.gateway, self.config.pool.prefix())?,
            v6(LINK_LOCAL_GW, 64)?,
            v6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1), 64)?,
        ];
        self.ensure_addrs(tonrs, &wanted).await?;
        self.kernel.set_link_up(ns, tonrs).await
    }

    async fn create_pub_iface6(&self, master: &str) -> Result<()> {
        let iface = &self.config.pub6_iface;
        let ns = Some(self.ns());
        if !self.kernel.link_exists(ns, iface).await? {
            self.kernel.create_macvlan(iface, master, ns).await?;
        }
        let mac = derive_mac(&format!("{}{}", self.node_id, MAC_SUFFIX_6));
        debug!(link = %iface, mac = %mac, "set mac on ipv6 public interface");
        self.kernel.set_mac(ns, iface, &mac).await?;
        self.kernel.set_link_up(ns, iface).await
    }

    async fn create_pub_iface4(&self) -> Result<()> {
        let iface = &self.config.pub4_iface;
        let ns = Some(self.ns());
        if !self.kernel.link_exists(ns, iface).await? {
            self.kernel.create_macvlan(iface, &self.default_bridge, ns).await?;
        }
        self.kernel
            .sysctl(ns, &format!("net.ipv6.conf.{}.disable_ipv6", iface), "1")
            .await?;
        let mac = derive_mac(&format!("{}{}", self.node_id, MAC_SUFFIX_4));
        debug!(link = %iface, mac = %mac, "set mac on ipv4 public interface");
        self.kernel.set_mac(ns, iface, &mac).await?;
        self.kernel.set_link_up(ns, iface).await
    }

    /// Everything both variants build before waiting for connectivity.
    async fn prepare(&self, pub6_master: &str) -> Result<()> {
        self.ensure_namespace().await?;
        self.create_routing_bridge().await?;
        self.create_pub_iface6(pub6_master).await?;
        self.create_pub_iface4().await?;

        let rules = firewall::ndmz_ruleset(&self.config)?;
        self.kernel.apply_firewall(Some(self.ns()), &rules).await?;

        let ns = Some(self.ns());
        self.kernel.sysctl(ns, "net.ipv6.conf.all.forwarding", "1").await?;
        self.kernel.sysctl(ns, "net.ipv4.ip_forward", "1").await
    }

    async fn has_ipv4_route(&self) -> Result<bool> {
        has_default_route(self.kernel.as_ref(), Some(self.ns()), &self.config.pub4_iface, true).await
    }

    /// One DHCP probe on `npub4`, then poll for a default route until `timeout`.
    async fn wait_ip4(&self, timeout: Duration) -> Result<()> {
        let iface = &self.config.pub4_iface;
        self.kernel.dhcp_probe(Some(self.ns()), iface).await?;

        let deadline = Instant::now() + timeout;
        loop {
            if self.has_ipv4_route().await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(NetworkError::Timeout {
                    what: format!("an IPv4 lease on {}, make sure DHCP is working", iface),
                });
            }
            tokio::time::sleep(self.poll).await;
        }
    }

    /// Accept router advertisements on `npub6` and wait for SLAAC to install a route.
    async fn wait_ip6(&self) -> Result<()> {
        let ns = Some(self.ns());
        let iface = &self.config.pub6_iface;
        self.kernel.set_link_up(ns, "lo").await?;
        self.kernel.sysctl(ns, &format!("net.ipv6.conf.{}.accept_ra", iface), "2").await?;
        self.kernel
            .sysctl(ns, &format!("net.ipv6.conf.{}.accept_ra_defrtr", iface), "1")
            .await?;
        self.kernel
            .sysctl(ns, &format!("net.ipv4.conf.{}.proxy_arp", iface), "0")
            .await?;

        let probe: IpAddr = self
            .config
            .ipv6_probe
            .parse()
            .map_err(|_| NetworkError::validation(format!("invalid ipv6 probe address {}", self.config.ipv6_probe)))?;

        let policy = RetryPolicy::new(
            "wait for slaac",
            ExponentialBackoffConfig {
                max_delay_ms: self.config.slaac_timeout.as_millis() as u64 / 4,
                ..ExponentialBackoffConfig::bounded_by(self.config.slaac_timeout)
            },
        );
        policy
            .execute_until(&self.shutdown, || async move {
                match self.kernel.route_get(ns, probe).await? {
                    Some(_) => Ok(()),
                    None => Err(NetworkError::Timeout {
                        what: format!("an IPv6 route on {}, make sure router advertisements reach it", iface),
                    }),
                }
            })
            .await
    }

    /// Start the lease watchdog on `npub4` unless one already runs.
    async fn start_watchdog(&self) {
        let mut watchdog = self.watchdog.lock().await;
        if watchdog.as_ref().map(|(_, h)| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let token = self.shutdown.child_token();
        let monitor = DhcpMonitor::new(
            self.kernel.clone(),
            self.supervisor.clone(),
            &self.config.pub4_iface,
            Some(self.ns()),
            self.dhcp.clone(),
        );
        let handle = tokio::spawn(monitor.run(token.clone()));
        *watchdog = Some((token, handle));
    }

    async fn stop_watchdog(&self) {
        let running = self.watchdog.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "dhcp watchdog task failed");
            }
        }
    }

    async fn delete(&self) -> Result<()> {
        self.stop_watchdog().await;
        if self.kernel.namespace_exists(self.ns()).await? {
            self.kernel.delete_namespace(self.ns()).await?;
        }
        info!(namespace = %self.ns(), "ndmz deleted");
        Ok(())
    }

    async fn attach_nr(&self, network_id: &str, nr: &NetResource) -> Result<Ipv4Addr> {
        let nr_ns = nr.namespace();
        let ns = Some(nr_ns.as_str());
        let iface = &self.config.nr_public_iface;

        if !self.kernel.link_exists(ns, iface).await? {
            self.kernel.create_macvlan(iface, &self.config.bridge, ns).await?;
        }

        let ip = self.ipam.allocate(network_id).await?;
        let ip6 = ndmz_ipv6(ip);
        debug!(network_id = %network_id, ipv4 = %ip, ipv6 = %ip6, "attach network resource to ndmz");

        let wanted = [v4(ip, self.config.pool.prefix())?, v6(ip6, 64)?];
        let current = self.kernel.addrs(ns, iface).await?;
        for addr in wanted {
            if !current.contains(&addr) {
                self.kernel.add_addr(ns, iface, addr).await?;
            }
        }
        self.kernel.set_link_up(ns, iface).await?;

        let routes = [
            Route::default_via(IpAddr::V4(self.config.gateway), iface),
            Route::default_via(IpAddr::V6(LINK_LOCAL_GW), iface),
        ];
        let existing = self.kernel.routes(ns).await?;
        for route in routes {
            let present = existing
                .iter()
                .any(|r| r.is_default() && r.is_ipv4() == route.is_ipv4() && r.device == route.device);
            if !present {
                self.kernel.add_route(ns, &route).await?;
            }
        }
        Ok(ip)
    }

    async fn set_addr(&self, iface: &str, subnet: IpNetwork) -> Result<()> {
        self.ensure_addrs(iface, &[subnet]).await
    }

    async fn set_ip(&self, subnet: IpNetwork) -> Result<()> {
        let iface = match subnet {
            IpNetwork::V4(_) => &self.config.pub4_iface,
            IpNetwork::V6(_) => &self.config.pub6_iface,
        };
        self.set_addr(iface, subnet).await
    }

    async fn is_ipv4_only(&self) -> Result<bool> {
        let addrs = self.kernel.addrs(Some(self.ns()), &self.config.pub6_iface).await?;
        Ok(!addrs.iter().any(|a| match a {
            IpNetwork::V6(net) => is_global_ipv6(&net.ip()),
            IpNetwork::V4(_) => false,
        }))
    }

    async fn interfaces(&self) -> Result<Vec<NdmzInterface>> {
        let mut output = Vec::new();
        for link in self.kernel.list_links(Some(self.ns())).await? {
            if link.name == self.config.tonrs_iface {
                continue;
            }
            let addrs = self.kernel.addrs(Some(self.ns()), &link.name).await?;
            output.push(NdmzInterface {
                name: link.name,
                addrs,
                mac: link.mac,
            });
        }
        Ok(output)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::testing::{DhcpLease, FakeKernel, RecordingSupervisor};
    use tempfile::TempDir;

    pub const NODE: &str = "node-1";

    pub struct Harness {
        pub kernel: FakeKernel,
        pub supervisor: RecordingSupervisor,
        pub config: NetworkerConfig,
        _dir: TempDir,
    }

    impl Harness {
        pub async fn new() -> (Self, Gateway) {
            let dir = tempfile::tempdir().unwrap();
            let kernel = FakeKernel::new();
            kernel.add_bridge("zos").await;
            kernel
                .script_dhcp(
                    "npub4",
                    DhcpLease {
                        addr4: "192.168.1.200/24".parse().unwrap(),
                        gateway: "192.168.1.1".parse().unwrap(),
                        addrs6: vec![],
                    },
                )
                .await;

            let mut config = NetworkerConfig::default();
            config.node_id = NODE.to_string();
            config.storage_root = dir.path().to_path_buf();
            config.ndmz.slaac_timeout = Duration::from_millis(200);
            config.ndmz.dhcp_timeout = Duration::from_millis(200);
            config.dhcp.watchdog_interval = Duration::from_millis(20);

            let ipam = IpamStore::open(&config.leases_dir(), config.ndmz.pool, config.ndmz.gateway)
                .await
                .unwrap();
            let supervisor = RecordingSupervisor::new();
            let gateway = Gateway::new(Arc::new(kernel.clone()), Arc::new(supervisor.clone()), ipam, &config)
                .with_poll_interval(Duration::from_millis(5));

            (
                Self {
                    kernel,
                    supervisor,
                    config,
                    _dir: dir,
                },
                gateway,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::config::NrConfig;
    use crate::types::fixtures;

    #[test]
    fn test_derive_mac() {
        assert_eq!(derive_mac("node-1-ndmz4"), "16:93:37:c1:bd:88");
        assert_eq!(derive_mac("node-1-ndmz6"), "22:16:fe:f8:41:cd");

        let mac = derive_mac("anything");
        let first = u8::from_str_radix(&mac[..2], 16).unwrap();
        assert_eq!(first & 0x01, 0, "unicast");
        assert_eq!(first & 0x02, 0x02, "locally administered");
        assert_eq!(mac, derive_mac("anything"));
    }

    #[test]
    fn test_ndmz_ipv6_projection() {
        assert_eq!(ndmz_ipv6(Ipv4Addr::new(100, 127, 1, 2)).to_string(), "fd00::102");
        assert_eq!(ndmz_ipv6(Ipv4Addr::new(100, 127, 0, 2)).to_string(), "fd00::2");
    }

    #[test]
    fn test_gateway_mode_parse() {
        assert_eq!("dual-stack".parse::<GatewayMode>().unwrap(), GatewayMode::DualStack);
        assert_eq!("hidden".parse::<GatewayMode>().unwrap(), GatewayMode::Hidden);
        assert!("bridge".parse::<GatewayMode>().is_err());
        assert_eq!(GatewayMode::DualStack.to_string(), "dual-stack");
    }

    #[tokio::test]
    async fn test_attach_nr_is_idempotent() -> Result<()> {
        let (harness, gateway) = Harness::new().await;
        let kernel = &harness.kernel;
        gateway.prepare("zos").await?;

        let network = fixtures::network(NODE);
        let nr = NetResource::new(
            Arc::new(kernel.clone()),
            &network,
            network.resource_of(NODE)?,
            NrConfig::default(),
            "public",
        )?;
        nr.create(None).await?;

        let first = gateway.attach_nr("net-alpha", &nr).await?;
        assert_eq!(first, Ipv4Addr::new(100, 127, 0, 2));
        let second = gateway.attach_nr("net-alpha", &nr).await?;
        assert_eq!(first, second);

        let ns = nr.namespace();
        let addrs = kernel.addrs_of(Some(&ns), "public").await;
        assert_eq!(
            addrs,
            vec!["100.127.0.2/16".parse().unwrap(), "fd00::2/64".parse().unwrap()]
        );
        let routes = kernel.routes_of(Some(&ns)).await;
        assert_eq!(routes.iter().filter(|r| r.is_default()).count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_prepare_builds_shared_layout() -> Result<()> {
        let (harness, gateway) = Harness::new().await;
        let kernel = &harness.kernel;
        gateway.prepare("zos").await?;

        let addrs = kernel.addrs_of(Some("ndmz"), "tonrs").await;
        assert_eq!(
            addrs,
            vec![
                "100.127.0.1/16".parse().unwrap(),
                "fe80::1/64".parse().unwrap(),
                "fd00::1/64".parse().unwrap()
            ]
        );
        let npub4 = kernel.link(Some("ndmz"), "npub4").await.unwrap();
        assert_eq!(npub4.mac.as_deref(), Some("16:93:37:c1:bd:88"));
        assert_eq!(npub4.master.as_deref(), Some("zos"));
        assert_eq!(
            kernel.sysctl_value(Some("ndmz"), "net.ipv6.conf.npub4.disable_ipv6").await.as_deref(),
            Some("1")
        );
        assert_eq!(kernel.sysctl_value(Some("ndmz"), "net.ipv4.ip_forward").await.as_deref(), Some("1"));
        assert!(kernel.firewall(Some("ndmz")).await.unwrap().contains("9943"));

        // tonrs is hidden from the listing
        let names: Vec<String> = gateway.interfaces().await?.into_iter().map(|i| i.name).collect();
        assert!(names.contains(&"npub4".to_string()));
        assert!(!names.contains(&"tonrs".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_ip_picks_interface_by_family() -> Result<()> {
        let (harness, gateway) = Harness::new().await;
        gateway.prepare("zos").await?;

        gateway.set_ip("185.69.166.7/24".parse().unwrap()).await?;
        gateway.set_ip("2a02:1802:5e::7/64".parse().unwrap()).await?;

        assert_eq!(harness.kernel.addrs_of(Some("ndmz"), "npub4").await, vec!["185.69.166.7/24".parse().unwrap()]);
        assert_eq!(harness.kernel.addrs_of(Some("ndmz"), "npub6").await, vec!["2a02:1802:5e::7/64".parse().unwrap()]);
        assert!(!gateway.is_ipv4_only().await?);
        Ok(())
    }
}
