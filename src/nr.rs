//! Network resources.
//!
//! A network resource is one node's slice of a tenant network: a namespace holding a macvlan
//! on a dedicated bridge (where workloads plug in), a WireGuard interface meshing with the
//! other nodes and a NAT/filter ruleset. All names derive from the network ID, so a resource
//! can always be found again after a restart.

use crate::config::NrConfig;
use crate::error::{NetworkError, Result};
use crate::firewall;
use crate::kernel::{KernelNetwork, Route, WgDeviceConfig, WgPeerConfig};
use crate::types::{self, Network};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WORKLOAD_IFACE: &str = "eth0";

/// `prefix-` followed by the first 12 hex characters of SHA-256(`id`). Always 14 characters.
pub fn short_name(prefix: char, id: &str) -> String {
    let digest = hex::encode(Sha256::digest(id.as_bytes()));
    format!("{}-{}", prefix, &digest[..12])
}

/// Project a private IPv4 address into the network's unique local IPv6 range.
pub fn convert4to6(network_id: &str, ip: Ipv4Addr) -> Ipv6Addr {
    let d = Sha256::digest(network_id.as_bytes());
    let o = ip.octets();
    Ipv6Addr::new(
        0xfd00 | d[0] as u16,
        (d[1] as u16) << 8 | d[2] as u16,
        (d[3] as u16) << 8 | d[4] as u16,
        o[2] as u16,
        0,
        0,
        0,
        o[3] as u16,
    )
}

/// Overlay address of a node subnet: `a.b.c.d` maps to `{overlay}.b.c`.
///
/// The subnet address is taken as written, so `10.3.1.0/16` maps to the same overlay address
/// as `10.3.1.0/24`.
pub fn wg_ip(overlay: Ipv4Network, subnet: Ipv4Network) -> Result<Ipv4Network> {
    let base = overlay.network().octets();
    let s = subnet.ip().octets();
    Ipv4Network::new(Ipv4Addr::new(base[0], base[1], s[1], s[2]), overlay.prefix())
        .map_err(|e| NetworkError::validation(format!("invalid overlay range {}: {}", overlay, e)))
}

fn ipv4_subnet(subnet: Option<IpNetwork>, what: &str) -> Result<Ipv4Network> {
    match subnet {
        Some(IpNetwork::V4(net)) => Ok(net),
        _ => Err(NetworkError::validation(format!("{} must be an IPv4 subnet", what))),
    }
}

fn host_route(net: &IpNetwork) -> bool {
    match net {
        IpNetwork::V4(n) => n.prefix() == 32,
        IpNetwork::V6(n) => n.prefix() == 128,
    }
}

/// A workload plugged into a network resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub namespace: String,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Runtime handle of one network resource.
#[derive(Clone)]
pub struct NetResource {
    kernel: Arc<dyn KernelNetwork>,
    network_id: String,
    resource: types::NetResource,
    subnet: Ipv4Network,
    config: NrConfig,
    public_iface: String,
}

impl NetResource {
    /// Bind `network`'s resource for this node. `public_iface` is the name the NDMZ uplink gets
    /// inside the namespace.
    pub fn new(
        kernel: Arc<dyn KernelNetwork>,
        network: &Network,
        resource: &types::NetResource,
        config: NrConfig,
        public_iface: impl Into<String>,
    ) -> Result<Self> {
        let subnet = ipv4_subnet(resource.subnet, "network resource subnet")?;
        Ok(Self {
            kernel,
            network_id: network.network_id.clone(),
            resource: resource.clone(),
            subnet,
            config,
            public_iface: public_iface.into(),
        })
    }

    pub fn id(&self) -> &str {
        &self.network_id
    }

    pub fn namespace(&self) -> String {
        short_name('n', &self.network_id)
    }

    pub fn bridge_name(&self) -> String {
        short_name('b', &self.network_id)
    }

    /// The workload-facing macvlan shares the namespace name.
    pub fn nr_iface(&self) -> String {
        self.namespace()
    }

    pub fn wg_name(&self) -> String {
        short_name('w', &self.network_id)
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    /// The workloads' default gateway: the subnet address as written, ending in `.1`.
    pub fn gateway(&self) -> Ipv4Addr {
        let mut octets = self.subnet.ip().octets();
        octets[3] = 1;
        Ipv4Addr::from(octets)
    }

    pub fn gateway6(&self) -> Ipv6Addr {
        convert4to6(&self.network_id, self.gateway())
    }

    /// Realize the resource. Every step checks what exists, so calling it again is harmless.
    ///
    /// When `public_namespace` is given the WireGuard interface is created there and moved in,
    /// so its UDP socket stays bound to the public side.
    pub async fn create(&self, public_namespace: Option<&str>) -> Result<()> {
        info!(network_id = %self.network_id, namespace = %self.namespace(), "create network resource");
        self.ensure_bridge().await?;
        self.ensure_namespace().await?;
        self.attach_to_bridge().await?;
        self.ensure_wireguard(public_namespace).await?;
        self.apply_firewall().await
    }

    async fn ensure_bridge(&self) -> Result<()> {
        let bridge = self.bridge_name();
        if !self.kernel.link_exists(None, &bridge).await? {
            debug!(bridge = %bridge, "create network resource bridge");
            self.kernel.create_bridge(&bridge).await?;
        }
        self.kernel
            .sysctl(None, &format!("net.ipv6.conf.{}.disable_ipv6", bridge), "1")
            .await?;
        self.kernel.set_link_up(None, &bridge).await
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let ns = self.namespace();
        if !self.kernel.namespace_exists(&ns).await? {
            debug!(namespace = %ns, "create network resource namespace");
            self.kernel.create_namespace(&ns).await?;
        }
        self.kernel
            .sysctl(Some(&ns), "net.ipv6.conf.all.forwarding", "1")
            .await?;
        self.kernel.set_link_up(Some(&ns), "lo").await
    }

    async fn attach_to_bridge(&self) -> Result<()> {
        let ns = self.namespace();
        let iface = self.nr_iface();
        if !self.kernel.link_exists(Some(&ns), &iface).await? {
            self.kernel
                .create_macvlan(&iface, &self.bridge_name(), Some(&ns))
                .await?;
        }

        let gw4 = IpNetwork::V4(Ipv4Network::new(self.gateway(), self.subnet.prefix()).map_err(anyhow::Error::from)?);
        let gw6 = IpNetwork::V6(Ipv6Network::new(self.gateway6(), 64).map_err(anyhow::Error::from)?);
        let link_local = IpNetwork::V6(Ipv6Network::new(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1), 64).map_err(anyhow::Error::from)?);

        let current = self.kernel.addrs(Some(&ns), &iface).await?;
        for addr in [gw4, gw6, link_local] {
            if !current.contains(&addr) {
                self.kernel.add_addr(Some(&ns), &iface, addr).await?;
            }
        }
        self.kernel.set_link_up(Some(&ns), &iface).await
    }

    async fn ensure_wireguard(&self, public_namespace: Option<&str>) -> Result<()> {
        if self.has_wireguard().await? {
            return Ok(());
        }

        let wg = self.wg_name();
        match public_namespace {
            Some(public) => {
                self.kernel.create_wireguard(Some(public), &wg).await?;
                self.set_wireguard(&wg, Some(public)).await
            }
            None => self.kernel.create_wireguard(Some(&self.namespace()), &wg).await,
        }
    }

    async fn apply_firewall(&self) -> Result<()> {
        let rules = firewall::nr_ruleset(&self.public_iface)?;
        self.kernel.apply_firewall(Some(&self.namespace()), &rules).await
    }

    /// Whether the WireGuard interface already sits in the namespace.
    pub async fn has_wireguard(&self) -> Result<bool> {
        let ns = self.namespace();
        if !self.kernel.namespace_exists(&ns).await? {
            return Ok(false);
        }
        self.kernel.link_exists(Some(&ns), &self.wg_name()).await
    }

    /// Move an existing WireGuard link into the namespace.
    pub async fn set_wireguard(&self, wg_name: &str, from: Option<&str>) -> Result<()> {
        self.kernel
            .move_link(from, wg_name, Some(&self.namespace()))
            .await
    }

    /// Load keys and peers into the WireGuard interface and route peer subnets through it.
    pub async fn configure_wg(&self, private_key: &str) -> Result<()> {
        let ns = self.namespace();
        let wg = self.wg_name();
        let overlay = self.config.wg_overlay;
        let own = IpNetwork::V4(wg_ip(overlay, self.subnet)?);

        let current = self.kernel.addrs(Some(&ns), &wg).await?;
        for addr in &current {
            let stale = match addr {
                IpNetwork::V4(v4) => overlay.contains(v4.ip()) && *addr != own,
                IpNetwork::V6(_) => false,
            };
            if stale {
                debug!(namespace = %ns, addr = %addr, "remove stale wireguard address");
                self.kernel.del_addr(Some(&ns), &wg, *addr).await?;
            }
        }
        if !current.contains(&own) {
            self.kernel.add_addr(Some(&ns), &wg, own).await?;
        }

        let peers = self
            .resource
            .peers
            .iter()
            .map(|peer| WgPeerConfig {
                public_key: peer.wg_public_key.clone(),
                endpoint: peer.endpoint.clone().filter(|e| !e.is_empty()),
                allowed_ips: peer.allowed_ips.clone(),
                keepalive_secs: Some(self.config.wg_keepalive_secs),
            })
            .collect();
        let device = WgDeviceConfig {
            private_key: private_key.to_string(),
            listen_port: self.resource.wg_listen_port,
            peers,
        };
        self.kernel.configure_wireguard(Some(&ns), &wg, &device).await?;
        self.kernel.set_link_up(Some(&ns), &wg).await?;

        let mut existing = self.kernel.routes(Some(&ns)).await?;
        for peer in &self.resource.peers {
            let peer_wg = wg_ip(overlay, ipv4_subnet(peer.subnet, "peer subnet")?)?;

            let mut wanted: Vec<Route> = peer
                .allowed_ips
                .iter()
                .filter(|ip| !host_route(ip))
                .map(|ip| Route::to(*ip, Some(IpAddr::V4(peer_wg.ip())), &wg))
                .collect();
            let overlay_net = Ipv4Network::new(peer_wg.network(), peer_wg.prefix()).map_err(anyhow::Error::from)?;
            wanted.push(Route::to(IpNetwork::V4(overlay_net), None, &wg));

            for route in wanted {
                if existing.iter().any(|r| r.dst == route.dst) {
                    continue;
                }
                debug!(namespace = %ns, route = %route, "add peer route");
                self.kernel.add_route(Some(&ns), &route).await?;
                existing.push(route);
            }
        }
        Ok(())
    }

    /// Tear the resource down. Missing pieces are skipped.
    pub async fn delete(&self) -> Result<()> {
        let bridge = self.bridge_name();
        if self.kernel.link_exists(None, &bridge).await? {
            self.kernel.delete_link(None, &bridge).await?;
        }

        let ns = self.namespace();
        if self.kernel.namespace_exists(&ns).await? {
            if let Err(e) = self.kernel.delete_namespace(&ns).await {
                warn!(namespace = %ns, error = %e, "failed to delete network resource namespace");
                return Err(e);
            }
        }
        info!(network_id = %self.network_id, "network resource deleted");
        Ok(())
    }

    /// Host side name of a workload's veth pair.
    pub fn workload_veth(workload_id: &str) -> String {
        let digest = hex::encode(Sha256::digest(workload_id.as_bytes()));
        format!("veth-{}", &digest[..10])
    }

    /// Plug a workload namespace into the resource bridge.
    ///
    /// The workload gets `addrs` plus, unless it runs IPv4 only or carries its own public IPv6,
    /// the projection of its first address into the network's IPv6 range.
    pub async fn join(&self, workload_id: &str, addrs: &[Ipv4Addr], ipv4_only: bool, public_ipv6: bool) -> Result<Member> {
        let first = *addrs
            .first()
            .ok_or_else(|| NetworkError::validation("workload needs at least one address"))?;
        for addr in addrs {
            if !self.subnet.contains(*addr) {
                return Err(NetworkError::validation(format!(
                    "address {} is outside network resource subnet {}",
                    addr, self.subnet
                )));
            }
        }

        if !self.kernel.namespace_exists(workload_id).await? {
            self.kernel.create_namespace(workload_id).await?;
        }

        let ipv6 = if ipv4_only || public_ipv6 {
            None
        } else {
            Some(convert4to6(&self.network_id, first))
        };

        match self.plug_workload(workload_id, addrs, ipv6).await {
            Ok(()) => Ok(Member {
                namespace: workload_id.to_string(),
                ipv4: addrs.to_vec(),
                ipv6,
            }),
            Err(e) => {
                warn!(workload = %workload_id, error = %e, "failed to join network, cleaning up");
                if let Err(err) = self.leave(workload_id).await {
                    warn!(workload = %workload_id, error = %err, "failed to clean up workload namespace");
                }
                Err(e)
            }
        }
    }

    async fn plug_workload(&self, workload_id: &str, addrs: &[Ipv4Addr], ipv6: Option<Ipv6Addr>) -> Result<()> {
        let ns = Some(workload_id);
        let host_veth = Self::workload_veth(workload_id);

        self.kernel.set_link_up(ns, "lo").await?;
        if !self.kernel.link_exists(ns, WORKLOAD_IFACE).await? {
            self.kernel
                .create_veth(WORKLOAD_IFACE, &host_veth, workload_id, self.config.veth_mtu)
                .await?;
        }

        for addr in addrs {
            let net = Ipv4Network::new(*addr, self.config.workload_prefix).map_err(anyhow::Error::from)?;
            self.kernel.add_addr(ns, WORKLOAD_IFACE, IpNetwork::V4(net)).await?;
        }
        if let Some(ip6) = ipv6 {
            let net = Ipv6Network::new(ip6, 64).map_err(anyhow::Error::from)?;
            self.kernel.add_addr(ns, WORKLOAD_IFACE, IpNetwork::V6(net)).await?;
        }
        self.kernel.set_link_up(ns, WORKLOAD_IFACE).await?;

        self.kernel
            .add_route(ns, &Route::default_via(IpAddr::V4(self.gateway()), WORKLOAD_IFACE))
            .await?;
        if ipv6.is_some() {
            let link_local = IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1));
            self.kernel
                .add_route(ns, &Route::default_via(link_local, WORKLOAD_IFACE))
                .await?;
        }

        self.kernel
            .sysctl(None, &format!("net.ipv6.conf.{}.disable_ipv6", host_veth), "1")
            .await?;
        self.kernel.set_master(&host_veth, &self.bridge_name()).await?;
        self.kernel.set_link_up(None, &host_veth).await
    }

    /// Remove a workload namespace. Absence is success.
    pub async fn leave(&self, workload_id: &str) -> Result<()> {
        if self.kernel.namespace_exists(workload_id).await? {
            self.kernel.delete_namespace(workload_id).await?;
        }
        // the peer goes with the namespace, unless it never made it in
        self.kernel
            .delete_link(None, &Self::workload_veth(workload_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKernel;
    use crate::types::fixtures;
    use proptest::prelude::*;

    const NODE: &str = "node-1";

    fn resource(kernel: &FakeKernel, network: &Network) -> NetResource {
        let nr = network.resource_of(NODE).unwrap();
        NetResource::new(Arc::new(kernel.clone()), network, nr, NrConfig::default(), "public").unwrap()
    }

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_names_are_short_and_derived_from_id() {
        let network = fixtures::network(NODE);
        let kernel = FakeKernel::new();
        let nr = resource(&kernel, &network);

        assert_eq!(nr.namespace(), "n-4b5ce341d58a");
        assert_eq!(nr.bridge_name(), "b-4b5ce341d58a");
        assert_eq!(nr.wg_name(), "w-4b5ce341d58a");
        assert_eq!(nr.nr_iface(), nr.namespace());
        assert!(nr.namespace().len() <= 15);
    }

    #[test]
    fn test_convert4to6_golden() {
        let ip = convert4to6("networkID", Ipv4Addr::new(100, 127, 0, 2));
        assert_eq!(ip, "fd25:5dc:bc05::2".parse::<Ipv6Addr>().unwrap());

        let ip = convert4to6("net-alpha", Ipv4Addr::new(10, 3, 1, 1));
        assert_eq!(ip.to_string(), "fd4b:5ce3:41d5:1::1");

        assert_ne!(
            convert4to6("net-alpha", Ipv4Addr::new(10, 3, 1, 1)),
            convert4to6("net-beta", Ipv4Addr::new(10, 3, 1, 1))
        );
    }

    #[test]
    fn test_wg_ip() {
        let overlay = NrConfig::default().wg_overlay;
        let ip = wg_ip(overlay, "10.3.1.0/24".parse().unwrap()).unwrap();
        assert_eq!(ip.to_string(), "100.64.3.1/16");

        let wide = wg_ip(overlay, "10.3.1.0/16".parse().unwrap()).unwrap();
        assert_eq!(wide, ip);
    }

    #[test]
    fn test_workload_veth_name() {
        assert_eq!(NetResource::workload_veth("vm-1"), "veth-2d62b0035f");
        assert!(NetResource::workload_veth("a-very-long-workload-identifier").len() <= 15);
    }

    proptest! {
        #[test]
        fn prop_names_are_deterministic(id in "[a-zA-Z0-9-]{1,64}") {
            let name = short_name('n', &id);
            prop_assert_eq!(name.len(), 14);
            prop_assert_eq!(&name, &short_name('n', &id));
            prop_assert!(name.starts_with("n-"));
        }

        #[test]
        fn prop_convert4to6_stays_in_ula_range(id in ".{1,40}", c in any::<u8>(), d in any::<u8>()) {
            let ip = convert4to6(&id, Ipv4Addr::new(10, 0, c, d));
            prop_assert_eq!(ip.segments()[0] & 0xff00, 0xfd00);
            prop_assert_eq!(ip.segments()[3], c as u16);
            prop_assert_eq!(ip.segments()[7], d as u16);
            prop_assert_eq!(ip, convert4to6(&id, Ipv4Addr::new(10, 0, c, d)));
        }
    }

    #[tokio::test]
    async fn test_create_builds_full_resource() -> Result<()> {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);

        nr.create(None).await?;

        let ns = nr.namespace();
        let bridge = kernel.link(None, &nr.bridge_name()).await.unwrap();
        assert!(bridge.up);
        assert_eq!(
            kernel.sysctl_value(None, &format!("net.ipv6.conf.{}.disable_ipv6", nr.bridge_name())).await.as_deref(),
            Some("1")
        );
        assert_eq!(kernel.sysctl_value(Some(&ns), "net.ipv6.conf.all.forwarding").await.as_deref(), Some("1"));

        let addrs = kernel.addrs_of(Some(&ns), &nr.nr_iface()).await;
        assert_eq!(addrs, vec![net("10.3.1.1/24"), net("fd4b:5ce3:41d5:1::1/64"), net("fe80::1/64")]);
        assert!(kernel.link(Some(&ns), &nr.wg_name()).await.is_some());
        assert!(kernel.firewall(Some(&ns)).await.unwrap().contains(r#"oifname "public" masquerade"#));
        Ok(())
    }

    #[tokio::test]
    async fn test_create_is_idempotent() -> Result<()> {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);

        nr.create(None).await?;
        let links = kernel.links_in(Some(&nr.namespace())).await;
        let creations = kernel.call_count("create_macvlan").await;

        nr.create(None).await?;
        assert_eq!(kernel.links_in(Some(&nr.namespace())).await, links);
        assert_eq!(kernel.call_count("create_macvlan").await, creations);
        assert_eq!(kernel.call_count("create_wireguard").await, 1);
        assert_eq!(kernel.addrs_of(Some(&nr.namespace()), &nr.nr_iface()).await.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_wireguard_created_in_public_namespace_is_moved() -> Result<()> {
        let kernel = FakeKernel::new();
        kernel.create_namespace("ndmz").await?;
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);

        nr.create(Some("ndmz")).await?;

        assert!(kernel.link(Some("ndmz"), &nr.wg_name()).await.is_none());
        assert!(nr.has_wireguard().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_configure_wg_sets_address_peers_and_routes() -> Result<()> {
        let kernel = FakeKernel::new();
        let mut network = fixtures::network(NODE);
        network.net_resources[0].peers.push(fixtures::peer());
        let nr = resource(&kernel, &network);
        nr.create(None).await?;

        let ns = nr.namespace();
        let wg = nr.wg_name();
        // left over from a previous subnet
        kernel.add_addr(Some(&ns), &wg, net("100.64.9.9/16")).await?;

        nr.configure_wg("cHJpdmF0ZQ==").await?;

        assert_eq!(kernel.addrs_of(Some(&ns), &wg).await, vec![net("100.64.3.1/16")]);
        let device = kernel.wg_config(Some(&ns), &wg).await.unwrap();
        assert_eq!(device.listen_port, 6010);
        assert_eq!(device.peers.len(), 1);
        assert_eq!(device.peers[0].keepalive_secs, Some(20));
        assert_eq!(device.peers[0].endpoint.as_deref(), Some("185.69.166.2:6011"));

        let routes = kernel.routes_of(Some(&ns)).await;
        let peer_gw: IpAddr = "100.64.3.2".parse().unwrap();
        assert!(routes.contains(&Route::to(net("10.3.2.0/24"), Some(peer_gw), &wg)));
        assert!(routes.contains(&Route::to(net("100.64.0.0/16"), None, &wg)));
        // host routes are covered by the overlay route
        assert!(!routes.iter().any(|r| r.dst == Some(net("100.64.3.2/32"))));

        // reconfiguring adds nothing new
        let before = kernel.call_count("add_route").await;
        nr.configure_wg("cHJpdmF0ZQ==").await?;
        assert_eq!(kernel.call_count("add_route").await, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_join_and_leave() -> Result<()> {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);
        nr.create(None).await?;

        let member = nr.join("vm-1", &[Ipv4Addr::new(10, 3, 1, 5)], false, false).await?;
        assert_eq!(member.namespace, "vm-1");
        assert_eq!(member.ipv6, Some("fd4b:5ce3:41d5:1::5".parse().unwrap()));

        let addrs = kernel.addrs_of(Some("vm-1"), "eth0").await;
        assert_eq!(addrs, vec![net("10.3.1.5/24"), net("fd4b:5ce3:41d5:1::5/64")]);
        let routes = kernel.routes_of(Some("vm-1")).await;
        assert!(routes.contains(&Route::default_via("10.3.1.1".parse().unwrap(), "eth0")));
        assert!(routes.contains(&Route::default_via("fe80::1".parse().unwrap(), "eth0")));

        let veth = kernel.link(None, "veth-2d62b0035f").await.unwrap();
        assert_eq!(veth.master, Some(nr.bridge_name()));
        assert!(veth.up);

        nr.leave("vm-1").await?;
        assert!(!kernel.has_namespace("vm-1").await);
        assert!(kernel.link(None, "veth-2d62b0035f").await.is_none());
        // leaving twice is fine
        nr.leave("vm-1").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_join_ipv4_only_skips_ipv6() -> Result<()> {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);
        nr.create(None).await?;

        let member = nr.join("vm-2", &[Ipv4Addr::new(10, 3, 1, 6)], true, false).await?;
        assert_eq!(member.ipv6, None);
        assert_eq!(kernel.routes_of(Some("vm-2")).await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_join_failure_removes_namespace() -> Result<()> {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);
        nr.create(None).await?;

        kernel.fail_on("set_master", 1).await;
        let result = nr.join("vm-3", &[Ipv4Addr::new(10, 3, 1, 7)], false, false).await;

        assert!(result.is_err());
        assert!(!kernel.has_namespace("vm-3").await);
        assert!(kernel.link(None, &NetResource::workload_veth("vm-3")).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_join_rejects_foreign_address() {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);

        let err = nr.join("vm-4", &[Ipv4Addr::new(10, 9, 0, 2)], false, false).await.unwrap_err();
        assert!(matches!(err, NetworkError::Validation { .. }));
        assert!(nr.join("vm-4", &[], false, false).await.is_err());
        assert_eq!(kernel.call_count("create_namespace").await, 0);
    }

    #[tokio::test]
    async fn test_delete_collapses_any_state() -> Result<()> {
        let kernel = FakeKernel::new();
        let network = fixtures::network(NODE);
        let nr = resource(&kernel, &network);

        // nothing there yet
        nr.delete().await?;

        nr.create(None).await?;
        nr.delete().await?;
        assert!(!kernel.has_namespace(&nr.namespace()).await);
        assert!(kernel.link(None, &nr.bridge_name()).await.is_none());
        Ok(())
    }
}
