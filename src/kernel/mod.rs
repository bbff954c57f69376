//! Kernel network control.
//!
//! Every policy in this crate is expressed against [`KernelNetwork`]. A namespace argument of
//! `None` targets the host namespace. Implementations must treat "already exists" on creation
//! as success so callers can retry any step.

mod command;

pub use command::CommandKernel;

use crate::error::Result;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Link types the policies care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkKind {
    /// Physical NIC
    Device,
    Loopback,
    Bridge,
    Macvlan,
    Veth,
    Wireguard,
    Other(String),
}

impl LinkKind {
    /// Map the `linkinfo.info_kind` reported by iproute2.
    pub fn from_info_kind(kind: Option<&str>, link_type: &str) -> Self {
        match kind {
            Some("bridge") => LinkKind::Bridge,
            Some("macvlan") => LinkKind::Macvlan,
            Some("veth") => LinkKind::Veth,
            Some("wireguard") => LinkKind::Wireguard,
            Some(other) => LinkKind::Other(other.to_string()),
            None if link_type == "loopback" => LinkKind::Loopback,
            None if link_type == "ether" => LinkKind::Device,
            None => LinkKind::Other(link_type.to_string()),
        }
    }
}

/// Snapshot of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub kind: LinkKind,
    /// Name of the bridge this link is enslaved to
    pub master: Option<String>,
    pub up: bool,
    pub carrier: bool,
    pub mac: Option<String>,
}

impl Link {
    pub fn is_physical(&self) -> bool {
        self.kind == LinkKind::Device
    }
}

/// A routing table entry. A missing destination is a default route through `gateway`; routes
/// read back from the kernel always carry an explicit `0.0.0.0/0` or `::/0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dst: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub device: Option<String>,
}

impl Route {
    pub fn default_via(gateway: IpAddr, device: &str) -> Self {
        Self {
            dst: None,
            gateway: Some(gateway),
            device: Some(device.to_string()),
        }
    }

    /// Default route straight out of `device`, without a next hop.
    pub fn default_dev(ipv4: bool, device: &str) -> Self {
        let any: IpAddr = if ipv4 {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        Self {
            dst: IpNetwork::new(any, 0).ok(),
            gateway: None,
            device: Some(device.to_string()),
        }
    }

    pub fn to(dst: IpNetwork, gateway: Option<IpAddr>, device: &str) -> Self {
        Self {
            dst: Some(dst),
            gateway,
            device: Some(device.to_string()),
        }
    }

    pub fn is_default(&self) -> bool {
        match self.dst {
            None => true,
            Some(dst) => dst.prefix() == 0,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        match (self.dst, self.gateway) {
            (Some(dst), _) => dst.is_ipv4(),
            (None, Some(gw)) => gw.is_ipv4(),
            (None, None) => false,
        }
    }

    /// Gateway of this route when it is a default route.
    pub fn default_gateway(&self) -> Option<IpAddr> {
        if self.is_default() {
            self.gateway
        } else {
            None
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dst {
            Some(dst) => write!(f, "{}", dst)?,
            None => write!(f, "default")?,
        }
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(dev) = &self.device {
            write!(f, " dev {}", dev)?;
        }
        Ok(())
    }
}

/// A WireGuard peer as handed to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgPeerConfig {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub allowed_ips: Vec<IpNetwork>,
    pub keepalive_secs: Option<u16>,
}

/// Full WireGuard device configuration.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgDeviceConfig {
    /// Base64 encoded private key
    pub private_key: String,
    pub listen_port: u16,
    pub peers: Vec<WgPeerConfig>,
}

impl fmt::Debug for WgDeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgDeviceConfig")
            .field("private_key", &"<redacted>")
            .field("listen_port", &self.listen_port)
            .field("peers", &self.peers)
            .finish()
    }
}

/// Kernel network control capability.
#[async_trait]
pub trait KernelNetwork: Send + Sync {
    async fn list_links(&self, netns: Option<&str>) -> Result<Vec<Link>>;
    async fn get_link(&self, netns: Option<&str>, name: &str) -> Result<Option<Link>>;

    async fn link_exists(&self, netns: Option<&str>, name: &str) -> Result<bool> {
        Ok(self.get_link(netns, name).await?.is_some())
    }

    /// Create a bridge in the host namespace.
    async fn create_bridge(&self, name: &str) -> Result<()>;
    /// Create a bridge-mode macvlan on `master` (host namespace), placed into `netns`.
    async fn create_macvlan(&self, name: &str, master: &str, netns: Option<&str>) -> Result<()>;
    /// Create a veth pair: `name` inside `netns`, `peer` in the host namespace.
    async fn create_veth(&self, name: &str, peer: &str, netns: &str, mtu: u32) -> Result<()>;
    async fn create_wireguard(&self, netns: Option<&str>, name: &str) -> Result<()>;
    /// Move a link between namespaces, keeping its identity.
    async fn move_link(&self, from: Option<&str>, name: &str, to: Option<&str>) -> Result<()>;
    async fn delete_link(&self, netns: Option<&str>, name: &str) -> Result<()>;
    async fn set_master(&self, name: &str, master: &str) -> Result<()>;
    async fn set_link_up(&self, netns: Option<&str>, name: &str) -> Result<()>;
    async fn set_mac(&self, netns: Option<&str>, name: &str, mac: &str) -> Result<()>;

    async fn addrs(&self, netns: Option<&str>, name: &str) -> Result<Vec<IpNetwork>>;
    async fn add_addr(&self, netns: Option<&str>, name: &str, addr: IpNetwork) -> Result<()>;
    async fn del_addr(&self, netns: Option<&str>, name: &str, addr: IpNetwork) -> Result<()>;

    async fn routes(&self, netns: Option<&str>) -> Result<Vec<Route>>;
    async fn add_route(&self, netns: Option<&str>, route: &Route) -> Result<()>;
    /// Resolve the route the kernel would use for `dst`.
    async fn route_get(&self, netns: Option<&str>, dst: IpAddr) -> Result<Option<Route>>;

    async fn namespace_exists(&self, name: &str) -> Result<bool>;
    async fn create_namespace(&self, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn sysctl(&self, netns: Option<&str>, key: &str, value: &str) -> Result<()>;
    /// Load an nft ruleset, replacing what the namespace had.
    async fn apply_firewall(&self, netns: Option<&str>, ruleset: &str) -> Result<()>;
    async fn configure_wireguard(&self, netns: Option<&str>, name: &str, config: &WgDeviceConfig) -> Result<()>;

    /// Run a one-shot DHCP client on `iface` and wait for it to exit.
    async fn dhcp_probe(&self, netns: Option<&str>, iface: &str) -> Result<()>;
}

/// Whether `name` has a default route of the given family inside `netns`.
pub async fn has_default_route(
    kernel: &dyn KernelNetwork,
    netns: Option<&str>,
    iface: &str,
    ipv4: bool,
) -> Result<bool> {
    let routes = kernel.routes(netns).await?;
    Ok(routes.iter().any(|r| {
        r.is_default() && r.is_ipv4() == ipv4 && r.device.as_deref() == Some(iface)
    }))
}
