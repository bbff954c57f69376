//! Configuration for the network daemon.
//!
//! Every name, pool and timeout the subsystems use is carried here so that tests can run with
//! alternate ranges. Missing fields fall back to the node defaults.

use crate::error::{NetworkError, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_STORAGE_ROOT: &str = "/var/cache/modules/networkd";
const DEFAULT_BRIDGE: &str = "zos";
const DEFAULT_ZINIT_DIR: &str = "/etc/zinit";

/// Top level configuration handed to the [`Networker`](crate::networker::Networker).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkerConfig {
    /// Root directory for persisted network records and leases
    pub storage_root: PathBuf,
    /// Identity of this node, used by the local identity manager
    pub node_id: String,
    /// Name of the management bridge the selected NIC is attached to
    pub default_bridge: String,
    /// Ports tenants can never claim for WireGuard
    pub reserved_ports: Vec<u16>,
    pub ndmz: NdmzConfig,
    pub nr: NrConfig,
    pub bootstrap: BootstrapConfig,
    pub dhcp: DhcpConfig,
    /// Directory the process supervisor loads service definitions from
    pub zinit_config_dir: PathBuf,
}

impl Default for NetworkerConfig {
    fn default() -> Self {
        let ndmz = NdmzConfig::default();
        let mut reserved_ports = vec![80, 443, 8082];
        reserved_ports.extend(ndmz.overlay_ports.iter().copied());

        Self {
            storage_root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            node_id: String::new(),
            default_bridge: DEFAULT_BRIDGE.to_string(),
            reserved_ports,
            ndmz,
            nr: NrConfig::default(),
            bootstrap: BootstrapConfig::default(),
            dhcp: DhcpConfig::default(),
            zinit_config_dir: PathBuf::from(DEFAULT_ZINIT_DIR),
        }
    }
}

impl NetworkerConfig {
    /// Load the configuration from a JSON file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let data = tokio::fs::read(path)
            .await
            .map_err(|e| NetworkError::io(path, e))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NetworkError::io(parent, e))?;
        }

        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| NetworkError::io(path, e))
    }

    /// Directory holding one versioned record per network ID.
    pub fn networks_dir(&self) -> PathBuf {
        self.storage_root.join("networks")
    }

    /// Directory holding the NDMZ IPAM lease store.
    pub fn leases_dir(&self) -> PathBuf {
        self.storage_root.join("leases")
    }

    pub fn directory_file(&self) -> PathBuf {
        self.storage_root.join("directory.json")
    }
}

/// Names and address plan of the public gateway namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NdmzConfig {
    pub namespace: String,
    /// Host bridge every NR attaches its `public` macvlan to
    pub bridge: String,
    pub pub4_iface: String,
    pub pub6_iface: String,
    pub tonrs_iface: String,
    /// Name of the NDMZ-facing interface inside each NR namespace
    pub nr_public_iface: String,
    /// Pool private NR addresses are leased from
    pub pool: Ipv4Network,
    pub gateway: Ipv4Addr,
    /// Ports of the node-wide overlay daemon, opened in the NDMZ firewall
    pub overlay_ports: Vec<u16>,
    /// Address probed to decide whether SLAAC gave us a route
    pub ipv6_probe: String,
    /// Bound on the SLAAC wait
    #[serde(with = "duration_secs")]
    pub slaac_timeout: Duration,
    /// Bound on the DualStack DHCP wait
    #[serde(with = "duration_secs")]
    pub dhcp_timeout: Duration,
}

impl Default for NdmzConfig {
    fn default() -> Self {
        Self {
            namespace: "ndmz".to_string(),
            bridge: "br-ndmz".to_string(),
            pub4_iface: "npub4".to_string(),
            pub6_iface: "npub6".to_string(),
            tonrs_iface: "tonrs".to_string(),
            nr_public_iface: "public".to_string(),
            pool: Ipv4Network::new(Ipv4Addr::new(100, 127, 0, 0), 16)
                .unwrap_or_else(|_| unreachable!("valid literal prefix")),
            gateway: Ipv4Addr::new(100, 127, 0, 1),
            overlay_ports: vec![9943, 9944, 9945],
            ipv6_probe: "2606:4700:4700::1111".to_string(),
            slaac_timeout: Duration::from_secs(122),
            dhcp_timeout: Duration::from_secs(30),
        }
    }
}

/// Per tenant network resource settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NrConfig {
    /// Overlay range the WireGuard interface addresses live in
    pub wg_overlay: Ipv4Network,
    pub wg_keepalive_secs: u16,
    pub veth_mtu: u32,
    /// Prefix length given to workload addresses
    pub workload_prefix: u8,
}

impl Default for NrConfig {
    fn default() -> Self {
        Self {
            wg_overlay: Ipv4Network::new(Ipv4Addr::new(100, 64, 0, 0), 16)
                .unwrap_or_else(|_| unreachable!("valid literal prefix")),
            wg_keepalive_secs: 20,
            veth_mtu: 1500,
            workload_prefix: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// How long to wait for a link carrier before skipping the link
    #[serde(with = "duration_secs")]
    pub carrier_timeout: Duration,
    /// How long a single link probe may wait for addresses
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            carrier_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(122),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhcpConfig {
    pub udhcpc: String,
    pub script: String,
    /// Interval of the lease-loss watchdog
    #[serde(with = "duration_secs")]
    pub watchdog_interval: Duration,
    #[serde(with = "duration_secs")]
    pub stop_timeout: Duration,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            udhcpc: "/sbin/udhcpc".to_string(),
            script: "/usr/share/udhcp/simple.script".to_string(),
            watchdog_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
