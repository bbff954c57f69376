#![allow(dead_code)]

use gridnet::identity::LocalIdentity;
use gridnet::ipam::IpamStore;
use gridnet::ndmz::{Gateway, Ndmz};
use gridnet::testing::{DhcpLease, FakeKernel, MemoryDirectory, RecordingSupervisor, Slaac};
use gridnet::types::{NetResource, Network, Peer};
use gridnet::{build_ndmz, GatewayMode, Networker, NetworkerConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const NODE: &str = "node-1";
pub const PUBLIC_KEY: &str = "kW8DvSSlkOEX8ZCrgpGJH6XVZ2mXg4tTb/xMbr6ESW8=";
pub const PEER_KEY: &str = "yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=";

/// A node with one uplink answering DHCP and router advertisements.
pub struct Node {
    pub kernel: FakeKernel,
    pub directory: MemoryDirectory,
    pub supervisor: RecordingSupervisor,
    pub config: NetworkerConfig,
    pub ndmz: Arc<dyn Ndmz>,
    pub networker: Networker,
    _root: TempDir,
}

impl Node {
    pub async fn start() -> Self {
        let root = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        kernel.add_bridge("zos").await;
        kernel
            .script_dhcp(
                "npub4",
                DhcpLease {
                    addr4: "185.69.166.20/24".parse().unwrap(),
                    gateway: "185.69.166.1".parse().unwrap(),
                    addrs6: vec![],
                },
            )
            .await;
        kernel
            .script_slaac(
                "npub6",
                Slaac {
                    addr6: "2a02:1802:5e:0:1000::20/64".parse().unwrap(),
                    gateway6: "fe80::1".parse().unwrap(),
                },
            )
            .await;

        let mut config = NetworkerConfig::default();
        config.node_id = NODE.to_string();
        config.storage_root = root.path().to_path_buf();
        config.dhcp.watchdog_interval = Duration::from_millis(20);

        let supervisor = RecordingSupervisor::new();
        let ipam = IpamStore::open(&config.leases_dir(), config.ndmz.pool, config.ndmz.gateway)
            .await
            .unwrap();
        let gateway = Gateway::new(Arc::new(kernel.clone()), Arc::new(supervisor.clone()), ipam, &config);
        let ndmz = build_ndmz(GatewayMode::DualStack, gateway);
        ndmz.create().await.unwrap();

        let directory = MemoryDirectory::new();
        let networker = Networker::new(
            &config,
            Arc::new(LocalIdentity::new(NODE)),
            Arc::new(kernel.clone()),
            Arc::new(directory.clone()),
            ndmz.clone(),
        )
        .await
        .unwrap();

        Self {
            kernel,
            directory,
            supervisor,
            config,
            ndmz,
            networker,
            _root: root,
        }
    }
}

pub fn network(id: &str, subnet: &str, port: u16) -> Network {
    Network {
        network_id: id.to_string(),
        name: format!("{}-name", id),
        ip_range: Some("10.3.0.0/16".parse().unwrap()),
        net_resources: vec![NetResource {
            node_id: NODE.to_string(),
            subnet: Some(subnet.parse().unwrap()),
            wg_private_key: hex::encode("wg-private-key"),
            wg_public_key: PUBLIC_KEY.to_string(),
            wg_listen_port: port,
            peers: vec![Peer {
                subnet: Some("10.3.9.0/24".parse().unwrap()),
                wg_public_key: PEER_KEY.to_string(),
                allowed_ips: vec!["10.3.9.0/24".parse().unwrap(), "100.64.3.9/32".parse().unwrap()],
                endpoint: Some("185.69.166.9:7000".to_string()),
            }],
        }],
    }
}
