//! Directory service client.
//!
//! The grid directory keeps, per node, the WireGuard ports in use and the optional public
//! interface configuration. [`FileDirectory`] keeps the same records in a local JSON document.

use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::debug;

/// Public interface configuration of a node with a dedicated public uplink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubIface {
    /// Physical link or bridge the public macvlan hangs off
    pub master: String,
    pub ipv4: Option<IpNetwork>,
    pub ipv6: Option<IpNetwork>,
    pub gw4: Option<IpAddr>,
    pub gw6: Option<IpAddr>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Replace the set of WireGuard ports published for `node_id`.
    async fn publish_wg_ports(&self, node_id: &str, ports: &[u16]) -> Result<()>;
    async fn get_pub_iface(&self, node_id: &str) -> Result<Option<PubIface>>;
    async fn set_public_iface(&self, node_id: &str, iface: &PubIface) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodeRecord {
    #[serde(default)]
    wg_ports: Vec<u16>,
    #[serde(default)]
    pub_iface: Option<PubIface>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    nodes: BTreeMap<String, NodeRecord>,
}

/// Directory kept in a single JSON file.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read(&self) -> Result<Document> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(NetworkError::io(&self.path, e)),
        }
    }

    async fn write(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| NetworkError::io(parent, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)
            .await
            .map_err(|e| NetworkError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| NetworkError::io(&self.path, e))
    }
}

#[async_trait]
impl DirectoryService for FileDirectory {
    async fn publish_wg_ports(&self, node_id: &str, ports: &[u16]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        doc.nodes.entry(node_id.to_string()).or_default().wg_ports = ports.to_vec();
        self.write(&doc).await?;
        debug!(node_id = %node_id, ports = ?ports, "published wireguard ports");
        Ok(())
    }

    async fn get_pub_iface(&self, node_id: &str) -> Result<Option<PubIface>> {
        let _guard = self.lock.lock().await;
        let doc = self.read().await?;
        Ok(doc.nodes.get(node_id).and_then(|n| n.pub_iface.clone()))
    }

    async fn set_public_iface(&self, node_id: &str, iface: &PubIface) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read().await?;
        doc.nodes.entry(node_id.to_string()).or_default().pub_iface = Some(iface.clone());
        self.write(&doc).await
    }
}
