//! WireGuard listen port reservations.

use crate::directory::DirectoryService;
use crate::error::{NetworkError, Result};
use crate::logging::log_port_change;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

/// Ports claimed by tenant network resources on this node.
///
/// Every change is published to the directory; when publishing fails the local set is restored.
pub struct PortSet {
    node_id: String,
    reserved: BTreeSet<u16>,
    claimed: Mutex<BTreeSet<u16>>,
    directory: Arc<dyn DirectoryService>,
}

impl PortSet {
    /// `reserved` ports belong to the node itself and can never be claimed.
    pub fn new(node_id: impl Into<String>, reserved: &[u16], directory: Arc<dyn DirectoryService>) -> Self {
        Self {
            node_id: node_id.into(),
            reserved: reserved.iter().copied().collect(),
            claimed: Mutex::new(BTreeSet::new()),
            directory,
        }
    }

    /// Claim `port` and publish the new list.
    pub async fn add(&self, port: u16) -> Result<()> {
        let mut claimed = self.claimed.lock().await;
        if self.reserved.contains(&port) || claimed.contains(&port) {
            return Err(NetworkError::PortConflict { port });
        }

        claimed.insert(port);
        if let Err(e) = self.publish(&claimed).await {
            claimed.remove(&port);
            return Err(e);
        }
        log_port_change(port, true);
        Ok(())
    }

    /// Release `port`. Releasing a port that is not claimed does nothing.
    pub async fn remove(&self, port: u16) -> Result<()> {
        let mut claimed = self.claimed.lock().await;
        if !claimed.remove(&port) {
            return Ok(());
        }

        if let Err(e) = self.publish(&claimed).await {
            claimed.insert(port);
            return Err(e);
        }
        log_port_change(port, false);
        Ok(())
    }

    /// Swap `old` for `new` in a single publish.
    pub async fn replace(&self, old: u16, new: u16) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let mut claimed = self.claimed.lock().await;
        if self.reserved.contains(&new) || claimed.contains(&new) {
            return Err(NetworkError::PortConflict { port: new });
        }

        let had_old = claimed.remove(&old);
        claimed.insert(new);
        if let Err(e) = self.publish(&claimed).await {
            claimed.remove(&new);
            if had_old {
                claimed.insert(old);
            }
            return Err(e);
        }
        log_port_change(old, false);
        log_port_change(new, true);
        Ok(())
    }

    /// Claim ports locally without publishing, used when recovering state at startup.
    pub async fn restore(&self, ports: impl IntoIterator<Item = u16>) {
        let mut claimed = self.claimed.lock().await;
        for port in ports {
            if self.reserved.contains(&port) {
                warn!(port, "persisted network uses a node reserved port");
                continue;
            }
            claimed.insert(port);
        }
    }

    pub async fn list(&self) -> Vec<u16> {
        self.claimed.lock().await.iter().copied().collect()
    }

    pub async fn contains(&self, port: u16) -> bool {
        self.claimed.lock().await.contains(&port)
    }

    async fn publish(&self, claimed: &BTreeSet<u16>) -> Result<()> {
        let ports: Vec<u16> = claimed.iter().copied().collect();
        self.directory
            .publish_wg_ports(&self.node_id, &ports)
            .await
            .map_err(|e| match e {
                NetworkError::Publish { .. } => e,
                other => NetworkError::Publish {
                    reason: other.to_string(),
                },
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MockDirectoryService;
    use mockall::predicate::*;

    fn accepting() -> Arc<dyn DirectoryService> {
        let mut directory = MockDirectoryService::new();
        directory.expect_publish_wg_ports().returning(|_, _| Ok(()));
        Arc::new(directory)
    }

    #[tokio::test]
    async fn test_add_and_conflict() -> Result<()> {
        let ports = PortSet::new("node-1", &[443], accepting());

        ports.add(6010).await?;
        let err = ports.add(6010).await.unwrap_err();
        assert!(matches!(err, NetworkError::PortConflict { port: 6010 }));
        assert_eq!(ports.list().await, vec![6010]);

        // node ports are never handed out
        assert!(matches!(ports.add(443).await, Err(NetworkError::PortConflict { port: 443 })));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_absent_is_noop() -> Result<()> {
        let mut directory = MockDirectoryService::new();
        directory.expect_publish_wg_ports().times(0);
        let ports = PortSet::new("node-1", &[], Arc::new(directory));

        ports.remove(7000).await?;
        assert!(ports.list().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_failure_rolls_back() -> Result<()> {
        let mut directory = MockDirectoryService::new();
        // the directory only ever accepts the first list
        directory
            .expect_publish_wg_ports()
            .with(eq("node-1"), always())
            .returning(|_, ports| {
                if ports == [6010] {
                    Ok(())
                } else {
                    Err(NetworkError::kernel("publish", "directory", "connection refused"))
                }
            });
        let ports = PortSet::new("node-1", &[], Arc::new(directory));

        ports.add(6010).await?;

        let err = ports.add(6011).await.unwrap_err();
        assert!(matches!(err, NetworkError::Publish { .. }));
        assert_eq!(ports.list().await, vec![6010]);

        assert!(ports.remove(6010).await.is_err());
        assert_eq!(ports.list().await, vec![6010]);

        assert!(ports.replace(6010, 6012).await.is_err());
        assert_eq!(ports.list().await, vec![6010]);
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_and_restore() -> Result<()> {
        let ports = PortSet::new("node-1", &[80], accepting());

        ports.restore([6010, 80]).await;
        assert_eq!(ports.list().await, vec![6010]);

        ports.replace(6010, 6020).await?;
        assert!(ports.contains(6020).await);
        assert!(!ports.contains(6010).await);
        Ok(())
    }
}
