//! Node identity.

use crate::error::Result;
use async_trait::async_trait;

/// Owner of the node's key material.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityManager: Send + Sync {
    /// Identity used to find this node's slice of a network.
    fn node_id(&self) -> String;
    /// Decrypt a message sealed for this node.
    async fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Identity for hosts that receive WireGuard keys unsealed, e.g. a development node.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    node_id: String,
}

impl LocalIdentity {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
        }
    }
}

#[async_trait]
impl IdentityManager for LocalIdentity {
    fn node_id(&self) -> String {
        self.node_id.clone()
    }

    async fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>> {
        Ok(message.to_vec())
    }
}
