//! Declarative tenant network definitions.

use crate::error::{NetworkError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

const WG_KEY_LEN: usize = 32;

/// A tenant's network, spanning one or more nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub network_id: String,
    pub name: String,
    /// Private address space of the whole network
    pub ip_range: Option<IpNetwork>,
    #[serde(default)]
    pub net_resources: Vec<NetResource>,
}

/// One node's slice of a [`Network`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetResource {
    pub node_id: String,
    pub subnet: Option<IpNetwork>,
    /// Hex encoded private key, encrypted for the owning node
    pub wg_private_key: String,
    pub wg_public_key: String,
    pub wg_listen_port: u16,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

/// A remote member of the WireGuard mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub subnet: Option<IpNetwork>,
    pub wg_public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<IpNetwork>,
    /// `ip:port` the peer is reachable on, absent for peers behind NAT
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn validate_public_key(key: &str, what: &str) -> Result<()> {
    if key.is_empty() {
        return Err(NetworkError::validation(format!("{} cannot be empty", what)));
    }
    match STANDARD.decode(key) {
        Ok(raw) if raw.len() == WG_KEY_LEN => Ok(()),
        _ => Err(NetworkError::validation(format!("{} is not a valid wireguard key", what))),
    }
}

impl Network {
    /// Check the whole definition. Nothing touches the kernel before this passes.
    pub fn validate(&self) -> Result<()> {
        if self.network_id.is_empty() {
            return Err(NetworkError::validation("network ID cannot be empty"));
        }
        if self.network_id.starts_with('.')
            || !self
                .network_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(NetworkError::validation(format!(
                "network ID {:?} may only hold letters, digits, '-', '_' and inner dots",
                self.network_id
            )));
        }
        if self.name.is_empty() {
            return Err(NetworkError::validation("network name cannot be empty"));
        }
        if self.ip_range.is_none() {
            return Err(NetworkError::validation("network IP range cannot be empty"));
        }
        if self.net_resources.is_empty() {
            return Err(NetworkError::validation(
                "network needs at least one network resource",
            ));
        }

        for nr in &self.net_resources {
            nr.validate()?;
        }
        Ok(())
    }

    /// The resource owned by `node_id`.
    pub fn resource_of(&self, node_id: &str) -> Result<&NetResource> {
        self.net_resources
            .iter()
            .find(|nr| nr.node_id == node_id)
            .ok_or_else(|| {
                NetworkError::not_found(format!(
                    "network resource for node {} in network {}",
                    node_id, self.network_id
                ))
            })
    }
}

impl NetResource {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(NetworkError::validation("network resource node ID cannot be empty"));
        }
        match self.subnet {
            None => return Err(NetworkError::validation("network resource subnet cannot be empty")),
            Some(IpNetwork::V6(_)) => {
                return Err(NetworkError::validation("network resource subnet must be IPv4"))
            }
            Some(IpNetwork::V4(_)) => {}
        }
        if self.wg_private_key.is_empty() {
            return Err(NetworkError::validation("wireguard private key cannot be empty"));
        }
        validate_public_key(&self.wg_public_key, "wireguard public key")?;
        if self.wg_listen_port == 0 {
            return Err(NetworkError::validation("wireguard listen port cannot be empty"));
        }

        for peer in &self.peers {
            peer.validate()?;
        }
        Ok(())
    }
}

impl Peer {
    pub fn validate(&self) -> Result<()> {
        if self.subnet.is_none() {
            return Err(NetworkError::validation("peer wireguard subnet cannot be empty"));
        }
        validate_public_key(&self.wg_public_key, "peer wireguard public key")?;
        if self.allowed_ips.is_empty() {
            return Err(NetworkError::validation("peer wireguard allowed IPs cannot be empty"));
        }
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            endpoint.parse::<SocketAddr>().map_err(|_| {
                NetworkError::validation(format!("peer endpoint {} is not a valid ip:port", endpoint))
            })?;
        }
        Ok(())
    }
}
