use super::{Gateway, Ndmz, NdmzInterface};
use crate::error::{NetworkError, Result};
use crate::nr::NetResource;
use crate::resilience::{ExponentialBackoffConfig, RetryPolicy};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::Ipv4Addr;
use tracing::info;

/// Gateway for nodes behind a NAT: both public interfaces hang off the management bridge and
/// only IPv4 is expected.
pub struct Hidden {
    gw: Gateway,
    backoff: ExponentialBackoffConfig,
}

impl Hidden {
    pub fn new(gw: Gateway) -> Self {
        Self {
            gw,
            backoff: ExponentialBackoffConfig::unbounded(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Probe DHCP until a default route shows up. Only gateway teardown stops it.
    async fn wait_ip4(&self) -> Result<()> {
        let ns = self.gw.ns();
        let iface = &self.gw.config.pub4_iface;
        let policy = RetryPolicy::new("dhcp on hidden uplink", self.backoff.clone());

        policy
            .execute_until(&self.gw.shutdown, || async move {
                self.gw.kernel.dhcp_probe(Some(ns), iface).await?;
                if self.gw.has_ipv4_route().await? {
                    Ok(())
                } else {
                    Err(NetworkError::kernel("dhcp", iface.as_str(), "no default route after lease"))
                }
            })
            .await
    }
}

#[async_trait]
impl Ndmz for Hidden {
    async fn create(&self) -> Result<()> {
        info!(namespace = %self.gw.ns(), "create hidden ndmz");
        self.gw.prepare(&self.gw.default_bridge).await?;
        self.wait_ip4().await?;
        self.gw.start_watchdog().await;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.gw.delete().await
    }

    async fn stop(&self) {
        self.gw.stop_watchdog().await
    }

    async fn attach_nr(&self, network_id: &str, nr: &NetResource) -> Result<Ipv4Addr> {
        self.gw.attach_nr(network_id, nr).await
    }

    async fn detach_nr(&self, network_id: &str) -> Result<()> {
        self.gw.ipam.release(network_id).await
    }

    async fn set_ip6_public_iface(&self, subnet: IpNetwork) -> Result<()> {
        self.gw.set_addr(&self.gw.config.pub6_iface, subnet).await
    }

    fn supports_pub_ipv4(&self) -> bool {
        false
    }

    fn ip6_public_iface(&self) -> String {
        self.gw.default_bridge.clone()
    }

    async fn is_ipv4_only(&self) -> Result<bool> {
        self.gw.is_ipv4_only().await
    }

    async fn set_ip(&self, subnet: IpNetwork) -> Result<()> {
        self.gw.set_ip(subnet).await
    }

    async fn interfaces(&self) -> Result<Vec<NdmzInterface>> {
        self.gw.interfaces().await
    }

    fn namespace(&self) -> String {
        self.gw.ns().to_string()
    }
}
