use super::{Gateway, Ndmz, NdmzInterface};
use crate::error::Result;
use crate::nr::NetResource;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::Ipv4Addr;
use tracing::info;

/// Gateway for nodes with public IPv4 and IPv6 on their uplink.
///
/// `npub4` sits on the management bridge and gets its address over DHCP, `npub6` sits on the
/// public master and configures itself through SLAAC.
pub struct DualStack {
    gw: Gateway,
}

impl DualStack {
    pub fn new(gw: Gateway) -> Self {
        Self { gw }
    }
}

#[async_trait]
impl Ndmz for DualStack {
    async fn create(&self) -> Result<()> {
        info!(namespace = %self.gw.ns(), master = %self.gw.public_master, "create dual stack ndmz");
        self.gw.prepare(&self.gw.public_master).await?;
        self.gw.wait_ip4(self.gw.config.dhcp_timeout).await?;
        self.gw.wait_ip6().await?;

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
        true
    }

    fn ip6_public_iface(&self) -> String {
        self.gw.public_master.clone()
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
