//! Coordinator of tenant networks on this node.
//!
//! The [`Networker`] validates network definitions, reserves WireGuard ports, realizes the
//! node's network resource, plugs it into the NDMZ and persists the definition. A failed
//! creation is rolled back before the error is returned.

use crate::config::{NetworkerConfig, NrConfig};
use crate::directory::DirectoryService;
use crate::error::{NetworkError, Result};
use crate::identity::IdentityManager;
use crate::kernel::KernelNetwork;
use crate::logging::log_cleanup_failure;
use crate::ndmz::Ndmz;
use crate::nr::{convert4to6, short_name, Member, NetResource};
use crate::ports::PortSet;
use crate::types::{self, Network};
use crate::versioned::NetworkStore;
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};

/// A compensating action recorded while a network is being created.
enum CleanupStep {
    /// Give back the port this network holds
    ReleasePort(u16),
    /// Drop the persisted record so the network is not recovered on restart
    ForgetNetwork(String),
    DeleteResource(NetResource),
    DetachNdmz(String),
}

/// Compensating actions for one network, run most recent first.
struct Rollback {
    network_id: String,
    ports: Arc<PortSet>,
    ndmz: Arc<dyn Ndmz>,
    store: NetworkStore,
    steps: Vec<CleanupStep>,
}

impl Rollback {
    async fn run(self) {
        for step in self.steps.into_iter().rev() {
            let (name, result) = match step {
                CleanupStep::ReleasePort(port) => ("release port", self.ports.remove(port).await),
                CleanupStep::ForgetNetwork(id) => ("forget network", self.store.remove(&id).await),
                CleanupStep::DeleteResource(nr) => ("delete network resource", nr.delete().await),
                CleanupStep::DetachNdmz(id) => ("detach from ndmz", self.ndmz.detach_nr(&id).await),
            };
            if let Err(e) = result {
                log_cleanup_failure(&self.network_id, name, &e);
            }
        }
    }
}

/// Armed rollback of a creation in progress.
///
/// [`CleanupGuard::disarm`] keeps the work, [`CleanupGuard::run`] undoes it. A guard dropped
/// while still armed (the caller gave up on the future) rolls back on a background task.
struct CleanupGuard {
    pending: Option<Rollback>,
}

impl CleanupGuard {
    fn new(networker: &Networker, network_id: &str) -> Self {
        Self {
            pending: Some(Rollback {
                network_id: network_id.to_string(),
                ports: networker.ports.clone(),
                ndmz: networker.ndmz.clone(),
                store: networker.store.clone(),
                steps: Vec::new(),
            }),
        }
    }

    fn push(&mut self, step: CleanupStep) {
        if let Some(rollback) = self.pending.as_mut() {
            rollback.steps.push(step);
        }
    }

    fn disarm(mut self) {
        self.pending = None;
    }

    async fn run(mut self) {
        if let Some(rollback) = self.pending.take() {
            rollback.run().await;
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let rollback = match self.pending.take() {
            Some(rollback) if !rollback.steps.is_empty() => rollback,
            _ => return,
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(network_id = %rollback.network_id, "network creation interrupted, rolling back");
                handle.spawn(rollback.run());
            }
            Err(_) => error!(
                network_id = %rollback.network_id,
                "network creation interrupted outside a runtime, state left behind"
            ),
        }
    }
}

pub struct Networker {
    identity: Arc<dyn IdentityManager>,
    kernel: Arc<dyn KernelNetwork>,
    ndmz: Arc<dyn Ndmz>,
    store: NetworkStore,
    ports: Arc<PortSet>,
    nr_config: NrConfig,
    nr_public_iface: String,
    public_namespace: Option<String>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Networker {
    /// Build the coordinator and re-claim the ports of every persisted network.
    pub async fn new(
        config: &NetworkerConfig,
        identity: Arc<dyn IdentityManager>,
        kernel: Arc<dyn KernelNetwork>,
        directory: Arc<dyn DirectoryService>,
        ndmz: Arc<dyn Ndmz>,
    ) -> Result<Self> {
        let node_id = identity.node_id();
        let networker = Self {
            ports: Arc::new(PortSet::new(node_id.clone(), &config.reserved_ports, directory)),
            identity,
            kernel,
            ndmz,
            store: NetworkStore::new(config.networks_dir()),
            nr_config: config.nr.clone(),
            nr_public_iface: config.ndmz.nr_public_iface.clone(),
            public_namespace: None,
            locks: Mutex::new(HashMap::new()),
        };

        let mut recovered = Vec::new();
        for network in networker.store.list().await? {
            match network.resource_of(&node_id) {
                Ok(nr) => recovered.push(nr.wg_listen_port),
                Err(_) => warn!(network_id = %network.network_id, "persisted network has no resource for this node"),
            }
        }
        info!(count = recovered.len(), "recovered wireguard ports");
        networker.ports.restore(recovered).await;
        Ok(networker)
    }

    /// Create WireGuard interfaces in `namespace` so their sockets use a dedicated public link.
    pub fn with_public_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.public_namespace = Some(namespace.into());
        self
    }

    async fn lock(&self, network_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(network_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock entry of `network_id` unless another call is holding or waiting on it.
    async fn prune_lock(&self, network_id: &str) {
        let mut locks = self.locks.lock().await;
        if locks.get(network_id).map(|l| Arc::strong_count(l) == 1).unwrap_or(false) {
            locks.remove(network_id);
        }
    }

    fn runtime(&self, network: &Network, resource: &types::NetResource) -> Result<NetResource> {
        NetResource::new(
            self.kernel.clone(),
            network,
            resource,
            self.nr_config.clone(),
            self.nr_public_iface.clone(),
        )
    }

    async fn load(&self, network_id: &str) -> Result<Network> {
        self.store
            .load(network_id)
            .await?
            .ok_or_else(|| NetworkError::not_found(format!("network {}", network_id)))
    }

    async fn load_runtime(&self, network_id: &str) -> Result<NetResource> {
        let network = self.load(network_id).await?;
        let resource = network.resource_of(&self.identity.node_id())?;
        self.runtime(&network, resource)
    }

    async fn private_key(&self, resource: &types::NetResource) -> Result<String> {
        let sealed = hex::decode(&resource.wg_private_key)
            .map_err(|e| NetworkError::validation(format!("wireguard private key is not hex: {}", e)))?;
        let key = self.identity.decrypt(&sealed).await?;
        String::from_utf8(key).map_err(|_| NetworkError::validation("decrypted wireguard key is not valid utf-8"))
    }

    async fn wg_namespace(&self) -> Result<Option<&str>> {
        match self.public_namespace.as_deref() {
            Some(ns) if self.kernel.namespace_exists(ns).await? => Ok(Some(ns)),
            _ => Ok(None),
        }
    }

    /// Create or update this node's resource of `network`. Returns its namespace.
    #[instrument(skip(self, network), fields(network_id = %network.network_id))]
    pub async fn create_nr(&self, network: &Network) -> Result<String> {
        network.validate()?;
        let _guard = self.lock(&network.network_id).await;

        let node_id = self.identity.node_id();
        let resource = network.resource_of(&node_id)?;
        let private_key = self.private_key(resource).await?;
        let nr = self.runtime(network, resource)?;

        let port = resource.wg_listen_port;
        let previous = self
            .store
            .load(&network.network_id)
            .await?
            .and_then(|old| old.resource_of(&node_id).ok().map(|r| r.wg_listen_port));
        match previous {
            Some(old) if old != port => {
                debug!(old, new = port, "listen port changed");
                self.ports.replace(old, port).await?;
            }
            Some(_) if self.ports.contains(port).await => {}
            _ => self.ports.add(port).await?,
        }

        // a failed create or update leaves neither the resource nor its port behind
        let mut cleanup = CleanupGuard::new(self, &network.network_id);
        cleanup.push(CleanupStep::ReleasePort(port));
        cleanup.push(CleanupStep::ForgetNetwork(network.network_id.clone()));

        match self.realize(&nr, network, &private_key, &mut cleanup).await {
            Ok(()) => {
                cleanup.disarm();
                info!(namespace = %nr.namespace(), "network resource ready");
                Ok(nr.namespace())
            }
            Err(e) => {
                warn!(error = %e, "network resource creation failed, rolling back");
                cleanup.run().await;
                Err(e)
            }
        }
    }

    async fn realize(
        &self,
        nr: &NetResource,
        network: &Network,
        private_key: &str,
        cleanup: &mut CleanupGuard,
    ) -> Result<()> {
        cleanup.push(CleanupStep::DeleteResource(nr.clone()));
        nr.create(self.wg_namespace().await?).await?;

        cleanup.push(CleanupStep::DetachNdmz(network.network_id.clone()));
        let ip = self.ndmz.attach_nr(&network.network_id, nr).await?;
        debug!(ndmz_ip = %ip, "attached to ndmz");

        nr.configure_wg(private_key).await?;
        self.store.save(network).await
    }

    /// Tear down this node's resource of `network` and forget it.
    #[instrument(skip(self, network), fields(network_id = %network.network_id))]
    pub async fn delete_nr(&self, network: &Network) -> Result<()> {
        let guard = self.lock(&network.network_id).await;
        let result = self.teardown(network).await;
        drop(guard);

        self.prune_lock(&network.network_id).await;
        result
    }

    async fn teardown(&self, network: &Network) -> Result<()> {
        let resource = network.resource_of(&self.identity.node_id())?;
        let nr = self.runtime(network, resource)?;

        nr.delete().await?;
        self.ports.remove(resource.wg_listen_port).await?;
        self.ndmz.detach_nr(&network.network_id).await?;
        self.store.remove(&network.network_id).await?;
        info!("network resource removed");
        Ok(())
    }

    /// Plug workload namespace `workload_id` into a network.
    #[instrument(skip(self, addrs))]
    pub async fn join(
        &self,
        network_id: &str,
        workload_id: &str,
        addrs: &[Ipv4Addr],
        ipv4_only: bool,
        public_ipv6: bool,
    ) -> Result<Member> {
        let _guard = self.lock(network_id).await;
        let nr = self.load_runtime(network_id).await?;
        nr.join(workload_id, addrs, ipv4_only, public_ipv6).await
    }

    #[instrument(skip(self))]
    pub async fn leave(&self, network_id: &str, workload_id: &str) -> Result<()> {
        let _guard = self.lock(network_id).await;
        let nr = self.load_runtime(network_id).await?;
        nr.leave(workload_id).await
    }

    /// Addresses of `iface`, in the host namespace when `namespace` is `None`.
    pub async fn addrs(&self, iface: &str, namespace: Option<&str>) -> Result<Vec<IpAddr>> {
        let addrs = self.kernel.addrs(namespace, iface).await?;
        Ok(addrs.into_iter().map(|a| a.ip()).collect())
    }

    pub async fn wireguard_ports(&self) -> Vec<u16> {
        self.ports.list().await
    }

    pub async fn get_subnet(&self, network_id: &str) -> Result<Ipv4Network> {
        Ok(self.load_runtime(network_id).await?.subnet())
    }

    /// Gateway addresses workloads of `network_id` route through.
    pub async fn get_default_gw_ip(&self, network_id: &str) -> Result<(Ipv4Addr, Ipv6Addr)> {
        let nr = self.load_runtime(network_id).await?;
        Ok((nr.gateway(), nr.gateway6()))
    }

    pub async fn get_ipv6_from4(&self, network_id: &str, ip: Ipv4Addr) -> Result<Ipv6Addr> {
        let nr = self.load_runtime(network_id).await?;
        if !nr.subnet().contains(ip) {
            return Err(NetworkError::validation(format!(
                "{} is outside network resource subnet {}",
                ip,
                nr.subnet()
            )));
        }
        Ok(convert4to6(network_id, ip))
    }

    pub fn namespace_for(&self, network_id: &str) -> String {
        short_name('n', network_id)
    }

    /// Ok once the gateway namespace is in place.
    pub async fn ready(&self) -> Result<()> {
        let ns = self.ndmz.namespace();
        if self.kernel.namespace_exists(&ns).await? {
            Ok(())
        } else {
            Err(NetworkError::not_found(format!("namespace {}", ns)))
        }
    }
}
