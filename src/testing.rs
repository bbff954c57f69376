//! In-memory collaborators for tests.
//!
//! [`FakeKernel`] keeps namespaces, links, addresses and routes in maps and records every call,
//! so provisioning flows can be exercised end to end without root. Enable the `test` feature to
//! use these from integration tests.

use crate::directory::{DirectoryService, PubIface};
use crate::error::{NetworkError, Result};
use crate::kernel::{KernelNetwork, Link, LinkKind, Route, WgDeviceConfig};
use crate::supervisor::{ProcessSupervisor, ServiceSpec, ServiceState, ServiceStatus};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

type Key = (Option<String>, String);

fn key(netns: Option<&str>, name: &str) -> Key {
    (netns.map(str::to_string), name.to_string())
}

/// What a scripted DHCP server hands out on one link.
#[derive(Debug, Clone)]
pub struct DhcpLease {
    pub addr4: IpNetwork,
    pub gateway: IpAddr,
    /// Addresses SLAAC configures on the same link
    pub addrs6: Vec<IpNetwork>,
}

/// Router advertisement seen on a link once it comes up.
#[derive(Debug, Clone)]
pub struct Slaac {
    pub addr6: IpNetwork,
    pub gateway6: IpAddr,
}

#[derive(Debug, Clone)]
struct FakeLink {
    link: Link,
    addrs: Vec<IpNetwork>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeSet<String>,
    links: BTreeMap<Key, FakeLink>,
    routes: HashMap<Option<String>, Vec<Route>>,
    sysctls: BTreeMap<Key, String>,
    firewalls: HashMap<Option<String>, String>,
    wireguard: BTreeMap<Key, WgDeviceConfig>,
    leases: HashMap<String, DhcpLease>,
    slaac: HashMap<String, Slaac>,
    calls: Vec<String>,
    failures: HashMap<String, usize>,
    stalls: BTreeSet<String>,
}

impl State {
    fn ns_check(&self, op: &str, netns: Option<&str>) -> Result<()> {
        match netns {
            Some(ns) if !self.namespaces.contains(ns) => Err(NetworkError::kernel(
                op,
                ns,
                format!("Cannot open network namespace \"{}\": No such file or directory", ns),
            )),
            _ => Ok(()),
        }
    }

    fn link_mut(&mut self, op: &str, netns: Option<&str>, name: &str) -> Result<&mut FakeLink> {
        self.ns_check(op, netns)?;
        self.links
            .get_mut(&key(netns, name))
            .ok_or_else(|| NetworkError::kernel(op, name, format!("Cannot find device \"{}\"", name)))
    }

    fn insert_link(&mut self, netns: Option<&str>, name: &str, kind: LinkKind, master: Option<&str>) {
        self.links.entry(key(netns, name)).or_insert_with(|| FakeLink {
            link: Link {
                name: name.to_string(),
                kind,
                master: master.map(str::to_string),
                up: false,
                carrier: true,
                mac: None,
            },
            addrs: Vec::new(),
        });
    }

    /// Drop routes that went through a link that no longer exists.
    fn prune_routes(&mut self, netns: Option<&str>, name: &str) {
        if let Some(routes) = self.routes.get_mut(&netns.map(str::to_string)) {
            routes.retain(|r| r.device.as_deref() != Some(name));
        }
    }
}

/// Kernel network control kept entirely in memory.
#[derive(Clone, Default)]
pub struct FakeKernel {
    state: Arc<Mutex<State>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a physical NIC into the host namespace.
    pub async fn add_physical(&self, name: &str, mac: &str, carrier: bool) {
        let mut state = self.state.lock().await;
        state.links.insert(
            key(None, name),
            FakeLink {
                link: Link {
                    name: name.to_string(),
                    kind: LinkKind::Device,
                    master: None,
                    up: false,
                    carrier,
                    mac: Some(mac.to_string()),
                },
                addrs: Vec::new(),
            },
        );
    }

    /// Create a host bridge outside of any policy, e.g. a pre-existing management bridge.
    pub async fn add_bridge(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.insert_link(None, name, LinkKind::Bridge, None);
    }

    /// Make DHCP on `iface` succeed with `lease`.
    pub async fn script_dhcp(&self, iface: &str, lease: DhcpLease) {
        self.state.lock().await.leases.insert(iface.to_string(), lease);
    }

    /// Make SLAAC configure `iface` whenever it is brought up.
    pub async fn script_slaac(&self, iface: &str, slaac: Slaac) {
        self.state.lock().await.slaac.insert(iface.to_string(), slaac);
    }

    /// Fail the next `times` calls of `op` (the trait method name).
    pub async fn fail_on(&self, op: &str, times: usize) {
        self.state.lock().await.failures.insert(op.to_string(), times);
    }

    /// Make the next call of `op` hang forever, like a kernel call that never returns.
    pub async fn stall_on(&self, op: &str) {
        self.state.lock().await.stalls.insert(op.to_string());
    }

    /// Names of all trait methods invoked so far, in order.
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn call_count(&self, op: &str) -> usize {
        self.state.lock().await.calls.iter().filter(|c| *c == op).count()
    }

    pub async fn link(&self, netns: Option<&str>, name: &str) -> Option<Link> {
        self.state.lock().await.links.get(&key(netns, name)).map(|l| l.link.clone())
    }

    pub async fn links_in(&self, netns: Option<&str>) -> Vec<String> {
        let ns = netns.map(str::to_string);
        self.state
            .lock()
            .await
            .links
            .keys()
            .filter(|(n, _)| *n == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub async fn addrs_of(&self, netns: Option<&str>, name: &str) -> Vec<IpNetwork> {
        self.state
            .lock()
            .await
            .links
            .get(&key(netns, name))
            .map(|l| l.addrs.clone())
            .unwrap_or_default()
    }

    pub async fn routes_of(&self, netns: Option<&str>) -> Vec<Route> {
        self.state
            .lock()
            .await
            .routes
            .get(&netns.map(str::to_string))
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every route leaving through `iface`, as when a DHCP lease expires.
    pub async fn drop_routes(&self, netns: Option<&str>, iface: &str) {
        self.state.lock().await.prune_routes(netns, iface);
    }

    pub async fn sysctl_value(&self, netns: Option<&str>, key_name: &str) -> Option<String> {
        self.state.lock().await.sysctls.get(&key(netns, key_name)).cloned()
    }

    pub async fn firewall(&self, netns: Option<&str>) -> Option<String> {
        self.state.lock().await.firewalls.get(&netns.map(str::to_string)).cloned()
    }

    pub async fn wg_config(&self, netns: Option<&str>, name: &str) -> Option<WgDeviceConfig> {
        self.state.lock().await.wireguard.get(&key(netns, name)).cloned()
    }

    pub async fn has_namespace(&self, name: &str) -> bool {
        self.state.lock().await.namespaces.contains(name)
    }

    async fn enter(&self, op: &str) -> Result<tokio::sync::MutexGuard<'_, State>> {
        let mut state = self.state.lock().await;
        state.calls.push(op.to_string());
        debug!("[FAKE] {}", op);
        if state.stalls.remove(op) {
            drop(state);
            return std::future::pending().await;
        }
        if let Some(remaining) = state.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(NetworkError::kernel(op, "fake", "injected failure"));
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl KernelNetwork for FakeKernel {
    async fn list_links(&self, netns: Option<&str>) -> Result<Vec<Link>> {
        let state = self.enter("list_links").await?;
        state.ns_check("list_links", netns)?;
        let ns = netns.map(str::to_string);
        Ok(state
            .links
            .iter()
            .filter(|((n, _), _)| *n == ns)
            .map(|(_, l)| l.link.clone())
            .collect())
    }

    async fn get_link(&self, netns: Option<&str>, name: &str) -> Result<Option<Link>> {
        let state = self.enter("get_link").await?;
        state.ns_check("get_link", netns)?;
        Ok(state.links.get(&key(netns, name)).map(|l| l.link.clone()))
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        let mut state = self.enter("create_bridge").await?;
        state.insert_link(None, name, LinkKind::Bridge, None);
        Ok(())
    }

    async fn create_macvlan(&self, name: &str, master: &str, netns: Option<&str>) -> Result<()> {
        let mut state = self.enter("create_macvlan").await?;
        state.ns_check("create_macvlan", netns)?;
        if !state.links.contains_key(&key(None, master)) {
            return Err(NetworkError::kernel("create_macvlan", master, "Cannot find device"));
        }
        state.insert_link(netns, name, LinkKind::Macvlan, Some(master));
        Ok(())
    }

    async fn create_veth(&self, name: &str, peer: &str, netns: &str, _mtu: u32) -> Result<()> {
        let mut state = self.enter("create_veth").await?;
        state.ns_check("create_veth", Some(netns))?;
        if state.links.contains_key(&key(None, peer)) {
            return Err(NetworkError::kernel("create_veth", peer, "File exists"));
        }
        state.insert_link(Some(netns), name, LinkKind::Veth, None);
        state.insert_link(None, peer, LinkKind::Veth, None);
        Ok(())
    }

    async fn create_wireguard(&self, netns: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.enter("create_wireguard").await?;
        state.ns_check("create_wireguard", netns)?;
        state.insert_link(netns, name, LinkKind::Wireguard, None);
        Ok(())
    }

    async fn move_link(&self, from: Option<&str>, name: &str, to: Option<&str>) -> Result<()> {
        let mut state = self.enter("move_link").await?;
        state.ns_check("move_link", to)?;
        state.link_mut("move_link", from, name)?;
        if let Some(mut link) = state.links.remove(&key(from, name)) {
            // addresses do not survive a namespace change
            link.addrs.clear();
            link.link.up = false;
            link.link.master = None;
            state.links.insert(key(to, name), link);
        }
        state.prune_routes(from, name);
        if let Some(config) = state.wireguard.remove(&key(from, name)) {
            state.wireguard.insert(key(to, name), config);
        }
        Ok(())
    }

    async fn delete_link(&self, netns: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.enter("delete_link").await?;
        state.ns_check("delete_link", netns)?;
        if state.links.remove(&key(netns, name)).is_some() {
            state.prune_routes(netns, name);
            for link in state.links.values_mut() {
                if link.link.master.as_deref() == Some(name) {
                    link.link.master = None;
                }
            }
        }
        Ok(())
    }

    async fn set_master(&self, name: &str, master: &str) -> Result<()> {
        let mut state = self.enter("set_master").await?;
        if !state.links.contains_key(&key(None, master)) {
            return Err(NetworkError::kernel("set_master", master, "Cannot find device"));
        }
        state.link_mut("set_master", None, name)?.link.master = Some(master.to_string());
        Ok(())
    }

    async fn set_link_up(&self, netns: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.enter("set_link_up").await?;
        if name == "lo" {
            state.ns_check("set_link_up", netns)?;
            return Ok(());
        }
        state.link_mut("set_link_up", netns, name)?.link.up = true;

        if let Some(slaac) = state.slaac.get(name).cloned() {
            let link = state.link_mut("set_link_up", netns, name)?;
            if !link.addrs.contains(&slaac.addr6) {
                link.addrs.push(slaac.addr6);
            }
            let route = Route::default_via(slaac.gateway6, name);
            let routes = state.routes.entry(netns.map(str::to_string)).or_default();
            if !routes.contains(&route) {
                routes.push(route);
            }
        }
        Ok(())
    }

    async fn set_mac(&self, netns: Option<&str>, name: &str, mac: &str) -> Result<()> {
        let mut state = self.enter("set_mac").await?;
        state.link_mut("set_mac", netns, name)?.link.mac = Some(mac.to_string());
        Ok(())
    }

    async fn addrs(&self, netns: Option<&str>, name: &str) -> Result<Vec<IpNetwork>> {
        let mut state = self.enter("addrs").await?;
        Ok(state.link_mut("addrs", netns, name)?.addrs.clone())
    }

    async fn add_addr(&self, netns: Option<&str>, name: &str, addr: IpNetwork) -> Result<()> {
        let mut state = self.enter("add_addr").await?;
        let link = state.link_mut("add_addr", netns, name)?;
        if !link.addrs.contains(&addr) {
            link.addrs.push(addr);
        }
        Ok(())
    }

    async fn del_addr(&self, netns: Option<&str>, name: &str, addr: IpNetwork) -> Result<()> {
        let mut state = self.enter("del_addr").await?;
        state.link_mut("del_addr", netns, name)?.addrs.retain(|a| *a != addr);
        Ok(())
    }

    async fn routes(&self, netns: Option<&str>) -> Result<Vec<Route>> {
        let state = self.enter("routes").await?;
        state.ns_check("routes", netns)?;
        Ok(state.routes.get(&netns.map(str::to_string)).cloned().unwrap_or_default())
    }

    async fn add_route(&self, netns: Option<&str>, route: &Route) -> Result<()> {
        let mut state = self.enter("add_route").await?;
        if let Some(dev) = &route.device {
            state.link_mut("add_route", netns, dev)?;
        }
        let routes = state.routes.entry(netns.map(str::to_string)).or_default();
        if !routes.contains(route) {
            routes.push(route.clone());
        }
        Ok(())
    }

    async fn route_get(&self, netns: Option<&str>, dst: IpAddr) -> Result<Option<Route>> {
        let state = self.enter("route_get").await?;
        state.ns_check("route_get", netns)?;
        let routes = state.routes.get(&netns.map(str::to_string)).cloned().unwrap_or_default();
        let specific = routes
            .iter()
            .filter(|r| r.dst.map(|d| d.contains(dst) && d.prefix() > 0).unwrap_or(false))
            .max_by_key(|r| r.dst.map(|d| d.prefix()).unwrap_or(0))
            .cloned();
        Ok(specific.or_else(|| {
            routes
                .into_iter()
                .find(|r| r.is_default() && r.is_ipv4() == dst.is_ipv4())
        }))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let state = self.enter("namespace_exists").await?;
        Ok(state.namespaces.contains(name))
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.enter("create_namespace").await?;
        state.namespaces.insert(name.to_string());
        state.insert_link(Some(name), "lo", LinkKind::Loopback, None);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.enter("delete_namespace").await?;
        if !state.namespaces.remove(name) {
            return Ok(());
        }
        let ns = Some(name.to_string());
        let inside: Vec<Key> = state.links.keys().filter(|(n, _)| *n == ns).cloned().collect();
        for k in inside {
            if let Some(mut link) = state.links.remove(&k) {
                // physical links fall back to the host namespace
                if link.link.kind == LinkKind::Device {
                    link.addrs.clear();
                    link.link.up = false;
                    state.links.insert((None, k.1.clone()), link);
                }
            }
        }
        state.routes.remove(&ns);
        state.firewalls.remove(&ns);
        state.sysctls.retain(|(n, _), _| *n != ns);
        state.wireguard.retain(|(n, _), _| *n != ns);
        Ok(())
    }

    async fn sysctl(&self, netns: Option<&str>, key_name: &str, value: &str) -> Result<()> {
        let mut state = self.enter("sysctl").await?;
        state.ns_check("sysctl", netns)?;
        state.sysctls.insert(key(netns, key_name), value.to_string());
        Ok(())
    }

    async fn apply_firewall(&self, netns: Option<&str>, ruleset: &str) -> Result<()> {
        let mut state = self.enter("apply_firewall").await?;
        state.ns_check("apply_firewall", netns)?;
        state.firewalls.insert(netns.map(str::to_string), ruleset.to_string());
        Ok(())
    }

    async fn configure_wireguard(&self, netns: Option<&str>, name: &str, config: &WgDeviceConfig) -> Result<()> {
        let mut state = self.enter("configure_wireguard").await?;
        let link = state.link_mut("configure_wireguard", netns, name)?;
        if link.link.kind != LinkKind::Wireguard {
            return Err(NetworkError::kernel("configure_wireguard", name, "not a wireguard device"));
        }
        state.wireguard.insert(key(netns, name), config.clone());
        Ok(())
    }

    async fn dhcp_probe(&self, netns: Option<&str>, iface: &str) -> Result<()> {
        let mut state = self.enter("dhcp_probe").await?;
        state.link_mut("dhcp_probe", netns, iface)?;
        let lease = state
            .leases
            .get(iface)
            .cloned()
            .ok_or_else(|| NetworkError::kernel("dhcp_probe", iface, "no lease obtained"))?;

        let link = state.link_mut("dhcp_probe", netns, iface)?;
        for addr in std::iter::once(lease.addr4).chain(lease.addrs6.iter().copied()) {
            if !link.addrs.contains(&addr) {
                link.addrs.push(addr);
            }
        }
        let route = Route::default_via(lease.gateway, iface);
        let routes = state.routes.entry(netns.map(str::to_string)).or_default();
        if !routes.contains(&route) {
            routes.push(route);
        }
        Ok(())
    }
}

/// Directory that keeps published data in memory and can be told to fail.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    ports: Arc<Mutex<HashMap<String, Vec<u16>>>>,
    pub_ifaces: Arc<Mutex<HashMap<String, PubIface>>>,
    fail_publish: Arc<Mutex<bool>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_publish(&self, fail: bool) {
        *self.fail_publish.lock().await = fail;
    }

    pub async fn published(&self, node_id: &str) -> Vec<u16> {
        self.ports.lock().await.get(node_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn publish_wg_ports(&self, node_id: &str, ports: &[u16]) -> Result<()> {
        if *self.fail_publish.lock().await {
            return Err(NetworkError::Publish {
                reason: "directory unavailable".into(),
            });
        }
        self.ports.lock().await.insert(node_id.to_string(), ports.to_vec());
        Ok(())
    }

    async fn get_pub_iface(&self, node_id: &str) -> Result<Option<PubIface>> {
        Ok(self.pub_ifaces.lock().await.get(node_id).cloned())
    }

    async fn set_public_iface(&self, node_id: &str, iface: &PubIface) -> Result<()> {
        self.pub_ifaces.lock().await.insert(node_id.to_string(), iface.clone());
        Ok(())
    }
}

/// Supervisor that records service definitions and signals.
#[derive(Clone, Default)]
pub struct RecordingSupervisor {
    services: Arc<Mutex<BTreeMap<String, ServiceSpec>>>,
    signals: Arc<Mutex<Vec<(String, Signal)>>>,
    forgotten: Arc<Mutex<Vec<String>>>,
}

impl RecordingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn service(&self, name: &str) -> Option<ServiceSpec> {
        self.services.lock().await.get(name).cloned()
    }

    pub async fn signals(&self) -> Vec<(String, Signal)> {
        self.signals.lock().await.clone()
    }

    pub async fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().await.clone()
    }
}

#[async_trait]
impl ProcessSupervisor for RecordingSupervisor {
    async fn add_service(&self, name: &str, spec: &ServiceSpec) -> Result<()> {
        self.services.lock().await.insert(name.to_string(), spec.clone());
        Ok(())
    }

    async fn monitor(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn start(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn start_wait(&self, _name: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn stop_wait(&self, _name: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus> {
        let running = self.services.lock().await.contains_key(name);
        Ok(ServiceStatus {
            name: name.to_string(),
            pid: if running { 100 } else { 0 },
            state: if running {
                ServiceState::Running
            } else {
                ServiceState::Unknown("missing".into())
            },
        })
    }

    async fn kill(&self, name: &str, signal: Signal) -> Result<()> {
        self.signals.lock().await.push((name.to_string(), signal));
        Ok(())
    }

    async fn forget(&self, name: &str) -> Result<()> {
        self.services.lock().await.remove(name);
        self.forgotten.lock().await.push(name.to_string());
        Ok(())
    }
}
