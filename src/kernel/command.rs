//! [`KernelNetwork`] backed by iproute2, nftables, wireguard-tools and udhcpc.

use super::{KernelNetwork, Link, LinkKind, Route, WgDeviceConfig};
use crate::config::DhcpConfig;
use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use rand::Rng;
use serde::Deserialize;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::process::{Output, Stdio};
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const NETNS_DIR: &str = "/var/run/netns";

/// Drives the kernel through the standard userspace tools.
#[derive(Debug, Clone)]
pub struct CommandKernel {
    dhcp: DhcpConfig,
}

#[derive(Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    link_type: String,
    #[serde(default)]
    flags: Vec<String>,
    master: Option<String>,
    address: Option<String>,
    linkinfo: Option<IpLinkInfo>,
}

#[derive(Deserialize)]
struct IpLinkInfo {
    info_kind: Option<String>,
}

#[derive(Deserialize)]
struct IpAddrEntry {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Deserialize)]
struct IpAddrInfo {
    local: String,
    prefixlen: u8,
}

#[derive(Deserialize)]
struct IpRoute {
    dst: Option<String>,
    gateway: Option<String>,
    dev: Option<String>,
}

impl From<IpLink> for Link {
    fn from(raw: IpLink) -> Self {
        let kind = LinkKind::from_info_kind(
            raw.linkinfo.as_ref().and_then(|i| i.info_kind.as_deref()),
            &raw.link_type,
        );
        Link {
            up: raw.flags.iter().any(|f| f == "UP"),
            carrier: raw.flags.iter().any(|f| f == "LOWER_UP"),
            name: raw.ifname,
            kind,
            master: raw.master,
            mac: raw.address,
        }
    }
}

impl IpRoute {
    fn into_route(self, ipv4: bool) -> Option<Route> {
        let dst = match self.dst.as_deref() {
            None | Some("default") => None,
            Some(dst) => Some(parse_prefix(dst, ipv4)?),
        };
        let gateway = match self.gateway {
            Some(gw) => Some(IpAddr::from_str(&gw).ok()?),
            None => None,
        };
        // defaults are kept explicit so the family survives without a gateway (`default dev ppp0`)
        let dst = match dst {
            None => Some(IpNetwork::from_str(if ipv4 { "0.0.0.0/0" } else { "::/0" }).ok()?),
            dst => dst,
        };
        Some(Route {
            dst,
            gateway,
            device: self.dev,
        })
    }
}

fn parse_prefix(value: &str, ipv4: bool) -> Option<IpNetwork> {
    if value.contains('/') {
        return IpNetwork::from_str(value).ok();
    }
    let ip = IpAddr::from_str(value).ok()?;
    let prefix = if ipv4 { 32 } else { 128 };
    IpNetwork::new(ip, prefix).ok()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn already_exists(output: &Output) -> bool {
    stderr(output).contains("File exists")
}

fn already_gone(output: &Output) -> bool {
    let err = stderr(output);
    err.contains("Cannot find device")
        || err.contains("No such file")
        || err.contains("does not exist")
        || err.contains("Cannot assign requested address")
}

fn temp_name(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("{}{:08x}", prefix, suffix)
}

impl CommandKernel {
    pub fn new(dhcp: DhcpConfig) -> Self {
        Self { dhcp }
    }

    /// Build a command for `program`, entering `netns` when given.
    fn command(netns: Option<&str>, program: &str) -> Command {
        match netns {
            Some(ns) if program == "ip" => {
                let mut cmd = Command::new("ip");
                cmd.args(["-n", ns]);
                cmd
            }
            Some(ns) => {
                let mut cmd = Command::new("ip");
                cmd.args(["netns", "exec", ns, program]);
                cmd
            }
            None => Command::new(program),
        }
    }

    async fn output(
        &self,
        op: &str,
        target: &str,
        netns: Option<&str>,
        program: &str,
        args: &[&str],
    ) -> Result<Output> {
        debug!(op = %op, target = %target, netns = ?netns, "{} {}", program, args.join(" "));
        Self::command(netns, program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| NetworkError::kernel(op, target, format!("failed to execute {}: {}", program, e)))
    }

    /// Run and require success.
    async fn run(&self, op: &str, target: &str, netns: Option<&str>, program: &str, args: &[&str]) -> Result<Output> {
        let output = self.output(op, target, netns, program, args).await?;
        if !output.status.success() {
            return Err(NetworkError::kernel(op, target, stderr(&output)));
        }
        Ok(output)
    }

    /// Run a creation step; "File exists" counts as success.
    async fn run_create(&self, op: &str, target: &str, netns: Option<&str>, program: &str, args: &[&str]) -> Result<()> {
        let output = self.output(op, target, netns, program, args).await?;
        if output.status.success() || already_exists(&output) {
            return Ok(());
        }
        Err(NetworkError::kernel(op, target, stderr(&output)))
    }

    /// Run a removal step; a missing target counts as success.
    async fn run_remove(&self, op: &str, target: &str, netns: Option<&str>, program: &str, args: &[&str]) -> Result<()> {
        let output = self.output(op, target, netns, program, args).await?;
        if output.status.success() || already_gone(&output) {
            return Ok(());
        }
        Err(NetworkError::kernel(op, target, stderr(&output)))
    }

    async fn run_with_stdin(
        &self,
        op: &str,
        target: &str,
        netns: Option<&str>,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> Result<()> {
        let mut child = Self::command(netns, program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NetworkError::kernel(op, target, format!("failed to execute {}: {}", program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| NetworkError::kernel(op, target, e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| NetworkError::kernel(op, target, e.to_string()))?;
        if !output.status.success() {
            return Err(NetworkError::kernel(op, target, stderr(&output)));
        }
        Ok(())
    }

    fn parse_json<T: for<'de> Deserialize<'de>>(op: &str, target: &str, output: &Output) -> Result<T> {
        serde_json::from_slice(&output.stdout)
            .map_err(|e| NetworkError::kernel(op, target, format!("unexpected iproute2 output: {}", e)))
    }

    async fn routes_of_family(&self, netns: Option<&str>, ipv4: bool) -> Result<Vec<Route>> {
        let family = if ipv4 { "-4" } else { "-6" };
        let output = self
            .run("list routes", netns.unwrap_or("host"), netns, "ip", &["-j", family, "route", "show"])
            .await?;
        let raw: Vec<IpRoute> = Self::parse_json("list routes", netns.unwrap_or("host"), &output)?;
        Ok(raw.into_iter().filter_map(|r| r.into_route(ipv4)).collect())
    }

    /// Host addresses are read straight from the interface table.
    async fn host_addrs(name: &str) -> Result<Vec<IpNetwork>> {
        let name = name.to_string();
        let ifaces = tokio::task::spawn_blocking(get_if_addrs::get_if_addrs)
            .await
            .map_err(|e| NetworkError::Other(e.into()))?
            .map_err(|e| NetworkError::kernel("list addresses", "host", e.to_string()))?;

        let mut addrs = Vec::new();
        for iface in ifaces.into_iter().filter(|i| i.name == name) {
            let net = match iface.addr {
                get_if_addrs::IfAddr::V4(v4) => ipnetwork::ipv4_mask_to_prefix(v4.netmask)
                    .ok()
                    .and_then(|prefix| IpNetwork::new(IpAddr::V4(v4.ip), prefix).ok()),
                get_if_addrs::IfAddr::V6(v6) => ipnetwork::ipv6_mask_to_prefix(v6.netmask)
                    .ok()
                    .and_then(|prefix| IpNetwork::new(IpAddr::V6(v6.ip), prefix).ok()),
            };
            match net {
                Some(net) => addrs.push(net),
                None => warn!(link = %name, "skipping address with non contiguous netmask"),
            }
        }
        Ok(addrs)
    }

    fn wg_config_text(config: &WgDeviceConfig) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "[Interface]");
        let _ = writeln!(text, "PrivateKey = {}", config.private_key);
        let _ = writeln!(text, "ListenPort = {}", config.listen_port);
        for peer in &config.peers {
            let allowed: Vec<String> = peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
            let _ = writeln!(text, "\n[Peer]");
            let _ = writeln!(text, "PublicKey = {}", peer.public_key);
            let _ = writeln!(text, "AllowedIPs = {}", allowed.join(", "));
            if let Some(endpoint) = &peer.endpoint {
                let _ = writeln!(text, "Endpoint = {}", endpoint);
            }
            if let Some(keepalive) = peer.keepalive_secs {
                let _ = writeln!(text, "PersistentKeepalive = {}", keepalive);
            }
        }
        text
    }
}

#[async_trait]
impl KernelNetwork for CommandKernel {
    async fn list_links(&self, netns: Option<&str>) -> Result<Vec<Link>> {
        let target = netns.unwrap_or("host");
        let output = self.run("list links", target, netns, "ip", &["-j", "-d", "link", "show"]).await?;
        let raw: Vec<IpLink> = Self::parse_json("list links", target, &output)?;
        Ok(raw.into_iter().map(Link::from).collect())
    }

    async fn get_link(&self, netns: Option<&str>, name: &str) -> Result<Option<Link>> {
        let output = self.output("get link", name, netns, "ip", &["-j", "-d", "link", "show", "dev", name]).await?;
        if !output.status.success() {
            if already_gone(&output) {
                return Ok(None);
            }
            return Err(NetworkError::kernel("get link", name, stderr(&output)));
        }
        let raw: Vec<IpLink> = Self::parse_json("get link", name, &output)?;
        Ok(raw.into_iter().next().map(Link::from))
    }

    async fn create_bridge(&self, name: &str) -> Result<()> {
        self.run_create("create bridge", name, None, "ip", &["link", "add", "name", name, "type", "bridge"])
            .await
    }

    async fn create_macvlan(&self, name: &str, master: &str, netns: Option<&str>) -> Result<()> {
        let Some(ns) = netns else {
            return self
                .run_create(
                    "create macvlan",
                    name,
                    None,
                    "ip",
                    &["link", "add", name, "link", master, "type", "macvlan", "mode", "bridge"],
                )
                .await;
        };

        // the final name may already be taken in the host namespace
        let tmp = temp_name("mv");
        self.run(
            "create macvlan",
            name,
            None,
            "ip",
            &["link", "add", &tmp, "link", master, "type", "macvlan", "mode", "bridge"],
        )
        .await?;
        if let Err(err) = self.run("move macvlan", name, None, "ip", &["link", "set", &tmp, "netns", ns]).await {
            let _ = self.run_remove("delete link", &tmp, None, "ip", &["link", "del", &tmp]).await;
            return Err(err);
        }
        self.run("rename macvlan", name, Some(ns), "ip", &["link", "set", &tmp, "name", name])
            .await
            .map(|_| ())
    }

    async fn create_veth(&self, name: &str, peer: &str, netns: &str, mtu: u32) -> Result<()> {
        let tmp = temp_name("vt");
        let mtu = mtu.to_string();
        self.run(
            "create veth",
            peer,
            None,
            "ip",
            &["link", "add", peer, "mtu", &mtu, "type", "veth", "peer", "name", &tmp, "mtu", &mtu],
        )
        .await?;
        if let Err(err) = self.run("move veth", name, None, "ip", &["link", "set", &tmp, "netns", netns]).await {
            let _ = self.run_remove("delete link", peer, None, "ip", &["link", "del", peer]).await;
            return Err(err);
        }
        self.run("rename veth", name, Some(netns), "ip", &["link", "set", &tmp, "name", name])
            .await
            .map(|_| ())
    }

    async fn create_wireguard(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.run_create("create wireguard", name, netns, "ip", &["link", "add", name, "type", "wireguard"])
            .await
    }

    async fn move_link(&self, from: Option<&str>, name: &str, to: Option<&str>) -> Result<()> {
        // pid 1 lives in the host namespace
        let to = to.unwrap_or("1");
        self.run("move link", name, from, "ip", &["link", "set", name, "netns", to])
            .await
            .map(|_| ())
    }

    async fn delete_link(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.run_remove("delete link", name, netns, "ip", &["link", "del", name]).await
    }

    async fn set_master(&self, name: &str, master: &str) -> Result<()> {
        self.run("set master", name, None, "ip", &["link", "set", name, "master", master])
            .await
            .map(|_| ())
    }

    async fn set_link_up(&self, netns: Option<&str>, name: &str) -> Result<()> {
        self.run("set link up", name, netns, "ip", &["link", "set", name, "up"])
            .await
            .map(|_| ())
    }

    async fn set_mac(&self, netns: Option<&str>, name: &str, mac: &str) -> Result<()> {
        self.run("set mac", name, netns, "ip", &["link", "set", name, "address", mac])
            .await
            .map(|_| ())
    }

    async fn addrs(&self, netns: Option<&str>, name: &str) -> Result<Vec<IpNetwork>> {
        if netns.is_none() {
            return Self::host_addrs(name).await;
        }

        let output = self.run("list addresses", name, netns, "ip", &["-j", "addr", "show", "dev", name]).await?;
        let raw: Vec<IpAddrEntry> = Self::parse_json("list addresses", name, &output)?;
        Ok(raw
            .into_iter()
            .flat_map(|entry| entry.addr_info)
            .filter_map(|info| {
                let ip = IpAddr::from_str(&info.local).ok()?;
                IpNetwork::new(ip, info.prefixlen).ok()
            })
            .collect())
    }

    async fn add_addr(&self, netns: Option<&str>, name: &str, addr: IpNetwork) -> Result<()> {
        let addr = addr.to_string();
        self.run_create("add address", name, netns, "ip", &["addr", "add", &addr, "dev", name])
            .await
    }

    async fn del_addr(&self, netns: Option<&str>, name: &str, addr: IpNetwork) -> Result<()> {
        let addr = addr.to_string();
        self.run_remove("delete address", name, netns, "ip", &["addr", "del", &addr, "dev", name])
            .await
    }

    async fn routes(&self, netns: Option<&str>) -> Result<Vec<Route>> {
        let mut routes = self.routes_of_family(netns, true).await?;
        routes.extend(self.routes_of_family(netns, false).await?);
        Ok(routes)
    }

    async fn add_route(&self, netns: Option<&str>, route: &Route) -> Result<()> {
        let dst = match route.dst {
            Some(dst) => dst.to_string(),
            None => "default".to_string(),
        };
        let mut args = vec!["route", "add", dst.as_str()];
        let gateway = route.gateway.map(|gw| gw.to_string());
        if let Some(gw) = &gateway {
            args.extend(["via", gw.as_str()]);
        }
        if let Some(dev) = &route.device {
            args.extend(["dev", dev.as_str()]);
        }
        let target = route.to_string();
        self.run_create("add route", &target, netns, "ip", &args).await
    }

    async fn route_get(&self, netns: Option<&str>, dst: IpAddr) -> Result<Option<Route>> {
        let addr = dst.to_string();
        let output = self.output("route get", &addr, netns, "ip", &["-j", "route", "get", &addr]).await?;
        if !output.status.success() {
            let err = stderr(&output);
            if err.contains("unreachable") || err.contains("No route") {
                return Ok(None);
            }
            return Err(NetworkError::kernel("route get", &addr, err));
        }
        let raw: Vec<IpRoute> = Self::parse_json("route get", &addr, &output)?;
        Ok(raw.into_iter().next().and_then(|r| r.into_route(dst.is_ipv4())))
    }

    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        Ok(Path::new(NETNS_DIR).join(name).exists())
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        self.run_create("create namespace", name, None, "ip", &["netns", "add", name]).await
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let output = self.output("delete namespace", name, None, "ip", &["netns", "del", name]).await?;
        if output.status.success() || already_gone(&output) || stderr(&output).contains("Cannot remove") {
            return Ok(());
        }
        Err(NetworkError::kernel("delete namespace", name, stderr(&output)))
    }

    async fn sysctl(&self, netns: Option<&str>, key: &str, value: &str) -> Result<()> {
        let setting = format!("{}={}", key, value);
        self.run("sysctl", key, netns, "sysctl", &["-q", "-w", &setting])
            .await
            .map(|_| ())
    }

    async fn apply_firewall(&self, netns: Option<&str>, ruleset: &str) -> Result<()> {
        self.run_with_stdin("apply firewall", netns.unwrap_or("host"), netns, "nft", &["-f", "-"], ruleset)
            .await
    }

    async fn configure_wireguard(&self, netns: Option<&str>, name: &str, config: &WgDeviceConfig) -> Result<()> {
        let text = Self::wg_config_text(config);
        self.run_with_stdin("configure wireguard", name, netns, "wg", &["syncconf", name, "/dev/stdin"], &text)
            .await
    }

    async fn dhcp_probe(&self, netns: Option<&str>, iface: &str) -> Result<()> {
        self.run(
            "dhcp probe",
            iface,
            netns,
            &self.dhcp.udhcpc,
            &["-q", "-f", "-n", "-i", iface, "-t", "20", "-T", "1", "-s", &self.dhcp.script],
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::WgPeerConfig;

    #[test]
    fn test_parse_link_json() {
        let raw = r#"[{"ifindex":2,"ifname":"eth0","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],
            "link_type":"ether","address":"52:54:00:12:34:56"},
            {"ifindex":3,"ifname":"zos","flags":["UP"],"link_type":"ether",
            "linkinfo":{"info_kind":"bridge"}},
            {"ifindex":4,"ifname":"eth1","flags":["BROADCAST"],"link_type":"ether","master":"zos"}]"#;
        let links: Vec<IpLink> = serde_json::from_str(raw).unwrap();
        let links: Vec<Link> = links.into_iter().map(Link::from).collect();

        assert_eq!(links[0].kind, LinkKind::Device);
        assert!(links[0].up && links[0].carrier);
        assert_eq!(links[0].mac.as_deref(), Some("52:54:00:12:34:56"));
        assert_eq!(links[1].kind, LinkKind::Bridge);
        assert!(!links[1].carrier);
        assert_eq!(links[2].master.as_deref(), Some("zos"));
    }

    #[test]
    fn test_parse_routes() {
        let raw = r#"[{"dst":"default","gateway":"192.168.1.1","dev":"eth0"},
            {"dst":"192.168.1.0/24","dev":"eth0"}]"#;
        let routes: Vec<IpRoute> = serde_json::from_str(raw).unwrap();
        let routes: Vec<Route> = routes.into_iter().filter_map(|r| r.into_route(true)).collect();
        assert!(routes[0].is_default());
        assert_eq!(routes[0].gateway, Some("192.168.1.1".parse().unwrap()));
        assert_eq!(routes[1].dst, Some("192.168.1.0/24".parse().unwrap()));

        let raw = r#"[{"dst":"default","gateway":"fe80::1","dev":"npub6"}]"#;
        let routes: Vec<IpRoute> = serde_json::from_str(raw).unwrap();
        let route = routes.into_iter().next().and_then(|r| r.into_route(false)).unwrap();
        assert!(route.is_default());
        assert!(!route.is_ipv4());

        // point to point uplinks have no gateway
        let raw = r#"[{"dst":"default","dev":"ppp0"}]"#;
        let routes: Vec<IpRoute> = serde_json::from_str(raw).unwrap();
        let route = routes.into_iter().next().and_then(|r| r.into_route(true)).unwrap();
        assert!(route.is_default());
        assert!(route.is_ipv4());
        assert_eq!(route, Route::default_dev(true, "ppp0"));
    }

    #[test]
    fn test_wg_config_text() {
        let config = WgDeviceConfig {
            private_key: "cHJpdmF0ZQ==".into(),
            listen_port: 6010,
            peers: vec![WgPeerConfig {
                public_key: "cHVibGlj".into(),
                endpoint: Some("1.2.3.4:6011".into()),
                allowed_ips: vec!["10.3.2.0/24".parse().unwrap(), "100.64.3.2/32".parse().unwrap()],
                keepalive_secs: Some(20),
            }],
        };
        let text = CommandKernel::wg_config_text(&config);
        assert!(text.contains("ListenPort = 6010"));
        assert!(text.contains("AllowedIPs = 10.3.2.0/24, 100.64.3.2/32"));
        assert!(text.contains("Endpoint = 1.2.3.4:6011"));
        assert!(text.contains("PersistentKeepalive = 20"));
    }

    #[test]
    fn test_command_prefixes() {
        let cmd = CommandKernel::command(Some("ndmz"), "sysctl");
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["netns", "exec", "ndmz", "sysctl"]);

        let cmd = CommandKernel::command(Some("ndmz"), "ip");
        let args: Vec<_> = cmd.as_std().get_args().map(|a| a.to_string_lossy().to_string()).collect();
        assert_eq!(args, vec!["-n", "ndmz"]);
    }
}
