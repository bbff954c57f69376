//! Process supervision.
//!
//! DHCP clients and other long running helpers are owned by the node's process supervisor.
//! [`ProcessSupervisor`] is the slice of it networking uses; [`ZinitSupervisor`] talks to zinit.

use crate::error::{NetworkError, Result};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

/// How a service is run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Full command line
    pub exec: String,
    /// Services that must be running first
    #[serde(default)]
    pub after: Vec<String>,
    /// Do not restart the process when it exits
    #[serde(default)]
    pub one_shot: bool,
}

impl ServiceSpec {
    pub fn new(exec: impl Into<String>) -> Self {
        Self {
            exec: exec.into(),
            after: Vec::new(),
            one_shot: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Running,
    Success,
    Error,
    Blocked,
    Unknown(String),
}

impl ServiceState {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            s if s.starts_with("Running") => ServiceState::Running,
            s if s.starts_with("Success") => ServiceState::Success,
            s if s.starts_with("Error") => ServiceState::Error,
            s if s.starts_with("Blocked") => ServiceState::Blocked,
            other => ServiceState::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub pid: u32,
    pub state: ServiceState,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Register a service definition without starting it.
    async fn add_service(&self, name: &str, spec: &ServiceSpec) -> Result<()>;
    /// Start supervising a registered service.
    async fn monitor(&self, name: &str) -> Result<()>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn start_wait(&self, name: &str, timeout: Duration) -> Result<()>;
    /// Stop and wait; escalates to SIGKILL when `timeout` passes.
    async fn stop_wait(&self, name: &str, timeout: Duration) -> Result<()>;
    async fn status(&self, name: &str) -> Result<ServiceStatus>;
    async fn kill(&self, name: &str, signal: Signal) -> Result<()>;
    /// Drop a stopped service from supervision.
    async fn forget(&self, name: &str) -> Result<()>;
}

/// Supervisor backed by the `zinit` binary and its service directory.
#[derive(Debug, Clone)]
pub struct ZinitSupervisor {
    config_dir: PathBuf,
    poll: Duration,
}

impl ZinitSupervisor {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            poll: Duration::from_millis(500),
        }
    }

    async fn zinit(&self, args: &[&str]) -> Result<String> {
        debug!("zinit {}", args.join(" "));
        let name = args.get(1).copied().unwrap_or("zinit");
        let output = Command::new("zinit")
            .args(args)
            .output()
            .await
            .map_err(|e| NetworkError::kernel(args[0], name, format!("failed to execute zinit: {}", e)))?;

        if !output.status.success() {
            return Err(NetworkError::kernel(
                args[0],
                name,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn render(spec: &ServiceSpec) -> String {
        let mut yaml = format!("exec: {:?}\n", spec.exec);
        if spec.one_shot {
            yaml.push_str("oneshot: true\n");
        }
        if !spec.after.is_empty() {
            yaml.push_str("after:\n");
            for dep in &spec.after {
                yaml.push_str(&format!("  - {}\n", dep));
            }
        }
        yaml
    }

    fn parse_status(name: &str, text: &str) -> ServiceStatus {
        let mut status = ServiceStatus {
            name: name.to_string(),
            pid: 0,
            state: ServiceState::Unknown(String::new()),
        };
        for line in text.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key.trim() {
                    "pid" => status.pid = value.trim().parse().unwrap_or(0),
                    "state" => status.state = ServiceState::parse(value),
                    _ => {}
                }
            }
        }
        status
    }
}

#[async_trait]
impl ProcessSupervisor for ZinitSupervisor {
    async fn add_service(&self, name: &str, spec: &ServiceSpec) -> Result<()> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| NetworkError::io(&self.config_dir, e))?;
        let path = self.config_dir.join(format!("{}.yaml", name));
        tokio::fs::write(&path, Self::render(spec))
            .await
            .map_err(|e| NetworkError::io(&path, e))
    }

    async fn monitor(&self, name: &str) -> Result<()> {
        self.zinit(&["monitor", name]).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.zinit(&["start", name]).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.zinit(&["stop", name]).await.map(|_| ())
    }

    async fn start_wait(&self, name: &str, timeout: Duration) -> Result<()> {
        self.start(name).await?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.status(name).await?.is_running() {
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }
        Err(NetworkError::Timeout {
            what: format!("service {} to start", name),
        })
    }

    async fn stop_wait(&self, name: &str, timeout: Duration) -> Result<()> {
        self.stop(name).await?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.status(name).await?.is_running() {
                return Ok(());
            }
            tokio::time::sleep(self.poll).await;
        }

        warn!(service = %name, "service did not stop in time, killing");
        self.kill(name, Signal::SIGKILL).await
    }

    async fn status(&self, name: &str) -> Result<ServiceStatus> {
        let text = self.zinit(&["status", name]).await?;
        Ok(Self::parse_status(name, &text))
    }

    async fn kill(&self, name: &str, signal: Signal) -> Result<()> {
        self.zinit(&["kill", name, signal.as_str()]).await.map(|_| ())
    }

    async fn forget(&self, name: &str) -> Result<()> {
        self.zinit(&["forget", name]).await.map(|_| ())
    }
}
