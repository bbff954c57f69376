//! DHCP lease watchdog.
//!
//! A long running udhcpc is handed to the process supervisor. The watchdog periodically checks
//! that the interface still has an IPv4 default route and nudges the client with SIGUSR1 (renew)
//! when it is gone.

use crate::config::DhcpConfig;
use crate::error::Result;
use crate::kernel::{has_default_route, KernelNetwork};
use crate::supervisor::{ProcessSupervisor, ServiceSpec, ServiceState};
use nix::sys::signal::Signal;
use std::sync::Arc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct DhcpMonitor {
    kernel: Arc<dyn KernelNetwork>,
    supervisor: Arc<dyn ProcessSupervisor>,
    iface: String,
    namespace: Option<String>,
    config: DhcpConfig,
}

impl DhcpMonitor {
    pub fn new(
        kernel: Arc<dyn KernelNetwork>,
        supervisor: Arc<dyn ProcessSupervisor>,
        iface: &str,
        namespace: Option<&str>,
        config: DhcpConfig,
    ) -> Self {
        Self {
            kernel,
            supervisor,
            iface: iface.to_string(),
            namespace: namespace.map(str::to_string),
            config,
        }
    }

    pub fn service_name(&self) -> String {
        format!("dhcp-{}", self.iface)
    }

    /// Command line of the supervised client.
    pub fn exec(&self) -> String {
        let client = format!(
            "{} -v -f -i {} -t 20 -T 1 -s {}",
            self.config.udhcpc, self.iface, self.config.script
        );
        match &self.namespace {
            Some(ns) => format!("ip netns exec {} {}", ns, client),
            None => client,
        }
    }

    /// Hand the client to the supervisor. An existing service that exited is restarted.
    async fn start_service(&self) -> Result<()> {
        let name = self.service_name();
        match self.supervisor.status(&name).await {
            Ok(status) if status.is_running() => {
                debug!(service = %name, "dhcp client already running");
                Ok(())
            }
            Ok(status) if matches!(status.state, ServiceState::Success | ServiceState::Error) => {
                info!(service = %name, "restarting exited dhcp client");
                self.supervisor.start(&name).await
            }
            _ => {
                self.supervisor.add_service(&name, &ServiceSpec::new(self.exec())).await?;
                self.supervisor.monitor(&name).await
            }
        }
    }

    async fn check(&self) -> Result<()> {
        let has_route =
            has_default_route(self.kernel.as_ref(), self.namespace.as_deref(), &self.iface, true).await?;
        if !has_route {
            warn!(iface = %self.iface, "default route lost, asking dhcp client to renew");
            self.supervisor.kill(&self.service_name(), Signal::SIGUSR1).await?;
        }
        Ok(())
    }

    async fn stop_service(&self) {
        let name = self.service_name();
        if let Err(e) = self.supervisor.stop_wait(&name, self.config.stop_timeout).await {
            error!(service = %name, error = %e, "failed to stop dhcp client");
        }
        if let Err(e) = self.supervisor.forget(&name).await {
            error!(service = %name, error = %e, "failed to forget dhcp client");
        }
    }

    /// Run until `cancel` fires, then stop and forget the client.
    pub async fn run(self, cancel: CancellationToken) {
        if let Err(e) = self.start_service().await {
            error!(iface = %self.iface, error = %e, "failed to start dhcp client");
            return;
        }

        let period = self.config.watchdog_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check().await {
                        error!(iface = %self.iface, error = %e, "dhcp watchdog check failed");
                    }
                }
            }
        }

        self.stop_service().await;
        debug!(iface = %self.iface, "dhcp watchdog stopped");
    }
}
