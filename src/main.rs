use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gridnet::bootstrap::Bootstrap;
use gridnet::directory::FileDirectory;
use gridnet::identity::LocalIdentity;
use gridnet::ipam::IpamStore;
use gridnet::kernel::{CommandKernel, KernelNetwork};
use gridnet::logging::init_logging;
use gridnet::ndmz::Gateway;
use gridnet::resilience::ExponentialBackoffConfig;
use gridnet::supervisor::ZinitSupervisor;
use gridnet::{build_ndmz, GatewayMode, Network, Networker, NetworkerConfig};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, default_value = "/etc/gridnet.json")]
    config: PathBuf,
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
    /// How this node reaches the internet
    #[arg(long, global = true, default_value = "dual-stack")]
    mode: GatewayMode,
    /// Namespace holding the public uplink WireGuard sockets should use
    #[arg(long, global = true)]
    public_namespace: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select the uplink and attach it to the management bridge
    Bootstrap,
    /// Build the public gateway namespace and keep its DHCP watchdog running
    Ndmz {
        /// Host link for the public IPv6 interface
        #[arg(long)]
        public_master: Option<String>,
    },
    /// Create or update a network resource from a JSON definition
    CreateNr {
        #[arg(long)]
        file: PathBuf,
    },
    /// Remove a network resource
    DeleteNr {
        #[arg(long)]
        file: PathBuf,
    },
    /// Plug a workload namespace into a network
    Join {
        #[arg(long)]
        network: String,
        #[arg(long)]
        workload: String,
        #[arg(long = "addr", required = true)]
        addrs: Vec<Ipv4Addr>,
        #[arg(long)]
        ipv4_only: bool,
        #[arg(long)]
        public_ipv6: bool,
    },
    /// Remove a workload namespace
    Leave {
        #[arg(long)]
        network: String,
        #[arg(long)]
        workload: String,
    },
    /// Show the addresses of an interface
    Addrs {
        iface: String,
        #[arg(long)]
        namespace: Option<String>,
    },
}

async fn read_network(path: &Path) -> Result<Network> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("invalid network definition in {}", path.display()))
}

async fn gateway(config: &NetworkerConfig, kernel: Arc<dyn KernelNetwork>) -> Result<Gateway> {
    let ipam = IpamStore::open(&config.leases_dir(), config.ndmz.pool, config.ndmz.gateway).await?;
    let supervisor = Arc::new(ZinitSupervisor::new(&config.zinit_config_dir));
    Ok(Gateway::new(kernel, supervisor, ipam, config))
}

async fn networker(cli: &Cli, config: &NetworkerConfig, kernel: Arc<dyn KernelNetwork>) -> Result<Networker> {
    let ndmz = build_ndmz(cli.mode, gateway(config, kernel.clone()).await?);
    let mut networker = Networker::new(
        config,
        Arc::new(LocalIdentity::new(config.node_id.clone())),
        kernel,
        Arc::new(FileDirectory::new(config.directory_file())),
        ndmz,
    )
    .await?;
    if let Some(ns) = &cli.public_namespace {
        networker = networker.with_public_namespace(ns.clone());
    }
    Ok(networker)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json);

    let config = NetworkerConfig::load(&cli.config)
        .await
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let kernel: Arc<dyn KernelNetwork> = Arc::new(CommandKernel::new(config.dhcp.clone()));

    match &cli.command {
        Commands::Bootstrap => {
            let bootstrap = Bootstrap::new(kernel, config.bootstrap.clone());
            match bootstrap
                .configure(&config.default_bridge, ExponentialBackoffConfig::unbounded())
                .await?
            {
                Some(link) => println!("{} attached to {}", link, config.default_bridge),
                None => println!("{} already configured", config.default_bridge),
            }
        }
        Commands::Ndmz { public_master } => {
            let mut gw = gateway(&config, kernel).await?;
            if let Some(master) = public_master {
                gw = gw.with_public_master(master.clone());
            }
            let shutdown = gw.shutdown_token();
            let ndmz = build_ndmz(cli.mode, gw);

            tokio::select! {
                result = ndmz.create() => result?,
                _ = tokio::signal::ctrl_c() => {
                    shutdown.cancel();
                    ndmz.stop().await;
                    return Ok(());
                }
            }
            info!(mode = %cli.mode, "ndmz ready, watching dhcp lease");

            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            shutdown.cancel();
            ndmz.stop().await;
        }
        Commands::CreateNr { file } => {
            let network = read_network(file).await?;
            let ns = networker(&cli, &config, kernel).await?.create_nr(&network).await?;
            println!("{}", ns);
        }
        Commands::DeleteNr { file } => {
            let network = read_network(file).await?;
            networker(&cli, &config, kernel).await?.delete_nr(&network).await?;
        }
        Commands::Join {
            network,
            workload,
            addrs,
            ipv4_only,
            public_ipv6,
        } => {
            let member = networker(&cli, &config, kernel)
                .await?
                .join(network, workload, addrs, *ipv4_only, *public_ipv6)
                .await?;
            println!("{}", serde_json::to_string_pretty(&member)?);
        }
        Commands::Leave { network, workload } => {
            networker(&cli, &config, kernel).await?.leave(network, workload).await?;
        }
        Commands::Addrs { iface, namespace } => {
            let networker = networker(&cli, &config, kernel).await?;
            for addr in networker.addrs(iface, namespace.as_deref()).await? {
                println!("{}", addr);
            }
        }
    }

    Ok(())
}
