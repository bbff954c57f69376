pub mod bootstrap;
pub mod config;
pub mod directory;
pub mod error;
pub mod firewall;
pub mod identity;
pub mod ipam;
pub mod kernel;
pub mod logging;
pub mod ndmz;
pub mod networker;
pub mod nr;
pub mod ports;
pub mod resilience;
pub mod supervisor;
pub mod types;
pub mod versioned;

#[cfg(any(test, feature = "test"))]
pub mod testing;

pub use config::NetworkerConfig;
pub use error::{NetworkError, Result};
pub use ndmz::{build_ndmz, GatewayMode, Ndmz};
pub use networker::Networker;
pub use types::{Network, NetResource, Peer};
