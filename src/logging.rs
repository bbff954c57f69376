use std::sync::Once;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: &str, json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
        let builder = fmt().with_env_filter(filter).with_target(true);

        let result = if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        };

        if let Err(err) = result {
            eprintln!("failed to install log subscriber: {}", err);
        }
    });
}

/// Log the outcome of a bootstrap link probe
pub fn log_probe_result(link: &str, addrs4: usize, addrs6: usize, routes: usize) {
    info!(
        link = %link,
        ipv4 = addrs4,
        ipv6 = addrs6,
        routes = routes,
        "link probe finished"
    );
}

/// Log a port reservation change
pub fn log_port_change(port: u16, reserved: bool) {
    if reserved {
        debug!(port = port, "wireguard port reserved");
    } else {
        debug!(port = port, "wireguard port released");
    }
}

/// Log a failed compensating action
pub fn log_cleanup_failure(network_id: &str, step: &str, err: &dyn std::fmt::Display) {
    warn!(
        network_id = %network_id,
        step = %step,
        error = %err,
        "cleanup step failed"
    );
}
