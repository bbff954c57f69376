//! Error types for the network provisioning core.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the networking subsystems.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Malformed network, network resource or peer definition.
    #[error("invalid network definition: {reason}")]
    Validation { reason: String },

    #[error("port {port} already reserved")]
    PortConflict { port: u16 },

    /// The directory service rejected a publish; the local change was rolled back.
    #[error("failed to publish to directory: {reason}")]
    Publish { reason: String },

    #[error("no route with default gateway found")]
    NoDefaultGateway,

    #[error("{what} not found")]
    NotFound { what: String },

    /// A kernel network operation failed.
    #[error("{op} failed on {target}: {reason}")]
    Kernel {
        op: String,
        target: String,
        reason: String,
    },

    #[error("ip pool {pool} exhausted")]
    IpPoolExhausted { pool: String },

    #[error("unknown network object version {version}")]
    Version { version: String },

    #[error("timed out waiting for {what}")]
    Timeout { what: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("lease store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("failed to render firewall rules: {0}")]
    Template(#[from] tera::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, NetworkError>;

impl NetworkError {
    pub fn validation(reason: impl Into<String>) -> Self {
        NetworkError::Validation {
            reason: reason.into(),
        }
    }

    pub fn kernel(op: impl Into<String>, target: impl Into<String>, reason: impl Into<String>) -> Self {
        NetworkError::Kernel {
            op: op.into(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        NetworkError::NotFound { what: what.into() }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NetworkError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors worth retrying with backoff: the outside world may still change under us.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Timeout { .. }
                | NetworkError::Kernel { .. }
                | NetworkError::Publish { .. }
                | NetworkError::NoDefaultGateway
                | NetworkError::NotFound { .. }
                | NetworkError::Io { .. }
        )
    }
}
