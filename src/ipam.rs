//! IPv4 lease store for addresses handed to network resources on the NDMZ segment.

use crate::error::{NetworkError, Result};
use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::Ipv4Network;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

const DB_FILE: &str = "leases.sqlite";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub network_id: String,
    pub ip: Ipv4Addr,
    pub allocated_at: DateTime<Utc>,
}

/// Leases keyed by network ID, persisted in SQLite.
#[derive(Clone, Debug)]
pub struct IpamStore {
    conn: Arc<Mutex<Connection>>,
    pool: Ipv4Network,
    gateway: Ipv4Addr,
}

fn join_error(e: tokio::task::JoinError) -> NetworkError {
    NetworkError::Other(anyhow::Error::new(e))
}

fn parse_ip(raw: String) -> rusqlite::Result<Ipv4Addr> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl IpamStore {
    /// Open (or create) the store under `dir`.
    pub async fn open(dir: &Path, pool: Ipv4Network, gateway: Ipv4Addr) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| NetworkError::io(dir, e))?;

        let db_path = dir.join(DB_FILE);
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(db_path)?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS leases (
                    network_id TEXT PRIMARY KEY,
                    ip TEXT NOT NULL UNIQUE,
                    allocated_at INTEGER NOT NULL
                )",
                [],
            )?;
            Ok(conn)
        })
        .await
        .map_err(join_error)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pool,
            gateway,
        })
    }

    /// Lease an address to `network_id`. An existing lease is returned unchanged.
    pub async fn allocate(&self, network_id: &str) -> Result<Ipv4Addr> {
        let network_id = network_id.to_string();
        let conn = self.conn.clone();
        let pool = self.pool;
        let gateway = self.gateway;

        tokio::task::spawn_blocking(move || -> Result<Ipv4Addr> {
            let conn = conn.blocking_lock();

            let existing: Option<String> = conn
                .query_row(
                    "SELECT ip FROM leases WHERE network_id = ?",
                    params![network_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(ip) = existing {
                return Ok(parse_ip(ip)?);
            }

            let mut stmt = conn.prepare("SELECT ip FROM leases")?;
            let used: HashSet<Ipv4Addr> = stmt
                .query_map([], |row| parse_ip(row.get(0)?))?
                .collect::<rusqlite::Result<_>>()?;

            let network = pool.network();
            let broadcast = pool.broadcast();
            let free = pool
                .iter()
                .find(|ip| *ip != network && *ip != broadcast && *ip != gateway && !used.contains(ip))
                .ok_or_else(|| NetworkError::IpPoolExhausted {
                    pool: pool.to_string(),
                })?;

            conn.execute(
                "INSERT INTO leases (network_id, ip, allocated_at) VALUES (?, ?, ?)",
                params![network_id, free.to_string(), Utc::now().timestamp()],
            )?;
            info!(network_id = %network_id, ip = %free, "leased ndmz address");
            Ok(free)
        })
        .await
        .map_err(join_error)?
    }

    pub async fn get(&self, network_id: &str) -> Result<Option<Lease>> {
        let network_id = network_id.to_string();
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Option<Lease>> {
            let conn = conn.blocking_lock();
            let lease = conn
                .query_row(
                    "SELECT network_id, ip, allocated_at FROM leases WHERE network_id = ?",
                    params![network_id],
                    |row| {
                        Ok(Lease {
                            network_id: row.get(0)?,
                            ip: parse_ip(row.get(1)?)?,
                            allocated_at: Utc.timestamp_opt(row.get(2)?, 0).single().unwrap_or_default(),
                        })
                    },
                )
                .optional()?;
            Ok(lease)
        })
        .await
        .map_err(join_error)?
    }

    /// Drop the lease of `network_id`. Releasing an unknown network is a no-op.
    pub async fn release(&self, network_id: &str) -> Result<()> {
        let network_id = network_id.to_string();
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = conn.blocking_lock();
            let removed = conn.execute("DELETE FROM leases WHERE network_id = ?", params![network_id])?;
            if removed > 0 {
                debug!(network_id = %network_id, "released ndmz address");
            }
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    pub async fn leases(&self) -> Result<Vec<Lease>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<Lease>> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare("SELECT network_id, ip, allocated_at FROM leases ORDER BY allocated_at")?;
            let leases = stmt
                .query_map([], |row| {
                    Ok(Lease {
                        network_id: row.get(0)?,
                        ip: parse_ip(row.get(1)?)?,
                        allocated_at: Utc.timestamp_opt(row.get(2)?, 0).single().unwrap_or_default(),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(leases)
        })
        .await
        .map_err(join_error)?
    }
}
