//! Versioned network records.
//!
//! A record is a JSON string holding the schema version, a newline, then the JSON document.
//! Documents written before versioning existed carry no header and read as `0.0.0`.

use crate::error::{NetworkError, Result};
use crate::types::Network;
use semver::Version;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Schema version written by this crate.
pub const NETWORK_SCHEMA: Version = Version::new(0, 1, 0);
const LEGACY: Version = Version::new(0, 0, 0);

/// Serialize `value` behind a version header.
pub fn encode<T: Serialize>(version: &Version, value: &T) -> Result<Vec<u8>> {
    let mut out = serde_json::to_vec(&version.to_string())?;
    out.push(b'\n');
    serde_json::to_writer(&mut out, value)?;
    Ok(out)
}

/// Split a record into its version and body.
pub fn split(data: &[u8]) -> Result<(Version, &[u8])> {
    let start = data.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(data.len());
    if data.get(start) != Some(&b'"') {
        return Ok((LEGACY, data));
    }

    let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<String>();
    let raw = match stream.next() {
        Some(value) => value?,
        None => return Ok((LEGACY, data)),
    };
    let version = Version::parse(&raw).map_err(|_| NetworkError::Version { version: raw.clone() })?;
    Ok((version, &data[stream.byte_offset()..]))
}

/// Decode a record, rejecting versions newer than `max`.
pub fn decode<T: DeserializeOwned>(data: &[u8], max: &Version) -> Result<(Version, T)> {
    let (version, body) = split(data)?;
    if version > *max {
        return Err(NetworkError::Version {
            version: version.to_string(),
        });
    }
    Ok((version, serde_json::from_slice(body)?))
}

/// One versioned file per network ID.
#[derive(Debug, Clone)]
pub struct NetworkStore {
    dir: PathBuf,
}

impl NetworkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, network_id: &str) -> Result<PathBuf> {
        if network_id.is_empty() || network_id.contains('/') || network_id.starts_with('.') {
            return Err(NetworkError::validation(format!("invalid network ID {:?}", network_id)));
        }
        Ok(self.dir.join(network_id))
    }

    pub async fn save(&self, network: &Network) -> Result<()> {
        let path = self.path(&network.network_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| NetworkError::io(&self.dir, e))?;

        let data = encode(&NETWORK_SCHEMA, network)?;
        // IDs never start with a dot, so the temp name cannot shadow another record
        let tmp = self.dir.join(format!(".{}.tmp", network.network_id));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| NetworkError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| NetworkError::io(&path, e))?;
        debug!(network_id = %network.network_id, "network record saved");
        Ok(())
    }

    /// Load a record. A missing file is `None`.
    pub async fn load(&self, network_id: &str) -> Result<Option<Network>> {
        let path = self.path(network_id)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(NetworkError::io(&path, e)),
        };

        let (version, network) = decode::<Network>(&data, &NETWORK_SCHEMA)?;
        if version < NETWORK_SCHEMA {
            debug!(network_id = %network_id, version = %version, "read legacy network record");
        }
        Ok(Some(network))
    }

    /// Remove a record. A missing file is fine.
    pub async fn remove(&self, network_id: &str) -> Result<()> {
        let path = self.path(network_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(NetworkError::io(&path, e)),
        }
    }

    /// Every readable record. Unreadable ones are logged and skipped.
    pub async fn list(&self) -> Result<Vec<Network>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(NetworkError::io(&self.dir, e)),
        };

        let mut networks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| NetworkError::io(&self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            match self.load(&name).await {
                Ok(Some(network)) => networks.push(network),
                Ok(None) => {}
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable network record"),
            }
        }
        networks.sort_by(|a, b| a.network_id.cmp(&b.network_id));
        Ok(networks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures;
    use tempfile::tempdir;

    #[test]
    fn test_encode_layout() {
        let network = fixtures::network("node-1");
        let data = encode(&NETWORK_SCHEMA, &network).unwrap();
        let text = String::from_utf8(data).unwrap();
        assert!(text.starts_with("\"0.1.0\"\n{"));
    }

    #[test]
    fn test_legacy_record_reads_as_zero() {
        let network = fixtures::network("node-1");
        let data = serde_json::to_vec(&network).unwrap();

        let (version, decoded) = decode::<Network>(&data, &NETWORK_SCHEMA).unwrap();
        assert_eq!(version, Version::new(0, 0, 0));
        assert_eq!(decoded, network);
    }

    #[test]
    fn test_future_version_rejected() {
        let network = fixtures::network("node-1");
        let data = encode(&Version::new(0, 2, 0), &network).unwrap();

        let err = decode::<Network>(&data, &NETWORK_SCHEMA).unwrap_err();
        assert_eq!(err.to_string(), "unknown network object version 0.2.0");
    }

    #[test]
    fn test_garbage_version_rejected() {
        let err = split(b"\"not-a-version\"\n{}").unwrap_err();
        assert!(matches!(err, NetworkError::Version { .. }));
    }

    #[tokio::test]
    async fn test_store_round_trip() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = NetworkStore::new(dir.path().join("networks"));
        let network = fixtures::network("node-1");

        assert_eq!(store.load("net-alpha").await?, None);
        store.save(&network).await?;
        assert_eq!(store.load("net-alpha").await?, Some(network.clone()));
        assert_eq!(store.list().await?, vec![network]);

        store.remove("net-alpha").await?;
        store.remove("net-alpha").await?;
        assert!(store.list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_dotted_ids_keep_their_own_records() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = NetworkStore::new(dir.path());

        let mut ids = Vec::new();
        for id in ["net.a", "net.b", "x.tmp"] {
            let mut network = fixtures::network("node-1");
            network.network_id = id.to_string();
            store.save(&network).await?;
            ids.push(id.to_string());
        }

        let listed: Vec<String> = store.list().await?.into_iter().map(|n| n.network_id).collect();
        assert_eq!(listed, ids);
        assert_eq!(store.load("x.tmp").await?.map(|n| n.network_id).as_deref(), Some("x.tmp"));

        // no temp files are left behind
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().starts_with('.'));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_store_rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let store = NetworkStore::new(dir.path());
        assert!(store.load("../etc").await.is_err());
        assert!(store.remove("a/b").await.is_err());
    }
}
