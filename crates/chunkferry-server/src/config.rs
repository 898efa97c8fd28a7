use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use chunkferry_core::catalog::DEFAULT_DOWNLOAD_CHUNK_SIZE;

const MAX_CHUNK_BYTES: usize = 1024 * 1024 * 1024;

/// Server settings, read from `CHUNKFERRY_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Root holding `files/`, `staging/` and `outbound/`.
    pub storage_dir: PathBuf,
    /// owner -> credential
    pub users: HashMap<String, String>,
    pub download_chunk_size: usize,
    pub staging_ttl: Duration,
    pub cleanup_interval_secs: u64,
    pub max_chunk_bytes: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let users_json = lookup("CHUNKFERRY_USERS")
            .filter(|v| !v.trim().is_empty())
            .context("CHUNKFERRY_USERS is not set")?;
        let users: HashMap<String, String> = serde_json::from_str(&users_json)
            .context("CHUNKFERRY_USERS must be a JSON object of owner -> credential")?;
        if users.is_empty() {
            bail!("CHUNKFERRY_USERS defines no users");
        }

        let host = lookup("CHUNKFERRY_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = parse_or(&lookup, "CHUNKFERRY_PORT", 5000u16)?;
        let storage_dir: PathBuf = lookup("CHUNKFERRY_STORAGE_DIR")
            .unwrap_or_else(|| "./uploads".into())
            .into();
        let download_chunk_size =
            parse_or(&lookup, "CHUNKFERRY_DOWNLOAD_CHUNK_SIZE", DEFAULT_DOWNLOAD_CHUNK_SIZE)?;
        if download_chunk_size == 0 {
            bail!("CHUNKFERRY_DOWNLOAD_CHUNK_SIZE must be positive");
        }
        let ttl_hours = parse_or(&lookup, "CHUNKFERRY_STAGING_TTL_HOURS", 24u64)?;
        let cleanup_interval_secs = parse_or(&lookup, "CHUNKFERRY_CLEANUP_INTERVAL_SECS", 3600u64)?;
        if cleanup_interval_secs == 0 {
            bail!("CHUNKFERRY_CLEANUP_INTERVAL_SECS must be positive");
        }
        let max_chunk_bytes = parse_or(&lookup, "CHUNKFERRY_MAX_CHUNK_BYTES", MAX_CHUNK_BYTES)?;

        Ok(Self {
            host,
            port,
            storage_dir,
            users,
            download_chunk_size,
            staging_ttl: Duration::from_secs(ttl_hours * 3600),
            cleanup_interval_secs,
            max_chunk_bytes,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        None => Ok(default),
    }
}
