//! Process configuration: environment tunables and the collection mapping
//! file.
//!
//! Configuration is resolved once at startup and passed into workers
//! explicitly; nothing here is process-global.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One replication unit: a named collection copied from a source database to
/// a target database. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMapping {
    pub source_db: String,
    pub target_db: String,
    pub collection: String,
}

/// Tunables, resolved from the environment with documented defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string of the store being replicated from.
    pub source_uri: String,
    /// Connection string of the store being replicated into.
    pub target_uri: String,
    /// Maximum documents per fetch or apply batch (`BATCH_SIZE`).
    pub batch_size: usize,
    /// Bulk worker pool size (`CONCURRENCY`).
    pub concurrency: usize,
    /// Idle sleep between polling cycles (`POLLING_INTERVAL`, seconds).
    pub polling_interval: Duration,
    /// Maximum attempts for operations that touch the network (`RETRY_LIMIT`).
    pub retry_limit: u32,
    /// Base delay between retry attempts (`RETRY_DELAY`, seconds).
    pub retry_delay: Duration,
    /// Deadline for establishing a connection (`CONNECTION_TIMEOUT`, ms).
    pub connection_timeout: Duration,
    /// Deadline for individual socket operations (`SOCKET_TIMEOUT`, ms).
    pub socket_timeout: Duration,
    /// Maximum pooled sessions per endpoint.
    pub max_pool_size: usize,
    /// Ignore saved watermarks and scan fully (`CDC_FORCE_REFRESH`).
    pub force_refresh: bool,
    /// Emit per-document comparison traces (`CDC_DEBUG`).
    pub cdc_debug: bool,
    /// Directory holding checkpoint files.
    pub progress_dir: PathBuf,
    /// Directory holding failure logs and the process log.
    pub log_dir: PathBuf,
    /// Directory holding verification records.
    pub verification_dir: PathBuf,
    /// Directory holding run reports.
    pub report_dir: PathBuf,
}

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_LIMIT: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_POOL_SIZE: usize = 50;

impl Config {
    /// Resolve the configuration from the process environment.
    ///
    /// `SOURCE_URI` and `TARGET_URI` are required; every other tunable falls
    /// back to its default. State directories are relative to the working
    /// directory.
    pub fn from_env() -> Result<Config> {
        let source_uri = required_env("SOURCE_URI")?;
        let target_uri = required_env("TARGET_URI")?;
        Ok(Config {
            source_uri,
            target_uri,
            batch_size: env_usize("BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            concurrency: env_usize("CONCURRENCY", DEFAULT_CONCURRENCY)?,
            polling_interval: Duration::from_secs(env_u64("POLLING_INTERVAL", 5)?),
            retry_limit: env_u32("RETRY_LIMIT", DEFAULT_RETRY_LIMIT)?,
            retry_delay: Duration::from_secs(env_u64("RETRY_DELAY", 2)?),
            connection_timeout: Duration::from_millis(env_u64(
                "CONNECTION_TIMEOUT",
                DEFAULT_NETWORK_TIMEOUT.as_millis() as u64,
            )?),
            socket_timeout: Duration::from_millis(env_u64(
                "SOCKET_TIMEOUT",
                DEFAULT_NETWORK_TIMEOUT.as_millis() as u64,
            )?),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            force_refresh: env_bool("CDC_FORCE_REFRESH", false)?,
            cdc_debug: env_bool("CDC_DEBUG", false)?,
            progress_dir: PathBuf::from("progress"),
            log_dir: PathBuf::from("logs"),
            verification_dir: PathBuf::from("verification"),
            report_dir: PathBuf::from("reports"),
        })
    }

    /// A configuration with the documented defaults, pointing every state
    /// directory under `root`.
    pub fn defaults(source_uri: &str, target_uri: &str, root: &Path) -> Config {
        Config {
            source_uri: source_uri.to_owned(),
            target_uri: target_uri.to_owned(),
            batch_size: DEFAULT_BATCH_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            retry_limit: DEFAULT_RETRY_LIMIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            connection_timeout: DEFAULT_NETWORK_TIMEOUT,
            socket_timeout: DEFAULT_NETWORK_TIMEOUT,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            force_refresh: false,
            cdc_debug: false,
            progress_dir: root.join("progress"),
            log_dir: root.join("logs"),
            verification_dir: root.join("verification"),
            report_dir: root.join("reports"),
        }
    }
}

/// Load and validate the collection mapping file.
pub fn load_mappings<P: AsRef<Path>>(path: P) -> Result<Vec<CollectionMapping>> {
    let data = fs::read(path.as_ref())?;
    let mappings: Vec<CollectionMapping> = serde_json::from_slice(&data)?;
    for (i, mapping) in mappings.iter().enumerate() {
        if mapping.source_db.is_empty()
            || mapping.target_db.is_empty()
            || mapping.collection.is_empty()
        {
            return Err(Error::Argument(format!(
                "collection mapping {} is incomplete: {:?}",
                i, mapping
            )));
        }
    }
    Ok(mappings)
}

fn required_env(name: &str) -> Result<String> {
    env::var(name)
        .map_err(|_| Error::Argument(format!("{} environment variable is not set", name)))
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::Argument(format!("could not parse {}={:?} as an integer", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    env_u64(name, u64::from(default)).map(|v| v as u32)
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    env_u64(name, default as u64).map(|v| v as usize)
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            _ => Err(Error::Argument(format!(
                "could not parse {}={:?} as a boolean",
                name, raw
            ))),
        },
        Err(_) => Ok(default),
    }
}
