use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::engine::LockGranularity;
use crate::limits::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// Write-ahead-logged store under `data_dir`.
    #[default]
    Wal,
    /// Nothing survives a restart.
    Memory,
}

impl FromStr for StorageKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wal" => Ok(StorageKind::Wal),
            "memory" | "mem" => Ok(StorageKind::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub storage: StorageKind,
    pub admission_permits: usize,
    pub lock_granularity: LockGranularity,
    pub sweep_interval: Duration,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            storage: StorageKind::Wal,
            admission_permits: DEFAULT_ADMISSION_PERMITS,
            lock_granularity: LockGranularity::PerResource,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Missing keys take the default; values that
    /// fail to parse are logged and also take the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let sweep_secs: u64 = parsed(&lookup, "BOOKER_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS);
        Self {
            data_dir: lookup("BOOKER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            storage: parsed(&lookup, "BOOKER_STORAGE", defaults.storage),
            admission_permits: parsed(&lookup, "BOOKER_ADMISSION_PERMITS", defaults.admission_permits)
                .max(1),
            lock_granularity: parsed(&lookup, "BOOKER_LOCK_GRANULARITY", defaults.lock_granularity),
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            compact_threshold: parsed(&lookup, "BOOKER_COMPACT_THRESHOLD", defaults.compact_threshold),
            metrics_port: lookup("BOOKER_METRICS_PORT").and_then(|raw| match raw.parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!("ignoring BOOKER_METRICS_PORT={raw:?}: not a port number");
                    None
                }
            }),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

fn parsed<T: FromStr + std::fmt::Debug>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("ignoring {key}={raw:?}, using {default:?}");
            default
        }
    }
}
