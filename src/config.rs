//! Runtime configuration for archive-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Volume layout, eviction tuning, integrity sweeps and the restore source
//! all live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::cache::strategy::{
    StrategyKind, StrategyTuning, DEFAULT_MIN_AGE_MS, DEFAULT_TURNOVER_AGE_MS,
    DEFAULT_TURNOVER_SIZE,
};
use crate::cache::object::DEFAULT_PRIORITY;
use crate::cache::plan::{DEFAULT_DELETION_HEADROOM, DEFAULT_SELECTION_HEADROOM};
use crate::integrity::DEFAULT_FAIL_LIMIT;
use crate::inventory::{VolumeStatus, DEFAULT_CHECK_GRACE};

const HOUR_MS: f64 = 3_600_000.0;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "archive-cache", about = "Disk cache in front of a long-term archive")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "cache.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List volumes with their status and space usage.
    Volumes,

    /// Run an integrity sweep.
    Sweep {
        /// Maximum number of objects to check.
        #[arg(long)]
        limit: Option<usize>,

        /// Report failures without removing them.
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore an object from long-term storage into the cache.
    Restore {
        id: String,

        /// Restore even if a copy is already cached.
        #[arg(long)]
        recache: bool,
    },

    /// Remove every cached copy of an object.
    Uncache { id: String },

    /// Set a volume's status.
    Status { volume: String, status: VolumeStatus },

    /// Print metrics in Prometheus text format.
    Metrics,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Cache name, used in logs.
    pub name: String,

    /// Inventory catalog.
    pub inventory: InventoryConfig,

    /// Cache volumes, in the order they are tried.
    pub volumes: Vec<VolumeSettings>,

    /// Eviction policy tuning.
    pub eviction: EvictionConfig,

    /// Integrity sweep settings.
    pub integrity: IntegrityConfig,

    /// Where restored objects come from.
    pub restore: RestoreConfig,
}

/// Inventory database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// SQLite file; `:memory:` for a throwaway catalog.
    pub path: PathBuf,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inventory.sqlite"),
        }
    }
}

/// One cache volume backed by a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSettings {
    pub name: String,

    /// Root directory of the volume.
    pub path: PathBuf,

    /// Maximum bytes of catalogued objects.
    pub capacity: u64,

    /// Status for a newly registered volume; a known volume is only ever
    /// made more restrictive by this.
    #[serde(default)]
    pub status: Option<VolumeStatus>,

    /// Role bitmask.
    #[serde(default)]
    pub roles: u32,

    /// Strategy overriding the cache-wide one for this volume.
    #[serde(default)]
    pub strategy: Option<StrategyKind>,
}

/// Eviction policy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Cache-wide selection strategy.
    pub strategy: StrategyKind,

    /// Age beyond which objects become eligible on age alone.
    pub turnover_age_hours: f64,

    /// Size at which the size contribution to a score saturates.
    pub turnover_size: f64,

    /// Objects younger than this are never chosen by the recency strategy.
    pub min_age_secs: u64,

    /// Priority that scores at face value.
    pub normal_priority: i64,

    /// Extra fraction of the shortfall to scan for candidates.
    pub selection_headroom: f64,

    /// Extra fraction of the request to free beyond the shortfall.
    pub deletion_headroom: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            turnover_age_hours: DEFAULT_TURNOVER_AGE_MS / HOUR_MS,
            turnover_size: DEFAULT_TURNOVER_SIZE,
            min_age_secs: (DEFAULT_MIN_AGE_MS / 1000) as u64,
            normal_priority: DEFAULT_PRIORITY,
            selection_headroom: DEFAULT_SELECTION_HEADROOM,
            deletion_headroom: DEFAULT_DELETION_HEADROOM,
        }
    }
}

impl EvictionConfig {
    pub fn tuning(&self) -> StrategyTuning {
        StrategyTuning {
            turnover_age_ms: self.turnover_age_hours * HOUR_MS,
            turnover_size: self.turnover_size,
            min_age_ms: (self.min_age_secs * 1000) as i64,
            normal_priority: self.normal_priority,
        }
    }
}

/// Checks an integrity sweep may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Size,
    Checksum,
    Expiry,
}

/// Integrity sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Checks run, in order.
    pub checks: Vec<CheckKind>,

    /// Time-to-live enforced by the expiry check.
    pub expiry_days: u64,

    /// Default number of objects examined per sweep.
    pub sample_limit: usize,

    /// Objects checked more recently than this are skipped.
    pub check_grace_secs: u64,

    /// Non-integrity errors tolerated before a sweep aborts.
    pub fail_limit: usize,

    /// Verify objects as they are written into the cache.
    pub verify_on_save: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            checks: vec![CheckKind::Size, CheckKind::Checksum],
            expiry_days: 14,
            sample_limit: 100,
            check_grace_secs: DEFAULT_CHECK_GRACE.as_secs(),
            fail_limit: DEFAULT_FAIL_LIMIT,
            verify_on_save: false,
        }
    }
}

impl IntegrityConfig {
    pub fn expiry_ttl(&self) -> Duration {
        Duration::from_secs(self.expiry_days * 24 * 3600)
    }

    pub fn check_grace(&self) -> Duration {
        Duration::from_secs(self.check_grace_secs)
    }
}

/// Restorer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreKind {
    #[default]
    FileCopy,
    ZipFile,
    ZipRepo,
}

/// Long-term storage and restorer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub kind: RestoreKind,

    /// Root directory of long-term storage.
    pub root: PathBuf,

    /// Archive holding every object (`zip_file` only).
    pub archive: Option<String>,

    /// Prefix every id must carry (`zip_file` only).
    pub prefix: Option<String>,

    /// Role bitmask for volumes receiving restored objects (0 = any).
    pub roles: u32,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            kind: RestoreKind::default(),
            root: PathBuf::from("/data/archive"),
            archive: None,
            prefix: None,
            roles: 0,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let mut config: Config = serde_json::from_str(&data)?;
            if config.name.is_empty() {
                config.name = "archive-cache".to_string();
            }
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config {
                name: "archive-cache".to_string(),
                ..Config::default()
            })
        }
    }

    /// Total configured capacity across volumes.
    pub fn total_capacity(&self) -> u64 {
        self.volumes.iter().map(|v| v.capacity).sum()
    }
}
