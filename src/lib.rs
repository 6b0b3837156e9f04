//! archive-cache: a multi-volume disk cache in front of a write-once
//! archival store.
//!
//! Objects are restored from long-term storage on a miss, written into a
//! cache volume through a space [`Reservation`](cache::Reservation), and
//! recorded in a SQLite [`Catalog`](inventory::Catalog). When a volume
//! fills up, a [`DeletionPlanner`](cache::DeletionPlanner) evicts the
//! objects a [`SelectionStrategy`](cache::SelectionStrategy) ranks as least
//! valuable. An [`IntegrityMonitor`](integrity::IntegrityMonitor) sweeps
//! the cache for corrupted and expired objects.

pub mod cache;
pub mod checksum;
pub mod config;
pub mod error;
pub mod integrity;
pub mod inventory;
pub mod manager;
pub mod metrics;
pub mod restore;
pub mod storage;
pub mod volume;

pub use error::{CacheError, Result, VolumeError};
