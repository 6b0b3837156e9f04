//! Cache management: what is cached, what to evict, and where new objects go.
//!
//! - [`object`]: CachedObject and metadata helpers
//! - [`strategy`]: Eviction scoring (recency, size, big-and-old)
//! - [`plan`]: Deletion planner and plans, executed under a per-volume lock
//! - [`reservation`]: Space claims that new objects are written through
//! - [`observer`]: Reservation, save and deletion listeners
//! - [`manager`]: The Cache tying volumes, catalog and planner together

pub mod manager;
pub mod object;
pub mod observer;
pub mod plan;
pub mod reservation;
pub mod strategy;

pub use manager::{Cache, VolumeConfig};
pub use object::{CachedObject, Metadata};
pub use plan::{DeletionPlan, DeletionPlanner};
pub use reservation::Reservation;
pub use strategy::{BigOldStrategy, BySizeStrategy, OldestStrategy, SelectionStrategy, StrategyKind};
