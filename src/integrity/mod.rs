//! Integrity sweeps over cached objects.
//!
//! An [`IntegrityMonitor`] samples catalogued objects that are due for a
//! check, runs every registered [`CacheObjectCheck`] against each, and
//! either reports or removes the ones that fail. Successful checks stamp
//! the object's `checked` time so sweeps rotate through the cache.

pub mod checks;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::cache::object::{now_millis, CachedObject};
use crate::error::{CacheError, Result};
use crate::inventory::{Purpose, SharedCatalog};
use crate::metrics::CacheMetrics;
use crate::volume::CacheVolume;

pub use checks::{AlwaysFailsCheck, ChecksumCheck, ExpiryCheck, FailureKind, SizeCheck};

/// Default number of non-integrity errors tolerated in one sweep.
pub const DEFAULT_FAIL_LIMIT: usize = 10;

/// One validation applied to a cached object.
#[async_trait]
pub trait CacheObjectCheck: Send + Sync + fmt::Debug {
    /// `Ok` if the object passes; an integrity error if it is corrupt.
    async fn check(&self, obj: &CachedObject, volume: &dyn CacheVolume) -> Result<()>;
}

/// Runs checks over objects in a set of volumes.
pub struct IntegrityMonitor {
    name: String,
    catalog: SharedCatalog,
    volumes: HashMap<String, Arc<dyn CacheVolume>>,
    checks: Vec<Arc<dyn CacheObjectCheck>>,
    fail_limit: usize,
    metrics: Option<CacheMetrics>,
}

impl fmt::Debug for IntegrityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityMonitor")
            .field("name", &self.name)
            .field("volumes", &self.volumes.keys().collect::<Vec<_>>())
            .field("checks", &self.checks)
            .field("fail_limit", &self.fail_limit)
            .finish()
    }
}

impl IntegrityMonitor {
    pub fn new(
        name: impl Into<String>,
        catalog: SharedCatalog,
        volumes: HashMap<String, Arc<dyn CacheVolume>>,
        checks: Vec<Arc<dyn CacheObjectCheck>>,
    ) -> Self {
        Self {
            name: name.into(),
            catalog,
            volumes,
            checks,
            fail_limit: DEFAULT_FAIL_LIMIT,
            metrics: None,
        }
    }

    pub fn with_fail_limit(mut self, limit: usize) -> Self {
        self.fail_limit = limit;
        self
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Name of the cache this monitor watches.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn volume_for(&self, obj: &CachedObject) -> Result<&Arc<dyn CacheVolume>> {
        self.volumes
            .get(&obj.volume)
            .ok_or_else(|| CacheError::VolumeNotFound(obj.volume.clone()))
    }

    /// Run every check against `obj` as stored in `volume`, stopping at the
    /// first failure. Nothing is recorded in the catalog.
    pub async fn verify(&self, obj: &CachedObject, volume: &dyn CacheVolume) -> Result<()> {
        for check in &self.checks {
            check.check(obj, volume).await?;
        }
        Ok(())
    }

    /// Check a catalogued object and record the success.
    pub async fn check(&self, obj: &CachedObject) -> Result<()> {
        let volume = self.volume_for(obj)?;
        self.verify(obj, volume.as_ref()).await?;
        self.catalog
            .update_checked_time(&obj.volume, &obj.name, now_millis())?;
        debug!(volume = %obj.volume, name = %obj.name, "object passed checks");
        Ok(())
    }

    /// Objects in this monitor's volumes that are due for a check, least
    /// recently checked first.
    pub fn select_objects_to_be_checked(&self, limit: usize) -> Result<Vec<CachedObject>> {
        let mut due = self.catalog.select_objects(Purpose::Check, None)?;
        due.retain(|o| self.volumes.contains_key(&o.volume));
        due.truncate(limit);
        Ok(due)
    }

    /// Check each candidate, collecting failures into `failed`.
    ///
    /// With `remove`, failed objects are deleted from their volume and the
    /// catalog. Objects whose bytes have vanished count as failed. Other
    /// errors are logged and tolerated up to the fail limit, after which
    /// the sweep aborts. Returns the number of objects that passed.
    pub async fn select_corrupted_objects(
        &self,
        candidates: &[CachedObject],
        failed: &mut Vec<CachedObject>,
        remove: bool,
    ) -> Result<usize> {
        let mut passed = 0usize;
        let mut errors = 0usize;
        for obj in candidates {
            match self.check(obj).await {
                Ok(()) => passed += 1,
                Err(e) if e.is_integrity_failure() || e.is_not_found() => {
                    if e.is_not_found() {
                        warn!(volume = %obj.volume, name = %obj.name, "object no longer in its volume");
                    } else {
                        warn!(volume = %obj.volume, name = %obj.name, error = %e, "integrity check failed");
                    }
                    if let Some(m) = &self.metrics {
                        m.integrity_failures.with_label_values(&[obj.volume.as_str()]).inc();
                    }
                    if remove {
                        self.remove_object(obj).await?;
                    }
                    failed.push(obj.clone());
                }
                Err(e) => {
                    errors += 1;
                    if errors > self.fail_limit {
                        return Err(CacheError::management(format!(
                            "Too many check failures; latest: {e}"
                        )));
                    }
                    error!(volume = %obj.volume, name = %obj.name, error = %e, "problem checking object");
                }
            }
        }
        info!(
            cache = %self.name,
            checked = candidates.len(),
            passed,
            failed = failed.len(),
            removed = remove,
            "integrity sweep finished"
        );
        Ok(passed)
    }

    /// Select up to `limit` due objects and check them.
    pub async fn find_corrupted_objects(
        &self,
        limit: usize,
        failed: &mut Vec<CachedObject>,
        remove: bool,
    ) -> Result<usize> {
        let candidates = self.select_objects_to_be_checked(limit)?;
        self.select_corrupted_objects(&candidates, failed, remove).await
    }

    async fn remove_object(&self, obj: &CachedObject) -> Result<bool> {
        let volume = self.volume_for(obj)?;
        let lock = self.catalog.eviction_lock(&obj.volume);
        let _guard = lock.lock().await;
        let removed = volume.remove(&obj.name).await?;
        self.catalog.remove_object(&obj.volume, &obj.name)?;
        info!(volume = %obj.volume, name = %obj.name, "removed failed object");
        Ok(removed)
    }
}
