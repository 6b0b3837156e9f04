//! Deletion planning and execution.
//!
//! The [`DeletionPlanner`] turns "I need N bytes in volume V" into a
//! [`DeletionPlan`]: the highest-scoring eviction candidates whose sizes add
//! up to the shortfall. Execution holds the volume's eviction lock and
//! re-checks the volume status before every deletion.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::cache::object::CachedObject;
use crate::cache::observer::Observers;
use crate::cache::reservation::Reservation;
use crate::cache::strategy::SelectionStrategy;
use crate::error::{CacheError, Result};
use crate::inventory::SharedCatalog;
use crate::metrics::CacheMetrics;
use crate::volume::CacheVolume;

/// Default extra fraction of the shortfall to scan for candidates.
pub const DEFAULT_SELECTION_HEADROOM: f64 = 0.2;
/// Default extra fraction of the need to free beyond the shortfall.
pub const DEFAULT_DELETION_HEADROOM: f64 = 0.02;

/// An ordered batch of objects to evict from one volume.
pub struct DeletionPlan {
    volume: Arc<dyn CacheVolume>,
    catalog: SharedCatalog,
    candidates: Vec<CachedObject>,
    target: u64,
    need: u64,
    /// Lower is better; an empty plan scores 0.
    pub score: f64,
    observers: Option<Arc<Observers>>,
    metrics: Option<CacheMetrics>,
}

impl std::fmt::Debug for DeletionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionPlan")
            .field("volume", &self.volume.name())
            .field("candidates", &self.candidates.len())
            .field("target", &self.target)
            .field("need", &self.need)
            .field("score", &self.score)
            .finish()
    }
}

impl DeletionPlan {
    /// A plan to remove `target` bytes from `volume` by deleting, in order,
    /// as many of `candidates` as it takes, so that `need` bytes can then be
    /// reserved.
    pub fn new(
        volume: Arc<dyn CacheVolume>,
        catalog: SharedCatalog,
        candidates: Vec<CachedObject>,
        target: u64,
        need: u64,
    ) -> Self {
        Self {
            volume,
            catalog,
            candidates,
            target,
            need,
            score: 0.0,
            observers: None,
            metrics: None,
        }
    }

    pub fn with_observers(mut self, observers: Arc<Observers>) -> Self {
        self.observers = Some(observers);
        self
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn volume_name(&self) -> &str {
        self.volume.name()
    }

    /// Bytes this plan intends to free.
    pub fn target(&self) -> u64 {
        self.target
    }

    /// Bytes the caller wants reserved afterwards.
    pub fn need(&self) -> u64 {
        self.need
    }

    pub fn candidates(&self) -> &[CachedObject] {
        &self.candidates
    }

    /// Total recorded size of all candidates.
    pub fn planned_bytes(&self) -> u64 {
        self.candidates.iter().map(CachedObject::size_bytes).sum()
    }

    /// Whether deleting every candidate would reach the target.
    pub fn is_sufficient(&self) -> bool {
        self.planned_bytes() >= self.target
    }

    /// Delete candidates until the target is met. Returns bytes freed.
    pub async fn execute(&self) -> Result<u64> {
        let lock = self.catalog.eviction_lock(self.volume.name());
        let _guard = lock.lock().await;
        self.execute_locked().await
    }

    /// Execute, then reserve the caller's need in the freed space.
    pub async fn execute_and_reserve(&self) -> Result<Reservation> {
        let vol = self.volume.name();
        let lock = self.catalog.eviction_lock(vol);
        let _guard = lock.lock().await;

        let removed = self.execute_locked().await?;
        if removed < self.target {
            return Err(CacheError::DeletionFailure(format!(
                "plan for {vol} proved insufficient: {} bytes needed, removed only {removed}",
                self.target
            )));
        }
        let avail = self.catalog.available_space_in(vol)?;
        if avail < self.need as i64 {
            return Err(CacheError::DeletionFailure(format!(
                "after deleting, {vol} still lacks space: {} bytes needed, have only {avail}",
                self.need
            )));
        }

        let mut res =
            Reservation::reservation_for(self.volume.clone(), self.catalog.clone(), self.need)?;
        if let Some(obs) = &self.observers {
            res = res.with_observers(obs.clone());
        }
        if let Some(m) = &self.metrics {
            res = res.with_metrics(m.clone());
        }
        Ok(res)
    }

    fn ensure_updatable(&self) -> Result<()> {
        let status = self.catalog.volume_status(self.volume.name())?;
        if status.allows_update() {
            Ok(())
        } else {
            Err(CacheError::InvalidState(format!(
                "volume {} not available for updates (status {status})",
                self.volume.name()
            )))
        }
    }

    async fn execute_locked(&self) -> Result<u64> {
        let vol = self.volume.name();
        self.ensure_updatable()?;

        let mut removed = 0u64;
        let mut deleted = Vec::new();
        let mut outcome = Ok(());
        for obj in &self.candidates {
            if removed >= self.target {
                break;
            }
            if let Err(e) = self.ensure_updatable() {
                outcome = Err(e);
                break;
            }
            if let Err(e) = self.volume.remove(&obj.name).await {
                warn!(volume = %vol, name = %obj.name, error = %e, "could not evict object; skipping");
                continue;
            }
            if let Err(e) = self.catalog.remove_object(vol, &obj.name) {
                error!(volume = %vol, name = %obj.name, error = %e, "evicted object but could not update inventory");
                outcome = Err(e);
                break;
            }
            removed += obj.size_bytes();
            debug!(volume = %vol, name = %obj.name, size = obj.size_bytes(), score = obj.score, "evicted object");
            deleted.push(obj.name.clone());
        }

        if !deleted.is_empty() {
            info!(volume = %vol, objects = deleted.len(), bytes = removed, target = self.target, "eviction complete");
            if let Some(m) = &self.metrics {
                m.record_eviction(vol, deleted.len() as u64, removed);
            }
            if let Some(obs) = &self.observers {
                obs.objects_deleted(vol, &deleted, removed);
            }
        }
        outcome.map(|_| removed)
    }
}

/// Builds deletion plans for volumes using a prototype strategy.
pub struct DeletionPlanner {
    catalog: SharedCatalog,
    strategy: Arc<dyn SelectionStrategy>,
    selection_headroom: f64,
    deletion_headroom: f64,
}

impl std::fmt::Debug for DeletionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionPlanner")
            .field("strategy", &self.strategy)
            .field("selection_headroom", &self.selection_headroom)
            .field("deletion_headroom", &self.deletion_headroom)
            .finish()
    }
}

impl DeletionPlanner {
    pub fn new(catalog: SharedCatalog, strategy: Arc<dyn SelectionStrategy>) -> Self {
        Self {
            catalog,
            strategy,
            selection_headroom: DEFAULT_SELECTION_HEADROOM,
            deletion_headroom: DEFAULT_DELETION_HEADROOM,
        }
    }

    pub fn with_headroom(mut self, selection: f64, deletion: f64) -> Self {
        self.selection_headroom = selection.max(0.0);
        self.deletion_headroom = deletion.max(0.0);
        self
    }

    pub fn strategy(&self) -> &Arc<dyn SelectionStrategy> {
        &self.strategy
    }

    /// Plan to make `need` bytes available in `volume`.
    ///
    /// If the volume already has comfortably more than `need` free, the
    /// plan is empty. A plan whose candidates cannot cover the shortfall is
    /// still returned; check [`DeletionPlan::is_sufficient`].
    pub fn plan(
        &self,
        volume: Arc<dyn CacheVolume>,
        need: u64,
        strategy: Option<&dyn SelectionStrategy>,
    ) -> Result<DeletionPlan> {
        let vol = volume.name().to_string();
        let status = self.catalog.volume_status(&vol)?;
        if !status.allows_update() {
            return Err(CacheError::InvalidState(format!(
                "volume {vol} not available for updates (status {status})"
            )));
        }

        let avail = self.catalog.available_space_in(&vol)?;
        let padded = need as f64 * (1.0 + self.deletion_headroom);
        if avail as f64 > padded {
            debug!(volume = %vol, need, avail, "no eviction needed");
            return Ok(DeletionPlan::new(volume, self.catalog.clone(), Vec::new(), 0, need));
        }

        let target = (padded.ceil() as i64 - avail).max(0) as u64;
        let shortfall = (need as i64 - avail).max(0) as f64;
        let limit = target.max((shortfall * (1.0 + self.selection_headroom)) as u64);

        let proto: &dyn SelectionStrategy = match strategy {
            Some(s) => s,
            None => self.strategy.as_ref(),
        };
        let mut scorer = proto.for_size(limit);
        let candidates = self.catalog.select_objects_for(&vol, scorer.as_mut())?;

        let mut chosen = Vec::new();
        let mut total = 0u64;
        let mut score_sum = 0.0;
        for obj in candidates {
            if total >= target {
                break;
            }
            if obj.score <= 0.0 {
                continue;
            }
            total += obj.size_bytes();
            score_sum += obj.score;
            chosen.push(obj);
        }

        let mut plan = DeletionPlan::new(volume, self.catalog.clone(), chosen, target, need);
        if score_sum > 0.0 {
            plan.score = plan.candidates.len() as f64 / score_sum;
        }
        debug!(
            volume = %vol,
            need,
            avail,
            target,
            candidates = plan.candidates.len(),
            planned = total,
            score = plan.score,
            "built deletion plan"
        );
        Ok(plan)
    }
}

/// Sort plans best first (ascending score).
pub fn order_plans(plans: &mut [DeletionPlan]) {
    plans.sort_by(|a, b| a.score.total_cmp(&b.score));
}
