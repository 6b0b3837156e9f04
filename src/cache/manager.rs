//! The [`Cache`]: attached volumes, their catalog and the planner that
//! makes room in them.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::cache::object::{CachedObject, Metadata};
use crate::cache::observer::Observers;
use crate::cache::plan::{order_plans, DeletionPlan, DeletionPlanner};
use crate::cache::reservation::Reservation;
use crate::cache::strategy::SelectionStrategy;
use crate::error::{CacheError, Result};
use crate::integrity::{CacheObjectCheck, IntegrityMonitor};
use crate::inventory::{SharedCatalog, VolumeStatus};
use crate::metrics::CacheMetrics;
use crate::volume::CacheVolume;

/// How a volume takes part in the cache.
#[derive(Debug, Clone, Default)]
pub struct VolumeConfig {
    /// Status to apply. An existing volume is only ever moved to a more
    /// restrictive status by this setting.
    pub status: Option<VolumeStatus>,
    /// Role bitmask; 0 leaves the recorded roles alone.
    pub roles: u32,
    /// Strategy used instead of the cache-wide one when planning for this
    /// volume.
    pub strategy: Option<Arc<dyn SelectionStrategy>>,
}

impl VolumeConfig {
    pub fn with_status(mut self, status: VolumeStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_roles(mut self, roles: u32) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SelectionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

struct Attached {
    volume: Arc<dyn CacheVolume>,
    strategy: Option<Arc<dyn SelectionStrategy>>,
}

/// A set of volumes managed as one cache.
pub struct Cache {
    name: String,
    catalog: SharedCatalog,
    planner: DeletionPlanner,
    /// Attachment order; volumes are tried in this order.
    order: Vec<String>,
    volumes: HashMap<String, Attached>,
    observers: Arc<Observers>,
    checker: Option<Arc<IntegrityMonitor>>,
    metrics: Option<CacheMetrics>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("volumes", &self.order)
            .field("planner", &self.planner)
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(name: impl Into<String>, catalog: SharedCatalog, planner: DeletionPlanner) -> Self {
        Self {
            name: name.into(),
            catalog,
            planner,
            order: Vec::new(),
            volumes: HashMap::new(),
            observers: Arc::new(Observers::new()),
            checker: None,
            metrics: None,
        }
    }

    /// Verify objects written through this cache's reservations.
    pub fn with_checker(mut self, checker: Arc<IntegrityMonitor>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn set_checker(&mut self, checker: Option<Arc<IntegrityMonitor>>) {
        self.checker = checker;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &SharedCatalog {
        &self.catalog
    }

    pub fn observers(&self) -> &Arc<Observers> {
        &self.observers
    }

    pub fn metrics(&self) -> Option<&CacheMetrics> {
        self.metrics.as_ref()
    }

    /// Names of the attached volumes, in attachment order.
    pub fn volume_names(&self) -> &[String] {
        &self.order
    }

    pub fn volume(&self, name: &str) -> Option<&Arc<dyn CacheVolume>> {
        self.volumes.get(name).map(|a| &a.volume)
    }

    /// Attach `volume` with the given `capacity`.
    ///
    /// The volume is (re-)registered in the catalog when it is unknown or
    /// `persist` is set. A configured status is applied to a new volume; a
    /// known volume only ever moves to a more restrictive status here.
    pub fn add_cache_volume(
        &mut self,
        volume: Arc<dyn CacheVolume>,
        capacity: u64,
        metadata: Option<&Metadata>,
        config: VolumeConfig,
        persist: bool,
    ) -> Result<()> {
        let vol = volume.name().to_string();
        if self.volumes.contains_key(&vol) {
            return Err(CacheError::inventory(format!(
                "{vol}: a volume with this name is already attached"
            )));
        }

        let mut md = metadata.cloned().unwrap_or_default();
        if config.roles > 0 {
            md.insert("roles".into(), Value::from(config.roles));
        }
        if let Some(status) = config.status {
            md.insert("status".into(), Value::from(status.code()));
        }

        let known = match self.catalog.volume_status(&vol) {
            Ok(current) => Some(current),
            Err(CacheError::VolumeNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if known.is_none() || persist {
            self.catalog.register_volume(&vol, capacity, Some(&md))?;
        }
        if let (Some(current), Some(wanted)) = (known, config.status) {
            if wanted < current {
                self.catalog.set_volume_status(&vol, wanted)?;
                info!(volume = %vol, from = %current, to = %wanted, "volume status restricted by configuration");
            } else if wanted > current {
                warn!(volume = %vol, current = %current, configured = %wanted, "not raising volume status from configuration");
            }
        }

        self.order.push(vol.clone());
        self.volumes.insert(
            vol.clone(),
            Attached {
                volume,
                strategy: config.strategy,
            },
        );
        info!(cache = %self.name, volume = %vol, capacity, "attached cache volume");
        Ok(())
    }

    /// Attached volumes available for update whose roles intersect `roles`
    /// (all of them when `roles` is 0), in attachment order.
    pub fn select_volumes(&self, roles: u32) -> Result<Vec<Arc<dyn CacheVolume>>> {
        let mut out = Vec::new();
        for name in &self.order {
            let info = match self.catalog.volume_info(name) {
                Ok(info) => info,
                Err(CacheError::VolumeNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if !info.status.allows_update() {
                debug!(volume = %name, status = %info.status, "volume not available for updates; skipping");
                continue;
            }
            if !info.has_role(roles) {
                continue;
            }
            if let Some(a) = self.volumes.get(name) {
                out.push(a.volume.clone());
            }
        }
        Ok(out)
    }

    /// The strategy configured for `volume`, else the cache-wide one.
    pub fn get_strategy_for(&self, volume: &str) -> &dyn SelectionStrategy {
        match self.volumes.get(volume).and_then(|a| a.strategy.as_ref()) {
            Some(s) => s.as_ref(),
            None => self.planner.strategy().as_ref(),
        }
    }

    /// Claim `size` bytes in some volume matching `roles`, evicting objects
    /// if no volume has the room already.
    pub async fn reserve_space(&self, size: u64, roles: u32) -> Result<Reservation> {
        let vols = self.select_volumes(roles)?;
        if vols.is_empty() {
            return Err(CacheError::NoMatchingVolumes(roles));
        }

        let mut plans: Vec<DeletionPlan> = Vec::with_capacity(vols.len());
        let mut problems = 0usize;
        for vol in vols {
            let name = vol.name().to_string();
            match self
                .planner
                .plan(vol, size, Some(self.get_strategy_for(&name)))
            {
                Ok(plan) if plan.is_sufficient() => plans.push(self.equip(plan)),
                Ok(plan) => debug!(
                    volume = %name,
                    size,
                    target = plan.target(),
                    planned = plan.planned_bytes(),
                    "volume cannot free enough space"
                ),
                Err(e @ (CacheError::Inventory(_) | CacheError::InventoryState(_))) => return Err(e),
                Err(e) => {
                    warn!(volume = %name, error = %e, "trouble creating deletion plan");
                    problems += 1;
                }
            }
        }
        if plans.is_empty() {
            let mut msg = format!("Failed to generate any deletion plans for size={size}");
            if problems > 0 {
                msg.push_str(", possibly due to unexpected errors (see log)");
            }
            error!(cache = %self.name, "{msg}");
            return Err(CacheError::DeletionFailure(msg));
        }

        order_plans(&mut plans);
        for plan in &plans {
            match plan.execute_and_reserve().await {
                Ok(res) => return Ok(self.granted(res, size)),
                Err(e @ (CacheError::DeletionFailure(_) | CacheError::InvalidState(_))) => {
                    warn!(volume = %plan.volume_name(), error = %e, "deletion plan failed; trying next plan");
                }
                Err(e) => return Err(e),
            }
        }
        Err(CacheError::DeletionFailure(
            "All deletion plans failed to produce enough space (see log for details)".into(),
        ))
    }

    fn equip(&self, plan: DeletionPlan) -> DeletionPlan {
        let plan = plan.with_observers(self.observers.clone());
        match &self.metrics {
            Some(m) => plan.with_metrics(m.clone()),
            None => plan,
        }
    }

    fn granted(&self, mut res: Reservation, size: u64) -> Reservation {
        if let Some(checker) = &self.checker {
            res = res.with_checker(checker.clone());
        }
        let vol = res.volume_name().to_string();
        if let Some(m) = &self.metrics {
            m.reservations.with_label_values(&[vol.as_str()]).inc();
        }
        info!(cache = %self.name, volume = %vol, size, reservation = %res.name(), "space reserved for caller");
        self.observers.reservation_made(&vol, size);
        res
    }

    /// Whether any readable volume holds a copy of `id`.
    pub fn is_cached(&self, id: &str) -> Result<bool> {
        Ok(!self.catalog.find_object(id)?.is_empty())
    }

    /// A catalogued copy of `id` whose bytes are still present.
    ///
    /// When every catalogued copy has vanished from its volume the stale
    /// rows are removed and `None` is returned.
    pub async fn find_object(&self, id: &str) -> Result<Option<CachedObject>> {
        let found = self.catalog.find_object(id)?;
        if found.is_empty() {
            return Ok(None);
        }

        let mut trouble = false;
        for obj in found {
            let Some(vol) = self.volume(&obj.volume) else {
                continue;
            };
            match vol.exists(&obj.name).await {
                Ok(true) => return Ok(Some(obj)),
                Ok(false) => {}
                Err(e) => {
                    error!(volume = %obj.volume, error = %e, "trouble interacting with volume");
                    trouble = true;
                }
            }
        }

        error!(id, "volumes appear out of sync with inventory: all found objects inaccessible");
        if trouble {
            return Err(CacheError::management(format!("{id}: object is inaccessible")));
        }
        info!(id, "cleaning up the inventory");
        self.uncache(id).await?;
        Ok(None)
    }

    /// Record that `obj` was just used.
    pub fn confirm_access_of(&self, obj: &CachedObject) -> Result<bool> {
        self.catalog.update_access_time(&obj.volume, &obj.name)
    }

    /// Remove every copy of `id` from its volume and the catalog. Returns
    /// the number of catalogued copies removed.
    pub async fn uncache(&self, id: &str) -> Result<usize> {
        let copies = self.catalog.find_object_for(id, VolumeStatus::Disabled)?;
        let mut removed = 0usize;
        for obj in copies {
            let lock = self.catalog.eviction_lock(&obj.volume);
            let _guard = lock.lock().await;
            if let Some(vol) = self.volume(&obj.volume) {
                vol.remove(&obj.name).await.map_err(|e| {
                    CacheError::management(format!(
                        "Problem removing obj, {id}, from vol, {}: {e}",
                        obj.volume
                    ))
                })?;
            }
            if self.catalog.remove_object(&obj.volume, &obj.name)? {
                removed += 1;
                let freed = obj.size_bytes();
                if let Some(m) = &self.metrics {
                    m.record_eviction(&obj.volume, 1, freed);
                }
                self.observers
                    .objects_deleted(&obj.volume, std::slice::from_ref(&obj.name), freed);
            }
            debug!(id, volume = %obj.volume, name = %obj.name, "uncached object");
        }
        if removed > 0 {
            info!(id, copies = removed, "uncached");
        }
        Ok(removed)
    }

    /// An integrity monitor over this cache's volumes.
    pub fn integrity_monitor(&self, checks: Vec<Arc<dyn CacheObjectCheck>>) -> IntegrityMonitor {
        let volumes = self
            .volumes
            .iter()
            .map(|(name, a)| (name.clone(), a.volume.clone()))
            .collect();
        let monitor = IntegrityMonitor::new(self.name.clone(), self.catalog.clone(), volumes, checks);
        match &self.metrics {
            Some(m) => monitor.with_metrics(m.clone()),
            None => monitor,
        }
    }

    /// Refresh the space gauges for every attached volume.
    pub fn record_space(&self) -> Result<()> {
        let Some(m) = &self.metrics else {
            return Ok(());
        };
        for name in &self.order {
            m.record_space(
                name,
                self.catalog.used_space_in(name)?,
                self.catalog.available_space_in(name)?,
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::strategy::BigOldStrategy;
    use crate::inventory::{Catalog, ROLE_FAST_ACCESS, ROLE_GENERAL_PURPOSE};
    use crate::volume::MemoryVolume;

    fn cache() -> Cache {
        let catalog = Arc::new(Catalog::in_memory().unwrap());
        let planner = DeletionPlanner::new(catalog.clone(), Arc::new(BigOldStrategy::new(u64::MAX)));
        Cache::new("test", catalog, planner)
    }

    #[test]
    fn test_add_volume_never_raises_status() {
        let mut c = cache();
        c.catalog()
            .register_volume("old", 100, None)
            .unwrap();
        c.catalog()
            .set_volume_status("old", VolumeStatus::ForGet)
            .unwrap();
        let cfg = VolumeConfig::default().with_status(VolumeStatus::ForUpdate);
        c.add_cache_volume(Arc::new(MemoryVolume::new("old")), 100, None, cfg, true)
            .unwrap();
        assert_eq!(c.catalog().volume_status("old").unwrap(), VolumeStatus::ForGet);

        let cfg = VolumeConfig::default().with_status(VolumeStatus::Disabled);
        c.add_cache_volume(Arc::new(MemoryVolume::new("new")), 100, None, cfg, false)
            .unwrap();
        assert_eq!(c.catalog().volume_status("new").unwrap(), VolumeStatus::Disabled);

        let err = c
            .add_cache_volume(Arc::new(MemoryVolume::new("new")), 100, None, VolumeConfig::default(), false)
            .unwrap_err();
        assert!(matches!(err, CacheError::InventoryState(_)));
    }

    #[test]
    fn test_select_volumes_by_role() {
        let mut c = cache();
        for (name, roles) in [("a", ROLE_GENERAL_PURPOSE), ("b", ROLE_FAST_ACCESS), ("c", ROLE_FAST_ACCESS)] {
            let cfg = VolumeConfig::default().with_roles(roles);
            c.add_cache_volume(Arc::new(MemoryVolume::new(name)), 100, None, cfg, false)
                .unwrap();
        }
        c.catalog().set_volume_status("c", VolumeStatus::ForGet).unwrap();

        let names = |v: Vec<Arc<dyn CacheVolume>>| v.iter().map(|v| v.name().to_string()).collect::<Vec<_>>();
        assert_eq!(names(c.select_volumes(0).unwrap()), vec!["a", "b"]);
        assert_eq!(names(c.select_volumes(ROLE_FAST_ACCESS).unwrap()), vec!["b"]);
        assert!(c.select_volumes(16).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserve_requires_matching_volume() {
        let c = cache();
        let err = c.reserve_space(10, ROLE_FAST_ACCESS).await.unwrap_err();
        assert!(matches!(err, CacheError::NoMatchingVolumes(ROLE_FAST_ACCESS)));
    }
}
