//! Restore-on-miss orchestration over a [`Cache`] and a [`Restorer`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::cache::manager::Cache;
use crate::cache::object::{CachedObject, Metadata, SIZE};
use crate::error::{CacheError, Result};
use crate::restore::Restorer;

/// Serves objects from the cache, restoring them from long-term storage
/// when they are missing.
#[derive(Debug)]
pub struct CacheManager {
    cache: Arc<Cache>,
    restorer: Arc<dyn Restorer>,
    roles: u32,
}

fn not_found_as_target(id: &str, e: CacheError) -> CacheError {
    if e.is_not_found() {
        CacheError::RestorationTargetNotFound(id.to_string())
    } else {
        e
    }
}

impl CacheManager {
    pub fn new(cache: Arc<Cache>, restorer: Arc<dyn Restorer>) -> Self {
        Self {
            cache,
            restorer,
            roles: 0,
        }
    }

    /// Only restore into volumes with one of these roles.
    pub fn with_roles(mut self, roles: u32) -> Self {
        self.roles = roles;
        self
    }

    pub fn cache_ref(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn restorer(&self) -> &Arc<dyn Restorer> {
        &self.restorer
    }

    pub fn is_cached(&self, id: &str) -> Result<bool> {
        self.cache.is_cached(id)
    }

    pub async fn find_object(&self, id: &str) -> Result<Option<CachedObject>> {
        self.cache.find_object(id).await
    }

    pub async fn uncache(&self, id: &str) -> Result<usize> {
        self.cache.uncache(id).await
    }

    /// Restore `id` into the cache. Returns `false` without doing anything
    /// if it is already cached and `recache` is not set.
    pub async fn cache(&self, id: &str, recache: bool) -> Result<bool> {
        if !recache && self.cache.is_cached(id)? {
            return Ok(false);
        }
        let result = self.restore(id).await;
        if let Some(m) = self.cache.metrics() {
            match &result {
                Ok(_) => m.restores.inc(),
                Err(_) => m.restore_failures.inc(),
            }
        }
        result.map(|_| true)
    }

    async fn restore(&self, id: &str) -> Result<CachedObject> {
        let size = self
            .restorer
            .size_of(id)
            .await
            .map_err(|e| not_found_as_target(id, e))?;
        let mut resv = self.cache.reserve_space(size, self.roles).await?;
        let name = self.restorer.name_for_object(id);

        let mut md = Metadata::new();
        md.insert(SIZE.into(), Value::from(size));
        let restored = self
            .restorer
            .restore_object(id, &mut resv, &name, Some(&md))
            .await;

        if resv.size() > 0 {
            if let Err(e) = resv.drop_reservation() {
                warn!(id, error = %e, "failed to release leftover reservation");
            }
        }
        let obj = restored.map_err(|e| not_found_as_target(id, e))?;
        info!(id, volume = %obj.volume, name = %obj.name, size, "cached from long-term storage");
        Ok(obj)
    }

    /// The cached copy of `id`, restoring it first if necessary. The
    /// access is recorded.
    pub async fn get_object(&self, id: &str) -> Result<CachedObject> {
        let obj = match self.cache.find_object(id).await? {
            Some(obj) => obj,
            None => {
                self.cache(id, true).await?;
                self.cache.find_object(id).await?.ok_or_else(|| {
                    CacheError::restoration(id, "object missing from cache after restoration")
                })?
            }
        };
        self.cache.confirm_access_of(&obj)?;
        Ok(obj)
    }
}
