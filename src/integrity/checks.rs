//! Pluggable object checks.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::CacheObjectCheck;
use crate::cache::object::{now_millis, CachedObject, VOLUME_CHECKSUM};
use crate::checksum::Checksum;
use crate::error::{CacheError, Result, VolumeError};
use crate::inventory::SharedCatalog;
use crate::volume::CacheVolume;

/// Default time-to-live for [`ExpiryCheck`]: two weeks.
pub const DEFAULT_TTL: Duration = Duration::from_secs(14 * 24 * 3600);

/// The stored size must match the catalogued size.
#[derive(Debug, Default, Clone)]
pub struct SizeCheck;

#[async_trait]
impl CacheObjectCheck for SizeCheck {
    async fn check(&self, obj: &CachedObject, volume: &dyn CacheVolume) -> Result<()> {
        let entry = volume.get(&obj.name).await?;
        match obj.size {
            Some(sz) if sz != entry.size => Err(CacheError::integrity(
                &obj.volume,
                &obj.name,
                format!("wrong size: expected={sz} != found={}", entry.size),
            )),
            _ => Ok(()),
        }
    }
}

/// The stored bytes must hash to the catalogued checksum.
#[derive(Debug, Default, Clone)]
pub struct ChecksumCheck {
    /// Fail if the volume's modification time differs from the recorded one.
    pub check_modified: bool,
    /// Trust a checksum the volume keeps instead of re-reading the bytes.
    pub use_volume_checksum: bool,
}

impl ChecksumCheck {
    pub fn new(check_modified: bool, use_volume_checksum: bool) -> Self {
        Self {
            check_modified,
            use_volume_checksum,
        }
    }

    fn check_modified_time(obj: &CachedObject, vol_modified: Option<i64>) -> Result<()> {
        match obj.modified() {
            Some(m) if m > 0 && vol_modified != Some(m) => Err(CacheError::integrity(
                &obj.volume,
                &obj.name,
                format!("modified {vol_modified:?} != recorded {m}"),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CacheObjectCheck for ChecksumCheck {
    async fn check(&self, obj: &CachedObject, volume: &dyn CacheVolume) -> Result<()> {
        let entry = volume.get(&obj.name).await?;
        if let Some(sz) = obj.size {
            if sz != entry.size {
                return Err(CacheError::integrity(
                    &obj.volume,
                    &obj.name,
                    format!("checksum mismatch: size {} != {sz}", entry.size),
                ));
            }
        }
        if self.check_modified {
            Self::check_modified_time(obj, entry.modified)?;
        }

        if self.use_volume_checksum {
            if let (Some(recorded), Some(vol_cs)) = (obj.extra_str(VOLUME_CHECKSUM), &entry.checksum) {
                if !self.check_modified {
                    Self::check_modified_time(obj, entry.modified)?;
                }
                if recorded != vol_cs.hash {
                    return Err(CacheError::integrity(
                        &obj.volume,
                        &obj.name,
                        format!("volume checksum mismatch: {} != {recorded}", vol_cs.hash),
                    ));
                }
                return Ok(());
            }
        }

        let alg = obj.algorithm.as_deref().ok_or_else(|| {
            CacheError::management(format!("{}: missing checksumAlgorithm metadatum", obj.location()))
        })?;
        let hash = obj.checksum.as_deref().ok_or_else(|| {
            CacheError::management(format!("{}: missing checksum metadatum", obj.location()))
        })?;
        if !Checksum::is_supported(alg) {
            return Err(CacheError::management(format!(
                "Unsupported checksum algorithm: {alg}"
            )));
        }

        let mut stream = volume.get_stream(&obj.name).await?;
        let calc = Checksum::calc(alg, &mut stream)
            .await
            .map_err(|e| {
                CacheError::management(format!(
                    "IO error while calculating checksum for {}: {e}",
                    obj.location()
                ))
            })?
            .map(|(cs, _)| cs)
            .ok_or_else(|| CacheError::management(format!("Unsupported checksum algorithm: {alg}")))?;
        if calc.hash != hash {
            return Err(CacheError::integrity(
                &obj.volume,
                &obj.name,
                format!("checksum mismatch: {} != {hash}", calc.hash),
            ));
        }
        debug!(volume = %obj.volume, name = %obj.name, "checksum verified");
        Ok(())
    }
}

/// Removes objects older than a fixed time-to-live.
///
/// Expiry is enforced by the check itself: an expired object is deleted
/// from its volume and the catalog whatever the caller asked for, and the
/// check then passes. An object with no known modification time fails.
#[derive(Debug, Clone)]
pub struct ExpiryCheck {
    catalog: SharedCatalog,
    ttl_ms: i64,
}

impl ExpiryCheck {
    pub fn new(catalog: SharedCatalog) -> Self {
        Self::with_ttl(catalog, DEFAULT_TTL)
    }

    pub fn with_ttl(catalog: SharedCatalog, ttl: Duration) -> Self {
        Self {
            catalog,
            ttl_ms: ttl.as_millis() as i64,
        }
    }
}

#[async_trait]
impl CacheObjectCheck for ExpiryCheck {
    async fn check(&self, obj: &CachedObject, volume: &dyn CacheVolume) -> Result<()> {
        let modified = obj.last_modified().ok_or_else(|| {
            CacheError::integrity(&obj.volume, &obj.name, "last modified time is unknown")
        })?;
        let age = now_millis() - modified;
        if age <= self.ttl_ms {
            return Ok(());
        }

        let lock = self.catalog.eviction_lock(&obj.volume);
        let _guard = lock.lock().await;
        if !volume.remove(&obj.name).await? {
            debug!(volume = %obj.volume, name = %obj.name, "expired object already gone from volume");
        }
        self.catalog.remove_object(&obj.volume, &obj.name)?;
        info!(volume = %obj.volume, name = %obj.name, age_ms = age, "removed expired object");
        Ok(())
    }
}

/// How an [`AlwaysFailsCheck`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureKind {
    #[default]
    Integrity,
    Storage,
    Management,
}

/// Fails every object; for exercising failure paths.
#[derive(Debug, Clone)]
pub struct AlwaysFailsCheck {
    pub message: String,
    pub kind: FailureKind,
}

impl Default for AlwaysFailsCheck {
    fn default() -> Self {
        Self {
            message: "Compulsory integrity failure".into(),
            kind: FailureKind::Integrity,
        }
    }
}

impl AlwaysFailsCheck {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

#[async_trait]
impl CacheObjectCheck for AlwaysFailsCheck {
    async fn check(&self, obj: &CachedObject, _volume: &dyn CacheVolume) -> Result<()> {
        Err(match self.kind {
            FailureKind::Integrity => CacheError::integrity(&obj.volume, &obj.name, &self.message),
            FailureKind::Storage => VolumeError::StorageState(self.message.clone()).into(),
            FailureKind::Management => CacheError::management(self.message.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{CRC32, SHA256};
    use crate::inventory::Catalog;
    use crate::volume::MemoryVolume;
    use std::sync::Arc;

    async fn stored(data: &[u8]) -> (MemoryVolume, CachedObject) {
        let vol = MemoryVolume::new("mem");
        vol.put("obj", data.to_vec()).await;
        let mut obj = CachedObject::new("mem", "obj");
        obj.size = Some(data.len() as u64);
        obj.checksum = Some(Checksum::sha256_of(data).hash);
        obj.algorithm = Some(SHA256.into());
        (vol, obj)
    }

    #[tokio::test]
    async fn test_size_check() {
        let (vol, mut obj) = stored(b"twelve bytes").await;
        SizeCheck.check(&obj, &vol).await.unwrap();
        obj.size = Some(13);
        let err = SizeCheck.check(&obj, &vol).await.unwrap_err();
        assert!(err.is_integrity_failure());
        obj.name = "missing".into();
        assert!(SizeCheck.check(&obj, &vol).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_checksum_check() {
        let (vol, mut obj) = stored(b"contents").await;
        let chk = ChecksumCheck::default();
        chk.check(&obj, &vol).await.unwrap();

        obj.checksum = Some("0000".into());
        assert!(chk.check(&obj, &vol).await.unwrap_err().is_integrity_failure());

        obj.algorithm = Some("md5".into());
        assert!(matches!(
            chk.check(&obj, &vol).await.unwrap_err(),
            CacheError::CacheManagement(_)
        ));
    }

    #[tokio::test]
    async fn test_checksum_check_recomputes_crc32() {
        let (vol, mut obj) = stored(b"123456789").await;
        obj.algorithm = Some(CRC32.into());
        obj.checksum = Some("cbf43926".into());
        let chk = ChecksumCheck::default();
        chk.check(&obj, &vol).await.unwrap();

        obj.checksum = Some("00000000".into());
        assert!(chk.check(&obj, &vol).await.unwrap_err().is_integrity_failure());
    }

    #[tokio::test]
    async fn test_checksum_check_trusts_volume_checksum() {
        let (vol, mut obj) = stored(b"contents").await;
        let hash = obj.checksum.take().unwrap();
        obj.extra.insert(VOLUME_CHECKSUM.into(), hash.into());
        let chk = ChecksumCheck::new(false, true);
        chk.check(&obj, &vol).await.unwrap();
        obj.extra.insert(VOLUME_CHECKSUM.into(), "bad".into());
        assert!(chk.check(&obj, &vol).await.unwrap_err().is_integrity_failure());
    }

    #[tokio::test]
    async fn test_always_fails() {
        let (vol, obj) = stored(b"x").await;
        assert!(AlwaysFailsCheck::default()
            .check(&obj, &vol)
            .await
            .unwrap_err()
            .is_integrity_failure());
        let storage = AlwaysFailsCheck::new(FailureKind::Storage, "flaky");
        assert!(storage.check(&obj, &vol).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_expiry_requires_known_time() {
        let catalog = Arc::new(Catalog::in_memory().unwrap());
        let (vol, obj) = stored(b"x").await;
        let err = ExpiryCheck::new(catalog).check(&obj, &vol).await.unwrap_err();
        assert!(err.is_integrity_failure());
    }
}
