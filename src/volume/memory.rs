use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::RwLock;
use tracing::debug;

use super::{ByteStream, CacheVolume, VolumeEntry};
use crate::cache::object::{now_millis, Metadata};
use crate::checksum::Checksum;
use crate::error::VolumeError;

#[derive(Debug, Clone)]
struct Stored {
    data: Bytes,
    modified: i64,
    checksum: Checksum,
}

/// A volume held entirely in memory.
#[derive(Debug)]
pub struct MemoryVolume {
    name: String,
    objects: RwLock<HashMap<String, Stored>>,
}

impl MemoryVolume {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Store `data` directly, bypassing any reservation.
    pub async fn put(&self, name: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let checksum = Checksum::sha256_of(&data);
        self.objects.write().await.insert(
            name.to_string(),
            Stored {
                data,
                modified: now_millis(),
                checksum,
            },
        );
    }

    /// Overwrite the recorded modification time of `name`.
    pub async fn set_modified(&self, name: &str, modified: i64) -> bool {
        match self.objects.write().await.get_mut(name) {
            Some(obj) => {
                obj.modified = modified;
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.objects.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn missing(&self, name: &str) -> VolumeError {
        VolumeError::not_found(name, &self.name)
    }
}

#[async_trait]
impl CacheVolume for MemoryVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, name: &str) -> Result<bool, VolumeError> {
        Ok(self.objects.read().await.contains_key(name))
    }

    async fn save_as(
        &self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _metadata: Option<&Metadata>,
    ) -> Result<u64, VolumeError> {
        let mut buf = Vec::new();
        let n = from.read_to_end(&mut buf).await?;
        self.put(name, buf).await;
        debug!(volume = %self.name, name, bytes = n, "stored object in memory");
        Ok(n as u64)
    }

    async fn get_stream(&self, name: &str) -> Result<ByteStream, VolumeError> {
        let data = self
            .objects
            .read()
            .await
            .get(name)
            .map(|o| o.data.clone())
            .ok_or_else(|| self.missing(name))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn get(&self, name: &str) -> Result<VolumeEntry, VolumeError> {
        let objects = self.objects.read().await;
        let obj = objects.get(name).ok_or_else(|| self.missing(name))?;
        Ok(VolumeEntry {
            name: name.to_string(),
            size: obj.data.len() as u64,
            modified: Some(obj.modified),
            checksum: Some(obj.checksum.clone()),
        })
    }

    async fn remove(&self, name: &str) -> Result<bool, VolumeError> {
        Ok(self.objects.write().await.remove(name).is_some())
    }
}
