//! Cache volumes: where cached bytes actually live.
//!
//! The engine only relies on the [`CacheVolume`] contract; adapters here:
//!
//! - [`MemoryVolume`]: in-process map, used by tests and dry runs
//! - [`FilesystemVolume`]: a directory tree on local or network disk

pub mod fs;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::cache::object::Metadata;
use crate::checksum::Checksum;
use crate::error::VolumeError;

pub use fs::FilesystemVolume;
pub use memory::MemoryVolume;

/// Readable payload handed between volumes, storage and reservations.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// What a volume can report about one stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeEntry {
    pub name: String,
    pub size: u64,
    /// Last modification, epoch milliseconds, when the volume tracks it.
    pub modified: Option<i64>,
    /// A checksum computed by the volume itself, when it keeps one.
    pub checksum: Option<Checksum>,
}

/// A storage area participating in the cache.
#[async_trait]
pub trait CacheVolume: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn exists(&self, name: &str) -> Result<bool, VolumeError>;

    /// Store everything readable from `from` under `name`, replacing any
    /// existing object. Returns the number of bytes written.
    async fn save_as(
        &self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<u64, VolumeError>;

    /// Store a copy of `from_name` held by `source` under `name`.
    async fn save_copy(
        &self,
        source: &dyn CacheVolume,
        from_name: &str,
        name: &str,
    ) -> Result<u64, VolumeError> {
        let mut stream = source.get_stream(from_name).await?;
        self.save_as(&mut stream, name, None).await
    }

    async fn get_stream(&self, name: &str) -> Result<ByteStream, VolumeError>;

    async fn get(&self, name: &str) -> Result<VolumeEntry, VolumeError>;

    /// Delete `name`; `false` if it wasn't there.
    async fn remove(&self, name: &str) -> Result<bool, VolumeError>;

    /// A URL from which `name` can be fetched directly.
    async fn redirect_for(&self, name: &str) -> Result<String, VolumeError> {
        Err(VolumeError::Unsupported(format!(
            "{}: redirects not available for {name}",
            self.name()
        )))
    }
}
