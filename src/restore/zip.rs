//! Restorers reading entries out of zip archives.
//!
//! An archive is read whole from long-term storage and decoded on a
//! blocking thread; the requested entry is inflated into memory before it
//! is streamed into the cache.

use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::debug;
use zip::result::ZipError;
use zip::ZipArchive;

use super::Restorer;
use crate::checksum::Checksum;
use crate::error::{CacheError, Result, VolumeError};
use crate::storage::{FilesystemLongTermStorage, LongTermStorage};
use crate::volume::ByteStream;

/// Size and CRC-32 recorded in an archive entry's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntryInfo {
    size: u64,
    crc32: u32,
}

/// Where an id lives: the archive holding it and the entry name within.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    archive: String,
    entry: String,
}

/// How ids map to archive entries.
#[derive(Debug, Clone)]
enum Locator {
    /// One archive; ids are `prefix` + entry name.
    Fixed { archive: String, prefix: String },
    /// `<dir>/<rest>` lives in `<dir>.zip` under its full id.
    Repo,
}

impl Locator {
    fn locate(&self, id: &str) -> Option<Location> {
        match self {
            Locator::Fixed { archive, prefix } => id.strip_prefix(prefix.as_str()).map(|entry| Location {
                archive: archive.clone(),
                entry: entry.to_string(),
            }),
            Locator::Repo => {
                let (top, rest) = id.trim_start_matches('/').split_once('/')?;
                if top.is_empty() || rest.is_empty() {
                    return None;
                }
                Some(Location {
                    archive: format!("{top}.zip"),
                    entry: id.to_string(),
                })
            }
        }
    }
}

/// Shared machinery for the zip restorers.
#[derive(Debug, Clone)]
struct ZipSource {
    store: Arc<dyn LongTermStorage>,
    locator: Locator,
}

fn zip_error(archive: &str, entry: &str, e: ZipError) -> VolumeError {
    match e {
        ZipError::FileNotFound => VolumeError::not_found(entry, archive),
        ZipError::Io(e) => VolumeError::StorageState(format!("Failure while reading zip file {archive}: {e}")),
        other => VolumeError::StorageState(format!("Failure while reading zip file {archive}: {other}")),
    }
}

impl ZipSource {
    fn locate(&self, id: &str) -> Result<Location> {
        self.locator
            .locate(id)
            .ok_or_else(|| VolumeError::not_found(id, "zip restorer").into())
    }

    async fn read_archive(&self, loc: &Location) -> Result<Vec<u8>> {
        let mut stream = self.store.open_file(&loc.archive).await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await.map_err(|e| {
            VolumeError::StorageState(format!("Failure while reading zip file {}: {e}", loc.archive))
        })?;
        Ok(data)
    }

    /// Run `f` on the archive entry for `id` off the async runtime.
    async fn with_entry<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut zip::read::ZipFile<'_>) -> std::io::Result<T> + Send + 'static,
    {
        let loc = self.locate(id)?;
        let data = self.read_archive(&loc).await?;
        let joined = tokio::task::spawn_blocking(move || -> Result<T, VolumeError> {
            let mut archive = ZipArchive::new(Cursor::new(data))
                .map_err(|e| zip_error(&loc.archive, &loc.entry, e))?;
            let mut file = archive
                .by_name(&loc.entry)
                .map_err(|e| zip_error(&loc.archive, &loc.entry, e))?;
            f(&mut file).map_err(|e| {
                VolumeError::StorageState(format!("Failure while reading zip file {}: {e}", loc.archive))
            })
        })
        .await
        .map_err(|e| CacheError::management(format!("zip reader task failed: {e}")))?;
        Ok(joined?)
    }

    async fn info(&self, id: &str) -> Result<EntryInfo> {
        self.with_entry(id, |f| {
            Ok(EntryInfo {
                size: f.size(),
                crc32: f.crc32(),
            })
        })
        .await
    }

    async fn does_not_exist(&self, id: &str) -> Result<bool> {
        match self.locator.locate(id) {
            Some(loc) => Ok(!self.store.exists(&loc.archive).await?),
            None => Ok(true),
        }
    }

    async fn open(&self, id: &str) -> Result<ByteStream> {
        let bytes = self
            .with_entry(id, |f| {
                let mut buf = Vec::with_capacity(f.size() as usize);
                f.read_to_end(&mut buf)?;
                Ok(buf)
            })
            .await?;
        debug!(id, bytes = bytes.len(), "extracted archive entry");
        Ok(Box::new(Cursor::new(bytes)))
    }
}

/// Restores entries of a single zip archive in long-term storage.
///
/// Ids must start with the configured prefix; the rest is the entry name.
#[derive(Debug, Clone)]
pub struct ZipFileRestorer {
    source: ZipSource,
}

impl ZipFileRestorer {
    pub fn new(store: Arc<dyn LongTermStorage>, archive: impl Into<String>) -> Self {
        Self::with_prefix(store, archive, "")
    }

    pub fn with_prefix(
        store: Arc<dyn LongTermStorage>,
        archive: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            source: ZipSource {
                store,
                locator: Locator::Fixed {
                    archive: archive.into(),
                    prefix: prefix.into(),
                },
            },
        }
    }
}

/// Restores from a directory of zip archives, one per top-level
/// collection: the id `coll/path/file` is the entry of that name in
/// `coll.zip`.
#[derive(Debug, Clone)]
pub struct ZipRepoRestorer {
    root: PathBuf,
    source: ZipSource,
}

impl ZipRepoRestorer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let store = Arc::new(FilesystemLongTermStorage::new(root.clone()));
        Self {
            root,
            source: ZipSource {
                store,
                locator: Locator::Repo,
            },
        }
    }

    pub fn repo_dir(&self) -> &std::path::Path {
        &self.root
    }
}

macro_rules! zip_restorer {
    ($ty:ty) => {
        #[async_trait]
        impl Restorer for $ty {
            async fn does_not_exist(&self, id: &str) -> Result<bool> {
                self.source.does_not_exist(id).await
            }

            async fn size_of(&self, id: &str) -> Result<u64> {
                Ok(self.source.info(id).await?.size)
            }

            /// The entry's CRC-32, as recorded in the archive.
            async fn checksum_of(&self, id: &str) -> Result<Checksum> {
                let info = self.source.info(id).await?;
                Ok(Checksum::crc32(info.crc32))
            }

            async fn open_data_object(&self, id: &str) -> Result<ByteStream> {
                self.source.open(id).await
            }
        }
    };
}

zip_restorer!(ZipFileRestorer);
zip_restorer!(ZipRepoRestorer);
