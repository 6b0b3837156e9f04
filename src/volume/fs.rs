//! Directory-backed cache volume.
//!
//! Object names map to relative paths under the volume root; writes land in
//! a temporary sibling file first and are renamed into place, so a reader
//! never sees a partially written object.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

use super::{ByteStream, CacheVolume, VolumeEntry};
use crate::cache::object::Metadata;
use crate::error::VolumeError;

/// A cache volume stored in a local (or mounted) directory.
#[derive(Debug, Clone)]
pub struct FilesystemVolume {
    name: String,
    root: PathBuf,
}

impl FilesystemVolume {
    /// Open a volume rooted at `root`, creating the directory if needed.
    pub async fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, VolumeError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an object name to its path, refusing names that would
    /// escape the root.
    fn path_for(&self, name: &str) -> Result<PathBuf, VolumeError> {
        let rel = Path::new(name);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !clean {
            return Err(VolumeError::Other(format!(
                "{name}: not a legal object name for volume {}",
                self.name
            )));
        }
        Ok(self.root.join(rel))
    }

    fn missing(&self, name: &str) -> VolumeError {
        VolumeError::not_found(name, self.root.display().to_string())
    }
}

/// Copy `from` into `tmp`, sync it, then rename it over `path`.
async fn write_into_place(
    from: &mut (dyn AsyncRead + Send + Unpin),
    tmp: &Path,
    path: &Path,
) -> std::io::Result<u64> {
    let mut file = fs::File::create(tmp).await?;
    let written = tokio::io::copy(from, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(tmp, path).await?;
    Ok(written)
}

#[async_trait]
impl CacheVolume for FilesystemVolume {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, name: &str) -> Result<bool, VolumeError> {
        let path = self.path_for(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn save_as(
        &self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        name: &str,
        _metadata: Option<&Metadata>,
    ) -> Result<u64, VolumeError> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("partial-{}", uuid::Uuid::new_v4().simple()));

        let written = match write_into_place(from, &tmp, &path).await {
            Ok(n) => n,
            Err(e) => {
                match fs::remove_file(&tmp).await {
                    Ok(()) => {}
                    Err(cleanup) if cleanup.kind() == ErrorKind::NotFound => {}
                    Err(cleanup) => {
                        warn!(path = %tmp.display(), error = %cleanup, "could not remove partial file")
                    }
                }
                return Err(e.into());
            }
        };

        debug!(
            volume = %self.name,
            path = %path.display(),
            bytes = written,
            "wrote object to disk"
        );
        Ok(written)
    }

    async fn get_stream(&self, name: &str) -> Result<ByteStream, VolumeError> {
        let path = self.path_for(name)?;
        match fs::File::open(&path).await {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(self.missing(name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str) -> Result<VolumeEntry, VolumeError> {
        let path = self.path_for(name)?;
        let meta = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(self.missing(name)),
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(self.missing(name)),
            Err(e) => return Err(e.into()),
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64);
        Ok(VolumeEntry {
            name: name.to_string(),
            size: meta.len(),
            modified,
            checksum: None,
        })
    }

    async fn remove(&self, name: &str) -> Result<bool, VolumeError> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(volume = %self.name, path = %path.display(), "deleted object file");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
