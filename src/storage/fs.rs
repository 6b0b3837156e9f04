use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{head_bag, BagOrdering, LexicalBagOrdering, LongTermStorage};
use crate::checksum::Checksum;
use crate::error::VolumeError;
use crate::volume::ByteStream;

/// Suffix of the sidecar file holding a precomputed SHA-256.
pub const SHA256_SUFFIX: &str = ".sha256";

/// Archive bags stored as files in one directory tree.
#[derive(Debug, Clone)]
pub struct FilesystemLongTermStorage {
    root: PathBuf,
    ordering: Arc<dyn BagOrdering>,
}

impl FilesystemLongTermStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_ordering(root, Arc::new(LexicalBagOrdering))
    }

    pub fn with_ordering(root: impl Into<PathBuf>, ordering: Arc<dyn BagOrdering>) -> Self {
        Self {
            root: root.into(),
            ordering,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, VolumeError> {
        let rel = Path::new(path);
        if path.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(VolumeError::Other(format!("{path}: not a legal storage path")));
        }
        Ok(self.root.join(rel))
    }

    fn missing(&self, path: &str) -> VolumeError {
        VolumeError::not_found(path, self.root.display().to_string())
    }

    fn map_io(&self, path: &str, e: std::io::Error) -> VolumeError {
        match e.kind() {
            ErrorKind::NotFound => self.missing(path),
            ErrorKind::PermissionDenied | ErrorKind::TimedOut | ErrorKind::Interrupted => {
                VolumeError::StorageState(format!("{path}: {e}"))
            }
            _ => VolumeError::Io(e),
        }
    }
}

#[async_trait]
impl LongTermStorage for FilesystemLongTermStorage {
    async fn open_file(&self, path: &str) -> Result<ByteStream, VolumeError> {
        let full = self.resolve(path)?;
        let file = fs::File::open(&full)
            .await
            .map_err(|e| self.map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn exists(&self, path: &str) -> Result<bool, VolumeError> {
        let full = self.resolve(path)?;
        Ok(fs::try_exists(&full).await?)
    }

    async fn size_of(&self, path: &str) -> Result<u64, VolumeError> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| self.map_io(path, e))?;
        if !meta.is_file() {
            return Err(self.missing(path));
        }
        Ok(meta.len())
    }

    async fn checksum_of(&self, path: &str) -> Result<Checksum, VolumeError> {
        let full = self.resolve(path)?;
        let sidecar = PathBuf::from(format!("{}{SHA256_SUFFIX}", full.display()));
        match fs::read_to_string(&sidecar).await {
            Ok(text) => {
                if let Some(hash) = text.split_whitespace().next() {
                    return Ok(Checksum::sha256(hash));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(self.map_io(path, e)),
        }
        debug!(path, "no checksum sidecar; computing digest");
        let mut file = fs::File::open(&full)
            .await
            .map_err(|e| self.map_io(path, e))?;
        let (cs, _) = Checksum::calc_sha256(&mut file).await?;
        Ok(cs)
    }

    async fn find_bags_for(&self, archive_id: &str) -> Result<Vec<String>, VolumeError> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| self.map_io(archive_id, e))?;
        let mut bags = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(SHA256_SUFFIX) {
                continue;
            }
            if self.ordering.belongs_to(&name, archive_id) {
                bags.push(name);
            }
        }
        if bags.is_empty() {
            return Err(VolumeError::not_found(archive_id, self.root.display().to_string()));
        }
        bags.sort_by(|a, b| self.ordering.compare(a, b));
        Ok(bags)
    }

    async fn find_head_bag_for(
        &self,
        archive_id: &str,
        version: Option<&str>,
    ) -> Result<String, VolumeError> {
        let bags = self.find_bags_for(archive_id).await?;
        head_bag(self.ordering.as_ref(), &bags, archive_id, version)
            .cloned()
            .ok_or_else(|| {
                VolumeError::not_found(
                    format!("{archive_id} (version {})", version.unwrap_or("latest")),
                    self.root.display().to_string(),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_size_and_checksum() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let lts = FilesystemLongTermStorage::new(dir.path());

        assert!(lts.exists("a.txt").await.unwrap());
        assert_eq!(lts.size_of("a.txt").await.unwrap(), 5);
        assert_eq!(
            lts.checksum_of("a.txt").await.unwrap(),
            Checksum::sha256_of(b"hello")
        );

        std::fs::write(dir.path().join("a.txt.sha256"), "cafe a.txt\n").unwrap();
        assert_eq!(lts.checksum_of("a.txt").await.unwrap().hash, "cafe");

        assert!(matches!(
            lts.size_of("b.txt").await,
            Err(VolumeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_bags() {
        let dir = TempDir::new().unwrap();
        for name in ["pdr1.1.zip", "pdr1.2.zip", "pdr1.2.zip.sha256", "pdr10.1.zip"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let lts = FilesystemLongTermStorage::new(dir.path());
        assert_eq!(
            lts.find_bags_for("pdr1").await.unwrap(),
            vec!["pdr1.1.zip", "pdr1.2.zip"]
        );
        assert_eq!(lts.find_head_bag_for("pdr1", None).await.unwrap(), "pdr1.2.zip");
        assert_eq!(
            lts.find_head_bag_for("pdr1", Some("1")).await.unwrap(),
            "pdr1.1.zip"
        );
        assert!(lts.find_bags_for("pdr2").await.is_err());
    }
}
