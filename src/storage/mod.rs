//! Long-term (archival) storage that restorers copy from.
//!
//! Only the [`LongTermStorage`] contract matters to the engine. Ranking
//! archive bags by version is delegated to a [`BagOrdering`], since the bag
//! naming grammar belongs to the archive, not the cache.

pub mod fs;

use std::cmp::Ordering;
use std::fmt;

use async_trait::async_trait;

use crate::checksum::Checksum;
use crate::error::VolumeError;
use crate::volume::ByteStream;

pub use fs::FilesystemLongTermStorage;

/// Read access to the archive.
#[async_trait]
pub trait LongTermStorage: Send + Sync + fmt::Debug {
    async fn open_file(&self, path: &str) -> Result<ByteStream, VolumeError>;

    async fn exists(&self, path: &str) -> Result<bool, VolumeError>;

    async fn size_of(&self, path: &str) -> Result<u64, VolumeError>;

    async fn checksum_of(&self, path: &str) -> Result<Checksum, VolumeError>;

    /// All bags belonging to `archive_id`, oldest first.
    async fn find_bags_for(&self, archive_id: &str) -> Result<Vec<String>, VolumeError>;

    /// The newest bag for `archive_id`, optionally restricted to `version`.
    async fn find_head_bag_for(
        &self,
        archive_id: &str,
        version: Option<&str>,
    ) -> Result<String, VolumeError>;
}

/// Knows how bag names relate to archive ids and versions.
pub trait BagOrdering: Send + Sync + fmt::Debug {
    fn belongs_to(&self, bag: &str, archive_id: &str) -> bool;

    fn version_of(&self, bag: &str) -> Option<String>;

    fn compare(&self, a: &str, b: &str) -> Ordering;
}

/// Bags are named `<archive_id>[.<version>][...].<ext>`, ordered lexically.
#[derive(Debug, Default, Clone)]
pub struct LexicalBagOrdering;

impl LexicalBagOrdering {
    fn stem(bag: &str) -> &str {
        bag.rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(bag)
    }
}

impl BagOrdering for LexicalBagOrdering {
    fn belongs_to(&self, bag: &str, archive_id: &str) -> bool {
        match bag.strip_prefix(archive_id) {
            Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with('_'),
            None => false,
        }
    }

    fn version_of(&self, bag: &str) -> Option<String> {
        let stem = Self::stem(bag);
        stem.split_once('.')
            .map(|(_, v)| v.to_string())
            .filter(|v| !v.is_empty())
    }

    fn compare(&self, a: &str, b: &str) -> Ordering {
        Self::stem(a).cmp(Self::stem(b))
    }
}

/// Pick the newest of `bags` for `archive_id` (and `version`, if given).
pub fn head_bag<'a>(
    ordering: &dyn BagOrdering,
    bags: &'a [String],
    archive_id: &str,
    version: Option<&str>,
) -> Option<&'a String> {
    bags.iter()
        .filter(|b| ordering.belongs_to(b, archive_id))
        .filter(|b| match version {
            Some(v) => ordering.version_of(b).as_deref() == Some(v),
            None => true,
        })
        .max_by(|a, b| ordering.compare(a, b))
}
