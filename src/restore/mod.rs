//! Restore-on-miss: copying objects from long-term storage into the cache.
//!
//! A [`Restorer`] maps an archive identifier to bytes in long-term storage.
//! [`Restorer::restore_object`] is a template: it fills in the size and
//! checksum the reservation needs, lets the implementation enrich the
//! metadata, then streams the bytes through the reservation.
//!
//! - [`FileCopyRestorer`]: ids are plain paths in the store
//! - [`ZipFileRestorer`]: ids are entries of one fixed zip archive
//! - [`ZipRepoRestorer`]: ids are entries of per-collection zip archives

pub mod copy;
pub mod zip;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::object::{CachedObject, Metadata, CHECKSUM, CHECKSUM_ALGORITHM, SIZE};
use crate::cache::reservation::{generate_name, Reservation};
use crate::checksum::Checksum;
use crate::error::{CacheError, Result, VolumeError};
use crate::volume::ByteStream;

pub use copy::FileCopyRestorer;
pub use zip::{ZipFileRestorer, ZipRepoRestorer};

/// Copies objects out of long-term storage.
#[async_trait]
pub trait Restorer: Send + Sync + fmt::Debug {
    /// `true` only if `id` certainly cannot be restored. `false` does not
    /// promise that it can.
    async fn does_not_exist(&self, id: &str) -> Result<bool>;

    async fn size_of(&self, id: &str) -> Result<u64>;

    /// The stored checksum of `id`.
    async fn checksum_of(&self, id: &str) -> Result<Checksum>;

    async fn open_data_object(&self, id: &str) -> Result<ByteStream>;

    /// Local name under which `id` is cached.
    fn name_for_object(&self, id: &str) -> String {
        default_object_name(id)
    }

    /// Add provenance to the metadata stored with a restored object.
    async fn enrich_metadata(&self, _id: &str, _metadata: &mut Metadata) -> Result<()> {
        Ok(())
    }

    /// Copy `id` into the reservation's volume as `name`.
    ///
    /// Volume and integrity errors pass through unchanged; other failures
    /// are reported as restoration errors.
    async fn restore_object(
        &self,
        id: &str,
        reservation: &mut Reservation,
        name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<CachedObject> {
        let mut md = metadata.cloned().unwrap_or_default();
        if !md.contains_key(SIZE) {
            let size = self.size_of(id).await.map_err(|e| match e {
                CacheError::Volume(_) => e,
                other => CacheError::restoration(id, format!("Failed to retrieve size: {other}")),
            })?;
            md.insert(SIZE.into(), Value::from(size));
        }
        if !md.contains_key(CHECKSUM) {
            match self.checksum_of(id).await {
                Ok(cs) => {
                    md.insert(CHECKSUM.into(), Value::from(cs.hash));
                    md.insert(CHECKSUM_ALGORITHM.into(), Value::from(cs.algorithm));
                }
                Err(CacheError::Volume(VolumeError::StorageState(_) | VolumeError::Unsupported(_))) => {
                    debug!(id, "no checksum available");
                }
                Err(e @ CacheError::Volume(_)) => return Err(e),
                Err(e) => {
                    return Err(CacheError::restoration(
                        id,
                        format!("Failed to retrieve checksum: {e}"),
                    ))
                }
            }
        }
        self.enrich_metadata(id, &mut md).await?;

        let mut stream = self.open_data_object(id).await?;
        let obj = reservation
            .save_as(&mut *stream, id, name, Some(&md))
            .await
            .map_err(|e| match e {
                CacheError::Volume(_) | CacheError::Integrity { .. } => e,
                other => CacheError::restoration(
                    id,
                    format!("Unexpected error while copying to cache: {other}"),
                ),
            })?;
        info!(id, volume = %obj.volume, name, size = obj.size_bytes(), "restored object");
        Ok(obj)
    }
}

/// The path part of `id` when it is a URI, else `id` itself, without a
/// leading slash. A URI without a path gets a random name.
pub fn default_object_name(id: &str) -> String {
    let path = match id.split_once(':') {
        Some((scheme, rest))
            if !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            match rest.strip_prefix("//") {
                Some(authority_and_path) => authority_and_path
                    .find('/')
                    .map(|i| &authority_and_path[i..])
                    .unwrap_or(""),
                None => rest,
            }
        }
        _ => id,
    };
    let path = path.split(['?', '#']).next().unwrap_or("");
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        generate_name("", id.len().max(32))
    } else {
        trimmed.to_string()
    }
}
