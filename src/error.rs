//! Error kinds for the cache engine.
//!
//! Volume and long-term-storage adapters report [`VolumeError`]; everything
//! the engine itself raises is a [`CacheError`]. An embedding service maps
//! errors to its own response classes with [`CacheError::class`].

use thiserror::Error;

/// Failures reported by a cache volume or a long-term storage backend.
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("{name}: object not found in {location}")]
    NotFound { name: String, location: String },

    #[error("storage in unexpected state: {0}")]
    StorageState(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("volume error: {0}")]
    Other(String),
}

impl VolumeError {
    pub fn not_found(name: impl Into<String>, location: impl Into<String>) -> Self {
        VolumeError::NotFound {
            name: name.into(),
            location: location.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VolumeError::StorageState(_))
    }
}

/// Errors raised by the inventory, planner, reservations, restorers and
/// integrity monitor.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("inventory access failed: {0}")]
    Inventory(#[from] rusqlite::Error),

    #[error("inventory error: {0}")]
    InventoryState(String),

    #[error("{name}: metadatum has unexpected type: {message}")]
    InventoryMetadata { name: String, message: String },

    #[error("{0}: not a registered volume")]
    VolumeNotFound(String),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("{0}")]
    CacheManagement(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("deletion failure: {0}")]
    DeletionFailure(String),

    #[error("no attached volumes match role preferences {0:#x}")]
    NoMatchingVolumes(u32),

    #[error("{id}: restoration failed: {message}")]
    Restoration { id: String, message: String },

    #[error("{0}: restoration target not found in long-term storage")]
    RestorationTargetNotFound(String),

    #[error("{volume}:{name}: integrity check failed: {message}")]
    Integrity {
        volume: String,
        name: String,
        message: String,
    },
}

/// Response class an embedding service should use for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ServerError,
    NotFound,
    Internal,
}

impl CacheError {
    pub fn inventory(msg: impl Into<String>) -> Self {
        CacheError::InventoryState(msg.into())
    }

    pub fn management(msg: impl Into<String>) -> Self {
        CacheError::CacheManagement(msg.into())
    }

    pub fn restoration(id: impl Into<String>, msg: impl Into<String>) -> Self {
        CacheError::Restoration {
            id: id.into(),
            message: msg.into(),
        }
    }

    pub fn integrity(
        volume: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        CacheError::Integrity {
            volume: volume.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn metadata(name: impl Into<String>, msg: impl Into<String>) -> Self {
        CacheError::InventoryMetadata {
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CacheError::DeletionFailure(_)
            | CacheError::Restoration { .. }
            | CacheError::NoMatchingVolumes(_) => ErrorClass::ServerError,
            CacheError::RestorationTargetNotFound(_)
            | CacheError::Volume(VolumeError::NotFound { .. }) => ErrorClass::NotFound,
            _ => ErrorClass::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CacheError::Volume(e) if e.is_transient())
    }

    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, CacheError::Integrity { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CacheError::Volume(VolumeError::NotFound { .. }) | CacheError::RestorationTargetNotFound(_)
        )
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
