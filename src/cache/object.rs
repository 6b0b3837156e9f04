//! Cached object records and their metadata.
//!
//! A [`CachedObject`] is one catalog row: an object stored under a local
//! name in one volume, carrying the external (long-term storage) id it was
//! restored from. Well-known metadata keys are lifted into typed fields;
//! anything else rides along in `extra`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{CacheError, Result};

/// Free-form metadata attached to objects and volumes.
pub type Metadata = serde_json::Map<String, Value>;

pub const SIZE: &str = "size";
pub const CHECKSUM: &str = "checksum";
pub const CHECKSUM_ALGORITHM: &str = "checksumAlgorithm";
pub const PRIORITY: &str = "priority";
pub const SINCE: &str = "since";
pub const SINCE_DATE: &str = "sinceDate";
pub const CHECKED: &str = "checked";
pub const CHECKED_DATE: &str = "checkedDate";
pub const MODIFIED: &str = "modified";
pub const VOLUME_CHECKSUM: &str = "volumeChecksum";

/// Eviction priority given to objects that don't specify one.
pub const DEFAULT_PRIORITY: i64 = 10;

/// Keys stored in dedicated catalog columns rather than the extra blob.
pub(crate) const COLUMN_KEYS: [&str; 8] = [
    SIZE,
    CHECKSUM,
    CHECKSUM_ALGORITHM,
    PRIORITY,
    SINCE,
    SINCE_DATE,
    CHECKED,
    CHECKED_DATE,
];

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Render epoch milliseconds as an RFC 3339 UTC instant.
pub fn iso_instant(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_default()
}

/// Read an integer metadatum; a value of the wrong type is an error.
pub fn metadatum_i64(md: &Metadata, key: &str) -> Result<Option<i64>> {
    match md.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| CacheError::metadata(key, format!("not an integer: {n}"))),
        Some(other) => Err(CacheError::metadata(
            key,
            format!("expected a number, found {other}"),
        )),
    }
}

/// Read a string metadatum; a value of the wrong type is an error.
pub fn metadatum_str<'a>(md: &'a Metadata, key: &str) -> Result<Option<&'a str>> {
    match md.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(CacheError::metadata(
            key,
            format!("expected a string, found {other}"),
        )),
    }
}

/// One catalogued object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedObject {
    /// Name of the volume holding the bytes.
    pub volume: String,

    /// Local name within the volume.
    pub name: String,

    /// External (long-term storage) identifier.
    pub id: Option<String>,

    /// Recorded size in bytes, if known.
    pub size: Option<u64>,

    pub checksum: Option<String>,

    pub algorithm: Option<String>,

    /// Eviction priority; higher is more evictable, 0 pins the object.
    pub priority: i64,

    /// Last access (or creation) time, epoch milliseconds.
    pub since: i64,

    /// `since` as an RFC 3339 instant.
    pub since_date: String,

    /// Last successful integrity check, epoch milliseconds (0 = never).
    pub checked: i64,

    /// Metadata without a dedicated column.
    pub extra: Metadata,

    /// Evictability assigned by the most recent scoring pass; never persisted.
    #[serde(skip)]
    pub score: f64,
}

impl CachedObject {
    pub fn new(volume: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            volume: volume.into(),
            name: name.into(),
            id: None,
            size: None,
            checksum: None,
            algorithm: None,
            priority: DEFAULT_PRIORITY,
            since: 0,
            since_date: String::new(),
            checked: 0,
            extra: Metadata::new(),
            score: 0.0,
        }
    }

    /// Build an object from a metadata map, lifting the well-known keys.
    pub fn from_metadata(
        volume: impl Into<String>,
        name: impl Into<String>,
        id: Option<String>,
        md: &Metadata,
    ) -> Result<Self> {
        let mut obj = Self::new(volume, name);
        obj.id = id;
        obj.size = metadatum_i64(md, SIZE)?
            .filter(|s| *s >= 0)
            .map(|s| s as u64);
        obj.checksum = metadatum_str(md, CHECKSUM)?.map(str::to_string);
        obj.algorithm = metadatum_str(md, CHECKSUM_ALGORITHM)?.map(str::to_string);
        obj.priority = metadatum_i64(md, PRIORITY)?.unwrap_or(DEFAULT_PRIORITY);
        if let Some(since) = metadatum_i64(md, SINCE)? {
            obj.since = since;
            obj.since_date = iso_instant(since);
        }
        obj.checked = metadatum_i64(md, CHECKED)?.unwrap_or(0);
        obj.extra = md
            .iter()
            .filter(|(k, _)| !COLUMN_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(obj)
    }

    /// All metadata, well-known fields included.
    pub fn metadata(&self) -> Metadata {
        let mut md = self.extra.clone();
        md.insert(
            SIZE.into(),
            Value::from(self.size.map(|s| s as i64).unwrap_or(-1)),
        );
        if let Some(cs) = &self.checksum {
            md.insert(CHECKSUM.into(), Value::from(cs.clone()));
        }
        if let Some(alg) = &self.algorithm {
            md.insert(CHECKSUM_ALGORITHM.into(), Value::from(alg.clone()));
        }
        md.insert(PRIORITY.into(), Value::from(self.priority));
        md.insert(SINCE.into(), Value::from(self.since));
        md.insert(SINCE_DATE.into(), Value::from(self.since_date.clone()));
        md.insert(CHECKED.into(), Value::from(self.checked));
        if self.checked > 0 {
            md.insert(CHECKED_DATE.into(), Value::from(iso_instant(self.checked)));
        }
        md
    }

    /// Recorded size, treating unknown as zero.
    pub fn size_bytes(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    /// The `modified` metadatum, when one was recorded.
    pub fn modified(&self) -> Option<i64> {
        self.extra.get(MODIFIED).and_then(Value::as_i64)
    }

    /// Last-modified time: an explicit `modified` metadatum, else `since`.
    pub fn last_modified(&self) -> Option<i64> {
        self.modified().or((self.since > 0).then_some(self.since))
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// `volume:name`, for log lines.
    pub fn location(&self) -> String {
        format!("{}:{}", self.volume, self.name)
    }
}
