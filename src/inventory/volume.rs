//! Volume records: status, roles and capacity bookkeeping.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cache::object::Metadata;

/// General-purpose storage.
pub const ROLE_GENERAL_PURPOSE: u32 = 1;
/// Low-latency volumes.
pub const ROLE_FAST_ACCESS: u32 = 2;
pub const ROLE_SMALL_OBJECTS: u32 = 4;
pub const ROLE_LARGE_OBJECTS: u32 = 8;
/// Older versions of archived data.
pub const ROLE_OLD_VERSIONS: u32 = 16;

/// How a volume may currently be used.
///
/// The variants are ordered from most to least restrictive, so a volume
/// qualifies for a purpose when its status is `>=` the status the purpose
/// requires.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    /// Not to be used at all.
    Disabled,
    /// Catalog entries may be reported but bytes are not served.
    InfoOnly,
    /// Objects may be read but nothing new is written or evicted.
    ForGet,
    /// Fully usable: read, write and evict.
    #[default]
    ForUpdate,
}

impl VolumeStatus {
    pub fn code(self) -> i64 {
        match self {
            VolumeStatus::Disabled => 0,
            VolumeStatus::InfoOnly => 1,
            VolumeStatus::ForGet => 2,
            VolumeStatus::ForUpdate => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(VolumeStatus::Disabled),
            1 => Some(VolumeStatus::InfoOnly),
            2 => Some(VolumeStatus::ForGet),
            3 => Some(VolumeStatus::ForUpdate),
            _ => None,
        }
    }

    pub fn allows_update(self) -> bool {
        self == VolumeStatus::ForUpdate
    }

    pub fn allows_get(self) -> bool {
        self >= VolumeStatus::ForGet
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolumeStatus::Disabled => "disabled",
            VolumeStatus::InfoOnly => "info_only",
            VolumeStatus::ForGet => "for_get",
            VolumeStatus::ForUpdate => "for_update",
        };
        f.pad(s)
    }
}

impl FromStr for VolumeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "disabled" | "0" => Ok(VolumeStatus::Disabled),
            "info_only" | "info" | "1" => Ok(VolumeStatus::InfoOnly),
            "for_get" | "get" | "read" | "2" => Ok(VolumeStatus::ForGet),
            "for_update" | "update" | "3" => Ok(VolumeStatus::ForUpdate),
            other => Err(format!("unknown volume status: {other}")),
        }
    }
}

/// Everything the catalog knows about one volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub capacity: u64,
    pub status: VolumeStatus,
    pub roles: u32,
    pub priority: i64,
    /// Properties stored at registration time.
    pub metadata: Metadata,
}

impl VolumeInfo {
    pub fn has_role(&self, mask: u32) -> bool {
        mask == 0 || self.roles & mask != 0
    }
}

/// What a selection of objects is for; each purpose filters differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Everything, regardless of status.
    Listing,
    /// Candidates for eviction: unpinned objects in updatable volumes.
    Deletion,
    /// Objects due for an integrity check, least recently checked first.
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ordering() {
        assert!(VolumeStatus::Disabled < VolumeStatus::InfoOnly);
        assert!(VolumeStatus::InfoOnly < VolumeStatus::ForGet);
        assert!(VolumeStatus::ForGet < VolumeStatus::ForUpdate);
        assert!(VolumeStatus::ForUpdate.allows_get());
        assert!(!VolumeStatus::ForGet.allows_update());
    }

    #[test]
    fn test_status_codes_round_trip() {
        for s in [
            VolumeStatus::Disabled,
            VolumeStatus::InfoOnly,
            VolumeStatus::ForGet,
            VolumeStatus::ForUpdate,
        ] {
            assert_eq!(VolumeStatus::from_code(s.code()), Some(s));
            assert_eq!(s.to_string().parse::<VolumeStatus>(), Ok(s));
        }
        assert_eq!(VolumeStatus::from_code(7), None);
        assert!("sideways".parse::<VolumeStatus>().is_err());
    }

    #[test]
    fn test_role_mask() {
        let info = VolumeInfo {
            name: "v".into(),
            capacity: 10,
            status: VolumeStatus::ForUpdate,
            roles: ROLE_GENERAL_PURPOSE | ROLE_SMALL_OBJECTS,
            priority: 0,
            metadata: Metadata::new(),
        };
        assert!(info.has_role(0));
        assert!(info.has_role(ROLE_SMALL_OBJECTS));
        assert!(!info.has_role(ROLE_LARGE_OBJECTS));
    }
}
