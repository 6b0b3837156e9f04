//! Persistent inventory of cache volumes and the objects they hold.
//!
//! The [`Catalog`] is the single source of truth for space accounting:
//! a volume's used space is always the sum of the recorded sizes of the
//! objects catalogued in it. It is backed by SQLite:
//!
//! - `volumes`: name, capacity, status, role bitmask, priority, properties
//! - `algorithms`: registered checksum algorithm names
//! - `objects`: one row per (volume, name), in insertion order
//! - `reservations`: outstanding space claims, keyed by (volume, name)
//!
//! Every call takes the connection lock for its duration, so readers never
//! observe a half-applied update.

mod schema;
pub mod volume;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::object::{
    iso_instant, metadatum_i64, now_millis, CachedObject, Metadata, SINCE,
};
use crate::cache::strategy::SelectionStrategy;
use crate::checksum::SHA256;
use crate::error::{CacheError, Result};

pub use volume::{
    Purpose, VolumeInfo, VolumeStatus, ROLE_FAST_ACCESS, ROLE_GENERAL_PURPOSE,
    ROLE_LARGE_OBJECTS, ROLE_OLD_VERSIONS, ROLE_SMALL_OBJECTS,
};

/// Objects checked more recently than this are skipped by [`Purpose::Check`].
pub const DEFAULT_CHECK_GRACE: Duration = Duration::from_secs(3600);

const OBJECT_COLUMNS: &str = "o.objid, o.name, v.name, o.size, o.checksum, a.name, \
                              o.priority, o.since, o.checked, o.metadata";
const OBJECT_JOIN: &str = "FROM objects o JOIN volumes v ON o.volume = v.id \
                           LEFT JOIN algorithms a ON o.algorithm = a.id";

/// Shared handle to the catalog.
pub type SharedCatalog = Arc<Catalog>;

/// SQLite-backed inventory of volumes, algorithms, objects and reservations.
pub struct Catalog {
    conn: Mutex<Connection>,
    eviction_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    check_grace_ms: i64,
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("check_grace_ms", &self.check_grace_ms)
            .finish_non_exhaustive()
    }
}

fn parse_json(idx: usize, text: Option<String>) -> rusqlite::Result<Metadata> {
    match text {
        None => Ok(Metadata::new()),
        Some(t) if t.is_empty() => Ok(Metadata::new()),
        Some(t) => serde_json::from_str(&t)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

fn to_json(md: &Metadata) -> Result<String> {
    serde_json::to_string(md).map_err(|e| CacheError::inventory(format!("metadata encoding: {e}")))
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<CachedObject> {
    let mut obj = CachedObject::new(row.get::<_, String>(2)?, row.get::<_, String>(1)?);
    obj.id = row.get(0)?;
    let size: i64 = row.get(3)?;
    obj.size = (size >= 0).then_some(size as u64);
    obj.checksum = row.get(4)?;
    obj.algorithm = row.get(5)?;
    obj.priority = row.get(6)?;
    obj.since = row.get(7)?;
    obj.since_date = iso_instant(obj.since);
    obj.checked = row.get(8)?;
    obj.extra = parse_json(9, row.get(9)?)?;
    Ok(obj)
}

fn status_from(md: &Metadata) -> Result<Option<VolumeStatus>> {
    match md.get("status") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(VolumeStatus::from_code)
            .map(Some)
            .ok_or_else(|| CacheError::metadata("status", format!("unknown status code {n}"))),
        Some(Value::String(s)) => s
            .parse()
            .map(Some)
            .map_err(|e: String| CacheError::metadata("status", e)),
        Some(other) => Err(CacheError::metadata(
            "status",
            format!("unexpected value {other}"),
        )),
    }
}

impl Catalog {
    /// Open (creating if needed) a catalog stored at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let on_disk = path != Path::new(":memory:");
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        schema::init(&conn, on_disk)?;
        info!(path = %path.display(), "opened inventory catalog");
        Ok(Self::from_connection(conn))
    }

    /// A throwaway catalog, mainly for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn, false)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            eviction_locks: Mutex::new(HashMap::new()),
            check_grace_ms: DEFAULT_CHECK_GRACE.as_millis() as i64,
        }
    }

    /// Set how long a checked object is exempt from re-checking.
    pub fn with_check_grace(mut self, grace: Duration) -> Self {
        self.check_grace_ms = grace.as_millis() as i64;
        self
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CacheError::inventory("catalog connection lock poisoned"))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }

    /// The lock that serializes evictions and deletions in one volume.
    pub fn eviction_lock(&self, volume: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .eviction_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(volume.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn volume_id(conn: &Connection, name: &str) -> Result<i64> {
        conn.query_row("SELECT id FROM volumes WHERE name = ?1", [name], |r| {
            r.get(0)
        })
        .optional()?
        .ok_or_else(|| CacheError::VolumeNotFound(name.to_string()))
    }

    fn algorithm_id(conn: &Connection, name: &str) -> Result<Option<i64>> {
        Ok(conn
            .query_row("SELECT id FROM algorithms WHERE name = ?1", [name], |r| {
                r.get(0)
            })
            .optional()?)
    }

    // ---- volumes -------------------------------------------------------

    /// Register a volume, or update the capacity and properties of an
    /// existing one.
    ///
    /// `metadata` may carry `status`, `roles` and `priority`. A status is
    /// only applied when the volume is new; changing the status of a known
    /// volume takes an explicit [`Catalog::set_volume_status`].
    pub fn register_volume(
        &self,
        name: &str,
        capacity: u64,
        metadata: Option<&Metadata>,
    ) -> Result<()> {
        let empty = Metadata::new();
        let md = metadata.unwrap_or(&empty);
        let status = status_from(md)?.unwrap_or_default();
        let roles = metadatum_i64(md, "roles")?;
        let priority = metadatum_i64(md, "priority")?;
        let props = to_json(md)?;

        let conn = self.conn()?;
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM volumes WHERE name = ?1", [name], |r| {
                r.get(0)
            })
            .optional()?;
        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE volumes SET capacity = ?1, metadata = ?2, \
                     roles = COALESCE(?3, roles), priority = COALESCE(?4, priority) \
                     WHERE id = ?5",
                    params![capacity as i64, props, roles, priority, id],
                )?;
                debug!(volume = %name, capacity, "updated volume registration");
            }
            None => {
                conn.execute(
                    "INSERT INTO volumes (name, capacity, status, roles, priority, metadata) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        name,
                        capacity as i64,
                        status.code(),
                        roles.unwrap_or(0),
                        priority.unwrap_or(0),
                        props
                    ],
                )?;
                info!(volume = %name, capacity, %status, "registered volume");
            }
        }
        Ok(())
    }

    /// Registered volume names, in registration order.
    pub fn volumes(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM volumes ORDER BY id")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    pub fn volume_info(&self, name: &str) -> Result<VolumeInfo> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT name, capacity, status, roles, priority, metadata FROM volumes WHERE name = ?1",
            [name],
            Self::volume_from_row,
        )
        .optional()?
        .ok_or_else(|| CacheError::VolumeNotFound(name.to_string()))
    }

    /// Every registered volume, in registration order.
    pub fn volume_infos(&self) -> Result<Vec<VolumeInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, capacity, status, roles, priority, metadata FROM volumes ORDER BY id",
        )?;
        let infos = stmt
            .query_map([], Self::volume_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(infos)
    }

    fn volume_from_row(r: &Row<'_>) -> rusqlite::Result<VolumeInfo> {
        let code: i64 = r.get(2)?;
        Ok(VolumeInfo {
            name: r.get(0)?,
            capacity: r.get::<_, i64>(1)?.max(0) as u64,
            status: VolumeStatus::from_code(code).unwrap_or(VolumeStatus::Disabled),
            roles: r.get::<_, i64>(3)? as u32,
            priority: r.get(4)?,
            metadata: parse_json(5, r.get(5)?)?,
        })
    }

    pub fn volume_status(&self, name: &str) -> Result<VolumeStatus> {
        let conn = self.conn()?;
        let code: i64 = conn
            .query_row("SELECT status FROM volumes WHERE name = ?1", [name], |r| {
                r.get(0)
            })
            .optional()?
            .ok_or_else(|| CacheError::VolumeNotFound(name.to_string()))?;
        VolumeStatus::from_code(code)
            .ok_or_else(|| CacheError::inventory(format!("{name}: bad status code {code}")))
    }

    pub fn set_volume_status(&self, name: &str, status: VolumeStatus) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE volumes SET status = ?1 WHERE name = ?2",
            params![status.code(), name],
        )?;
        if n == 0 {
            return Err(CacheError::VolumeNotFound(name.to_string()));
        }
        info!(volume = %name, %status, "volume status changed");
        Ok(())
    }

    pub fn set_volume_roles(&self, name: &str, roles: u32) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE volumes SET roles = ?1 WHERE name = ?2",
            params![roles as i64, name],
        )?;
        if n == 0 {
            return Err(CacheError::VolumeNotFound(name.to_string()));
        }
        debug!(volume = %name, roles, "volume roles changed");
        Ok(())
    }

    pub fn set_volume_priority(&self, name: &str, priority: i64) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE volumes SET priority = ?1 WHERE name = ?2",
            params![priority, name],
        )?;
        if n == 0 {
            return Err(CacheError::VolumeNotFound(name.to_string()));
        }
        Ok(())
    }

    // ---- algorithms ----------------------------------------------------

    /// Register a checksum algorithm, returning its id.
    pub fn register_algorithm(&self, name: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO algorithms (name) VALUES (?1)",
            [name],
        )?;
        let id = conn.query_row("SELECT id FROM algorithms WHERE name = ?1", [name], |r| {
            r.get(0)
        })?;
        Ok(id)
    }

    pub fn algorithms(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM algorithms ORDER BY id")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    // ---- objects -------------------------------------------------------

    /// Catalog an object, replacing any existing row for (volume, name).
    ///
    /// `since` defaults to now. An unregistered volume or checksum
    /// algorithm is an error.
    pub fn add_object(
        &self,
        id: &str,
        volume: &str,
        name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<CachedObject> {
        let empty = Metadata::new();
        let md = metadata.unwrap_or(&empty);
        let mut obj = CachedObject::from_metadata(volume, name, Some(id.to_string()), md)?;
        if metadatum_i64(md, SINCE)?.is_none() {
            obj.since = now_millis();
            obj.since_date = iso_instant(obj.since);
        }
        if obj.checksum.is_some() && obj.algorithm.is_none() {
            obj.algorithm = Some(SHA256.to_string());
        }

        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)
            .map_err(|_| CacheError::inventory(format!("{volume}: volume not registered")))?;
        let alg_id = Self::resolve_algorithm(&conn, obj.algorithm.as_deref())?;
        conn.execute(
            "INSERT INTO objects \
             (objid, name, volume, size, checksum, algorithm, priority, since, since_date, checked, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
             ON CONFLICT(volume, name) DO UPDATE SET \
             objid = excluded.objid, size = excluded.size, checksum = excluded.checksum, \
             algorithm = excluded.algorithm, priority = excluded.priority, since = excluded.since, \
             since_date = excluded.since_date, checked = excluded.checked, metadata = excluded.metadata",
            params![
                id,
                name,
                vol_id,
                obj.size.map(|s| s as i64).unwrap_or(-1),
                obj.checksum,
                alg_id,
                obj.priority,
                obj.since,
                obj.since_date,
                obj.checked,
                to_json(&obj.extra)?,
            ],
        )?;
        debug!(id, volume, name, size = ?obj.size, "catalogued object");
        Ok(obj)
    }

    fn resolve_algorithm(conn: &Connection, name: Option<&str>) -> Result<Option<i64>> {
        match name {
            None => Ok(None),
            Some(alg) => Self::algorithm_id(conn, alg)?
                .map(Some)
                .ok_or_else(|| CacheError::inventory(format!("{alg}: checksum algorithm not registered"))),
        }
    }

    /// Merge `partial` into the metadata of one object.
    ///
    /// Returns `false` if no such object is catalogued. Rows for the same
    /// id in other volumes are left alone.
    pub fn update_metadata(&self, volume: &str, name: &str, partial: &Metadata) -> Result<bool> {
        let conn = self.conn()?;
        let Some(current) = Self::query_object_in(&conn, volume, name)? else {
            return Ok(false);
        };
        let mut merged = current.metadata();
        for (k, v) in partial {
            merged.insert(k.clone(), v.clone());
        }
        let obj = CachedObject::from_metadata(volume, name, current.id.clone(), &merged)?;
        let alg_id = Self::resolve_algorithm(&conn, obj.algorithm.as_deref())?;
        let vol_id = Self::volume_id(&conn, volume)?;
        conn.execute(
            "UPDATE objects SET size = ?1, checksum = ?2, algorithm = ?3, priority = ?4, \
             since = ?5, since_date = ?6, checked = ?7, metadata = ?8 \
             WHERE volume = ?9 AND name = ?10",
            params![
                obj.size.map(|s| s as i64).unwrap_or(-1),
                obj.checksum,
                alg_id,
                obj.priority,
                obj.since,
                obj.since_date,
                obj.checked,
                to_json(&obj.extra)?,
                vol_id,
                name,
            ],
        )?;
        debug!(volume, name, keys = partial.len(), "updated object metadata");
        Ok(true)
    }

    /// Record an access: bump `since` to now.
    pub fn update_access_time(&self, volume: &str, name: &str) -> Result<bool> {
        let now = now_millis();
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        let n = conn.execute(
            "UPDATE objects SET since = ?1, since_date = ?2 WHERE volume = ?3 AND name = ?4",
            params![now, iso_instant(now), vol_id, name],
        )?;
        Ok(n > 0)
    }

    /// Record a successful integrity check at `when` (epoch ms).
    pub fn update_checked_time(&self, volume: &str, name: &str, when: i64) -> Result<bool> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        let n = conn.execute(
            "UPDATE objects SET checked = ?1 WHERE volume = ?2 AND name = ?3",
            params![when, vol_id, name],
        )?;
        Ok(n > 0)
    }

    /// Copies of `id` in volumes that may currently serve reads.
    pub fn find_object(&self, id: &str) -> Result<Vec<CachedObject>> {
        self.find_object_for(id, VolumeStatus::ForGet)
    }

    /// Copies of `id` in volumes whose status is at least `min_status`.
    pub fn find_object_for(&self, id: &str, min_status: VolumeStatus) -> Result<Vec<CachedObject>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} {OBJECT_JOIN} WHERE o.objid = ?1 AND v.status >= ?2 ORDER BY o.id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let found = stmt
            .query_map(params![id, min_status.code()], object_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(found)
    }

    /// The object stored as `name` in `volume`, if any.
    pub fn find_object_in(&self, volume: &str, name: &str) -> Result<Option<CachedObject>> {
        let conn = self.conn()?;
        Self::query_object_in(&conn, volume, name)
    }

    fn query_object_in(conn: &Connection, volume: &str, name: &str) -> Result<Option<CachedObject>> {
        let sql = format!("SELECT {OBJECT_COLUMNS} {OBJECT_JOIN} WHERE v.name = ?1 AND o.name = ?2");
        Ok(conn
            .query_row(&sql, params![volume, name], object_from_row)
            .optional()?)
    }

    /// Objects in one volume, filtered for `purpose`.
    pub fn select_objects_in(
        &self,
        volume: &str,
        purpose: Purpose,
        limit: Option<usize>,
    ) -> Result<Vec<CachedObject>> {
        self.select(Some(volume), purpose, limit)
    }

    /// Objects across all volumes, filtered for `purpose`.
    pub fn select_objects(&self, purpose: Purpose, limit: Option<usize>) -> Result<Vec<CachedObject>> {
        self.select(None, purpose, limit)
    }

    fn select(
        &self,
        volume: Option<&str>,
        purpose: Purpose,
        limit: Option<usize>,
    ) -> Result<Vec<CachedObject>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let (filter, order) = match purpose {
            Purpose::Listing => ("1 = 1".to_string(), "o.id"),
            Purpose::Deletion => (
                format!("o.priority > 0 AND v.status >= {}", VolumeStatus::ForUpdate.code()),
                "o.id",
            ),
            Purpose::Check => (
                format!("o.checked < {}", now_millis() - self.check_grace_ms),
                "o.checked, o.id",
            ),
        };
        let sql = format!(
            "SELECT {OBJECT_COLUMNS} {OBJECT_JOIN} WHERE (?1 IS NULL OR v.name = ?1) AND {filter} \
             ORDER BY {order} LIMIT ?2"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let objs = stmt
            .query_map(params![volume, limit], object_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(objs)
    }

    /// Eviction candidates in `volume`, scored by `strategy` and sorted
    /// most evictable first.
    ///
    /// Scanning stops once the strategy reports that its limit is reached.
    pub fn select_objects_for(
        &self,
        volume: &str,
        strategy: &mut dyn SelectionStrategy,
    ) -> Result<Vec<CachedObject>> {
        let candidates = self.select_objects_in(volume, Purpose::Deletion, None)?;
        strategy.reset();
        let mut scored = Vec::with_capacity(candidates.len());
        for mut obj in candidates {
            strategy.score(&mut obj);
            scored.push(obj);
            if strategy.limit_reached() {
                break;
            }
        }
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(scored)
    }

    /// Forget one object; `false` if it wasn't catalogued.
    pub fn remove_object(&self, volume: &str, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM objects WHERE name = ?2 AND volume = (SELECT id FROM volumes WHERE name = ?1)",
            params![volume, name],
        )?;
        if n > 0 {
            debug!(volume, name, "removed object from catalog");
        }
        Ok(n > 0)
    }

    /// Forget every object in `volume` (or everywhere when `None`).
    pub fn remove_all_objects(&self, volume: Option<&str>) -> Result<usize> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM objects WHERE ?1 IS NULL OR volume = (SELECT id FROM volumes WHERE name = ?1)",
            params![volume],
        )?;
        info!(volume = ?volume, removed = n, "cleared catalog objects");
        Ok(n)
    }

    // ---- space accounting ----------------------------------------------

    /// Capacity of every volume.
    pub fn capacities(&self) -> Result<HashMap<String, u64>> {
        Ok(self
            .volume_infos()?
            .into_iter()
            .map(|v| (v.name, v.capacity))
            .collect())
    }

    /// Bytes used by catalogued objects, per volume.
    pub fn used_space(&self) -> Result<HashMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT v.name, COALESCE(SUM(CASE WHEN o.size > 0 THEN o.size ELSE 0 END), 0) \
             FROM volumes v LEFT JOIN objects o ON o.volume = v.id GROUP BY v.id",
        )?;
        let used = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64)))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;
        Ok(used)
    }

    /// Capacity less used and reserved space, per volume.
    pub fn available_space(&self) -> Result<HashMap<String, i64>> {
        let names = self.volumes()?;
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let avail = self.available_space_in(&name)?;
            out.insert(name, avail);
        }
        Ok(out)
    }

    pub fn used_space_in(&self, volume: &str) -> Result<u64> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM objects WHERE volume = ?1 AND size > 0",
            [vol_id],
            |r| r.get(0),
        )?;
        Ok(used as u64)
    }

    /// Free bytes in `volume`: capacity less used space and outstanding
    /// reservations. Negative when oversubscribed.
    pub fn available_space_in(&self, volume: &str) -> Result<i64> {
        let conn = self.conn()?;
        let avail: Option<i64> = conn
            .query_row(
                "SELECT v.capacity \
                 - COALESCE((SELECT SUM(size) FROM objects WHERE volume = v.id AND size > 0), 0) \
                 - COALESCE((SELECT SUM(size) FROM reservations WHERE volume = v.id AND size > 0), 0) \
                 FROM volumes v WHERE v.name = ?1",
                [volume],
                |r| r.get(0),
            )
            .optional()?;
        avail.ok_or_else(|| CacheError::VolumeNotFound(volume.to_string()))
    }

    // ---- reservations --------------------------------------------------

    /// Claim `size` more bytes under `name` in `volume`, growing any
    /// existing claim of that name. Returns the new claim size.
    pub fn reserve(&self, volume: &str, name: &str, size: u64) -> Result<i64> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        conn.execute(
            "INSERT INTO reservations (volume, name, size) VALUES (?1, ?2, ?3) \
             ON CONFLICT(volume, name) DO UPDATE SET size = size + excluded.size",
            params![vol_id, name, size as i64],
        )?;
        let total: i64 = conn.query_row(
            "SELECT size FROM reservations WHERE volume = ?1 AND name = ?2",
            params![vol_id, name],
            |r| r.get(0),
        )?;
        debug!(volume, name, size, total, "reserved space");
        Ok(total)
    }

    /// Outstanding size of one claim, if it exists.
    pub fn reservation_size(&self, volume: &str, name: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        Ok(conn
            .query_row(
                "SELECT size FROM reservations WHERE volume = ?1 AND name = ?2",
                params![vol_id, name],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Shrink a claim by `amount`; the claim is dropped once exhausted.
    /// Returns what remains (0 if dropped or absent).
    pub fn debit_reservation(&self, volume: &str, name: &str, amount: u64) -> Result<i64> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        conn.execute(
            "UPDATE reservations SET size = size - ?3 WHERE volume = ?1 AND name = ?2",
            params![vol_id, name, amount as i64],
        )?;
        let left: Option<i64> = conn
            .query_row(
                "SELECT size FROM reservations WHERE volume = ?1 AND name = ?2",
                params![vol_id, name],
                |r| r.get(0),
            )
            .optional()?;
        match left {
            Some(sz) if sz > 0 => Ok(sz),
            Some(_) => {
                conn.execute(
                    "DELETE FROM reservations WHERE volume = ?1 AND name = ?2",
                    params![vol_id, name],
                )?;
                Ok(0)
            }
            None => Ok(0),
        }
    }

    /// Remove a claim outright; `false` if there was none.
    pub fn drop_reservation(&self, volume: &str, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        let n = conn.execute(
            "DELETE FROM reservations WHERE volume = ?1 AND name = ?2",
            params![vol_id, name],
        )?;
        Ok(n > 0)
    }

    /// Total outstanding claims in `volume`.
    pub fn reserved_space_in(&self, volume: &str) -> Result<u64> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM reservations WHERE volume = ?1 AND size > 0",
            [vol_id],
            |r| r.get(0),
        )?;
        Ok(total as u64)
    }

    /// Number of outstanding claims in `volume`.
    pub fn reservation_count(&self, volume: &str) -> Result<usize> {
        let conn = self.conn()?;
        let vol_id = Self::volume_id(&conn, volume)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reservations WHERE volume = ?1",
            [vol_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn md(v: Value) -> Metadata {
        v.as_object().cloned().unwrap()
    }

    fn catalog() -> Catalog {
        let cat = Catalog::in_memory().unwrap();
        cat.register_algorithm("md5").unwrap();
        cat.register_algorithm("sha256").unwrap();
        cat.register_volume("foobar", 200_000, None).unwrap();
        cat.register_volume("fundrum", 10_000, None).unwrap();
        cat
    }

    #[test]
    fn test_register_algorithm_is_idempotent() {
        let cat = catalog();
        let id = cat.register_algorithm("sha256").unwrap();
        assert_eq!(id, 2);
        assert_eq!(cat.algorithms().unwrap(), vec!["md5", "sha256"]);
    }

    #[test]
    fn test_register_volume_keeps_status() {
        let cat = catalog();
        cat.set_volume_status("foobar", VolumeStatus::ForGet).unwrap();
        let update = md(json!({"status": "for_update", "roles": 3}));
        cat.register_volume("foobar", 300_000, Some(&update)).unwrap();
        let info = cat.volume_info("foobar").unwrap();
        assert_eq!(info.status, VolumeStatus::ForGet);
        assert_eq!(info.capacity, 300_000);
        assert_eq!(info.roles, 3);
        assert_eq!(cat.volumes().unwrap(), vec!["foobar", "fundrum"]);
    }

    #[test]
    fn test_add_object_requires_registrations() {
        let cat = catalog();
        let err = cat.add_object("a/b", "nowhere", "b", None).unwrap_err();
        assert!(matches!(err, CacheError::InventoryState(_)));
        let bad = md(json!({"checksum": "abc", "checksumAlgorithm": "crc64"}));
        assert!(cat.add_object("a/b", "foobar", "b", Some(&bad)).is_err());
    }

    #[test]
    fn test_add_and_find() {
        let cat = catalog();
        let m = md(json!({"size": 310, "checksum": "ab12", "color": "red"}));
        let obj = cat.add_object("ds1/a.txt", "foobar", "ds1/a.txt", Some(&m)).unwrap();
        assert!(obj.since > 0);
        assert_eq!(obj.algorithm.as_deref(), Some("sha256"));

        let found = cat.find_object_in("foobar", "ds1/a.txt").unwrap().unwrap();
        assert_eq!(found.size, Some(310));
        assert_eq!(found.priority, 10);
        assert_eq!(found.extra_str("color"), Some("red"));
        assert!(cat.find_object_in("fundrum", "ds1/a.txt").unwrap().is_none());

        cat.add_object("ds1/a.txt", "fundrum", "x", Some(&m)).unwrap();
        assert_eq!(cat.find_object("ds1/a.txt").unwrap().len(), 2);
        cat.set_volume_status("fundrum", VolumeStatus::InfoOnly).unwrap();
        assert_eq!(cat.find_object("ds1/a.txt").unwrap().len(), 1);
        assert_eq!(
            cat.find_object_for("ds1/a.txt", VolumeStatus::Disabled)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn test_add_overwrites() {
        let cat = catalog();
        cat.add_object("x", "foobar", "n", Some(&md(json!({"size": 5}))))
            .unwrap();
        cat.add_object("y", "foobar", "n", Some(&md(json!({"size": 7}))))
            .unwrap();
        let objs = cat.select_objects_in("foobar", Purpose::Listing, None).unwrap();
        assert_eq!(objs.len(), 1);
        assert_eq!(objs[0].id.as_deref(), Some("y"));
        assert_eq!(cat.used_space_in("foobar").unwrap(), 7);
    }

    #[test]
    fn test_update_metadata_touches_one_row() {
        let cat = catalog();
        let m = md(json!({"size": 10}));
        cat.add_object("id", "foobar", "n", Some(&m)).unwrap();
        cat.add_object("id", "fundrum", "n", Some(&m)).unwrap();
        let changed = cat
            .update_metadata("foobar", "n", &md(json!({"priority": 0, "note": "keep"})))
            .unwrap();
        assert!(changed);
        let a = cat.find_object_in("foobar", "n").unwrap().unwrap();
        let b = cat.find_object_in("fundrum", "n").unwrap().unwrap();
        assert_eq!(a.priority, 0);
        assert_eq!(a.extra_str("note"), Some("keep"));
        assert_eq!(a.size, Some(10));
        assert_eq!(b.priority, 10);
        assert!(!cat.update_metadata("foobar", "missing", &Metadata::new()).unwrap());
    }

    #[test]
    fn test_space_accounting() {
        let cat = catalog();
        for (i, sz) in [229, 9321, 44001].iter().enumerate() {
            cat.add_object(&format!("f{i}"), "foobar", &i.to_string(), Some(&md(json!({"size": sz}))))
                .unwrap();
        }
        cat.add_object("nosize", "foobar", "ns", None).unwrap();
        assert_eq!(cat.used_space_in("foobar").unwrap(), 53551);
        assert_eq!(cat.available_space_in("foobar").unwrap(), 200_000 - 53551);
        assert!(cat.remove_object("foobar", "1").unwrap());
        assert!(!cat.remove_object("foobar", "1").unwrap());
        assert_eq!(cat.used_space().unwrap()["foobar"], 44230);
        assert_eq!(cat.used_space().unwrap()["fundrum"], 0);
        assert_eq!(cat.available_space().unwrap()["fundrum"], 10_000);
    }

    #[test]
    fn test_reservations_count_against_space() {
        let cat = catalog();
        assert_eq!(cat.reserve("fundrum", "_r", 4_000).unwrap(), 4_000);
        assert_eq!(cat.reserve("fundrum", "_r", 1_000).unwrap(), 5_000);
        assert_eq!(cat.reservation_count("fundrum").unwrap(), 1);
        assert_eq!(cat.available_space_in("fundrum").unwrap(), 5_000);
        assert_eq!(cat.debit_reservation("fundrum", "_r", 2_000).unwrap(), 3_000);
        assert_eq!(cat.debit_reservation("fundrum", "_r", 3_000).unwrap(), 0);
        assert_eq!(cat.reservation_size("fundrum", "_r").unwrap(), None);
        assert_eq!(cat.available_space_in("fundrum").unwrap(), 10_000);
    }

    #[test]
    fn test_deletion_selection_skips_pinned_and_protected() {
        let cat = catalog();
        cat.add_object("a", "foobar", "a", Some(&md(json!({"size": 1}))))
            .unwrap();
        cat.add_object("b", "foobar", "b", Some(&md(json!({"size": 1, "priority": 0}))))
            .unwrap();
        let sel = cat.select_objects_in("foobar", Purpose::Deletion, None).unwrap();
        assert_eq!(sel.len(), 1);
        cat.set_volume_status("foobar", VolumeStatus::ForGet).unwrap();
        assert!(cat
            .select_objects_in("foobar", Purpose::Deletion, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_check_selection_is_oldest_checked_first() {
        let cat = catalog();
        for n in ["a", "b", "c"] {
            cat.add_object(n, "foobar", n, None).unwrap();
        }
        let now = now_millis();
        cat.update_checked_time("foobar", "a", now).unwrap();
        cat.update_checked_time("foobar", "b", now - 10 * 3_600_000).unwrap();
        let sel = cat.select_objects(Purpose::Check, Some(10)).unwrap();
        let names: Vec<_> = sel.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_eviction_lock_is_per_volume() {
        let cat = catalog();
        let a = cat.eviction_lock("foobar");
        let b = cat.eviction_lock("foobar");
        let c = cat.eviction_lock("fundrum");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
