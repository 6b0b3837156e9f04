use rusqlite::Connection;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS volumes (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    name     TEXT NOT NULL UNIQUE,
    capacity INTEGER NOT NULL,
    status   INTEGER NOT NULL DEFAULT 3,
    roles    INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0,
    metadata TEXT
);
CREATE TABLE IF NOT EXISTS algorithms (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS objects (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    objid      TEXT,
    name       TEXT NOT NULL,
    volume     INTEGER NOT NULL REFERENCES volumes(id),
    size       INTEGER NOT NULL DEFAULT -1,
    checksum   TEXT,
    algorithm  INTEGER REFERENCES algorithms(id),
    priority   INTEGER NOT NULL DEFAULT 10,
    since      INTEGER NOT NULL,
    since_date TEXT,
    checked    INTEGER NOT NULL DEFAULT 0,
    metadata   TEXT,
    UNIQUE(volume, name)
);
CREATE INDEX IF NOT EXISTS objects_objid ON objects(objid);
CREATE INDEX IF NOT EXISTS objects_checked ON objects(checked);
CREATE TABLE IF NOT EXISTS reservations (
    volume INTEGER NOT NULL REFERENCES volumes(id),
    name   TEXT NOT NULL,
    size   INTEGER NOT NULL,
    PRIMARY KEY(volume, name)
);
"#;

/// Apply connection pragmas and create any missing tables.
pub(super) fn init(conn: &Connection, on_disk: bool) -> rusqlite::Result<()> {
    if on_disk {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)
}
