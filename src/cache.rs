//! SQLite-backed hash cache.
//!
//! Maps `(side, relpath)` to the digest computed at a specific `(size,
//! mtime)` coordinate. Reads return a hash only when all four coordinates
//! match, so a stale row is indistinguishable from a missing one. WAL mode;
//! all access goes through one mutex-guarded connection.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::config::Side;
use crate::error::CoreError;
use crate::paths::RelPath;

const SCHEMA_VERSION: &str = "1";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS hash_cache (
        side        TEXT    NOT NULL,
        relpath     TEXT    NOT NULL,
        size        INTEGER NOT NULL,
        mtime_ms    INTEGER NOT NULL,
        hash        TEXT    NOT NULL,
        computed_at TEXT    NOT NULL,
        PRIMARY KEY (side, relpath)
    ) WITHOUT ROWID;

    CREATE INDEX IF NOT EXISTS idx_hash_cache_hash ON hash_cache (hash);

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

/// One cached digest row.
#[derive(Debug, Clone)]
pub struct CacheRow {
    pub side: Side,
    pub relpath: RelPath,
    pub size: u64,
    pub mtime_ms: i64,
    pub hash: String,
}

/// Persistent `(side, relpath, size, mtime) → hash` store.
pub struct HashCache {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
}

fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(CREATE_TABLES_SQL)
}

fn stamp_version(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
        params!["schema_version", SCHEMA_VERSION],
    )?;
    Ok(())
}

impl HashCache {
    /// Open (or create) the cache database.
    ///
    /// On schema mismatch or corruption the DB file is deleted and recreated;
    /// the cache is rebuildable from file contents, losing it costs time only.
    pub fn open(db_path: &Path) -> Result<HashCache, CoreError> {
        match Self::try_open(db_path) {
            Ok(cache) => Ok(cache),
            Err(e) => {
                log::warn!("hash cache open failed ({e}), deleting and recreating");
                Self::delete_and_recreate(db_path)
            }
        }
    }

    fn try_open(db_path: &Path) -> Result<HashCache, CoreError> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;

        let version: Option<String> = conn
            .prepare_cached("SELECT value FROM meta WHERE key = 'schema_version'")?
            .query_row([], |row| row.get(0))
            .optional()?;
        match version.as_deref() {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                log::warn!("hash cache schema mismatch (expected {SCHEMA_VERSION}, found {v}), resetting");
                conn.execute_batch("DROP TABLE IF EXISTS hash_cache; DROP TABLE IF EXISTS meta;")?;
                create_tables(&conn)?;
                stamp_version(&conn)?;
            }
            None => stamp_version(&conn)?,
        }

        Ok(HashCache {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    fn delete_and_recreate(db_path: &Path) -> Result<HashCache, CoreError> {
        if db_path.exists() {
            std::fs::remove_file(db_path).map_err(|e| CoreError::from(e).with_path(db_path))?;
        }
        for ext in ["db-wal", "db-shm"] {
            let sidecar = db_path.with_extension(ext);
            if sidecar.exists() {
                let _ = std::fs::remove_file(&sidecar);
            }
        }
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        create_tables(&conn)?;
        stamp_version(&conn)?;
        Ok(HashCache {
            db_path: db_path.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ── Hash rows ────────────────────────────────────────────────────

    /// Return the cached hash only if side, relpath, size and mtime all match.
    pub fn get(&self, side: Side, relpath: &RelPath, size: u64, mtime_ms: i64) -> Option<String> {
        let conn = self.lock();
        let result = conn
            .prepare_cached(
                "SELECT hash FROM hash_cache
                 WHERE side = ?1 AND relpath = ?2 AND size = ?3 AND mtime_ms = ?4",
            )
            .and_then(|mut stmt| {
                stmt.query_row(
                    params![side.as_str(), relpath.as_str(), size as i64, mtime_ms],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            });
        match result {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("hash cache get failed for {relpath}: {e}");
                None
            }
        }
    }

    /// The stored row for `(side, relpath)` regardless of stat coordinates.
    pub fn get_row(&self, side: Side, relpath: &RelPath) -> Option<CacheRow> {
        let conn = self.lock();
        let result = conn
            .prepare_cached(
                "SELECT size, mtime_ms, hash FROM hash_cache WHERE side = ?1 AND relpath = ?2",
            )
            .and_then(|mut stmt| {
                stmt.query_row(params![side.as_str(), relpath.as_str()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?))
                })
                .optional()
            });
        match result {
            Ok(Some((size, mtime_ms, hash))) => Some(CacheRow {
                side,
                relpath: relpath.clone(),
                size: size as u64,
                mtime_ms,
                hash,
            }),
            Ok(None) => None,
            Err(e) => {
                log::warn!("hash cache row lookup failed for {relpath}: {e}");
                None
            }
        }
    }

    /// Upsert the digest for a `(side, relpath)` at the given coordinates.
    pub fn put(
        &self,
        side: Side,
        relpath: &RelPath,
        size: u64,
        mtime_ms: i64,
        hash: &str,
    ) -> Result<(), CoreError> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock();
        conn.prepare_cached(
            "INSERT OR REPLACE INTO hash_cache (side, relpath, size, mtime_ms, hash, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?
        .execute(params![
            side.as_str(),
            relpath.as_str(),
            size as i64,
            mtime_ms,
            hash,
            now
        ])?;
        Ok(())
    }

    /// Drop the row for `(side, relpath)`, if any.
    pub fn invalidate(&self, side: Side, relpath: &RelPath) -> Result<(), CoreError> {
        let conn = self.lock();
        conn.prepare_cached("DELETE FROM hash_cache WHERE side = ?1 AND relpath = ?2")?
            .execute(params![side.as_str(), relpath.as_str()])?;
        Ok(())
    }

    /// All rows for one side (bulk iteration for the dedupe engine).
    pub fn rows_for_side(&self, side: Side) -> Result<Vec<CacheRow>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT relpath, size, mtime_ms, hash FROM hash_cache WHERE side = ?1 ORDER BY relpath",
        )?;
        let rows = stmt.query_map(params![side.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (relpath, size, mtime_ms, hash) = row?;
            match RelPath::new(&relpath) {
                Ok(relpath) => out.push(CacheRow {
                    side,
                    relpath,
                    size: size as u64,
                    mtime_ms,
                    hash,
                }),
                Err(e) => log::warn!("hash cache holds invalid relpath {relpath:?}: {e}"),
            }
        }
        Ok(out)
    }
}
