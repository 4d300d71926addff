//! Durable queue storage.
//!
//! One SQLite table of task rows. FIFO ordering comes from
//! `(created_at, id)`; a transiently-failed task keeps its original
//! `created_at`, so flipping it back to `pending` re-enqueues it at the
//! head. The executor is the only claimer; the store itself is safe for
//! concurrent API reads through the shared mutex.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::error::CoreError;
use crate::queue::task::{Task, TaskPayload, TaskStatus};

const SCHEMA_VERSION: &str = "1";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        task_type         TEXT    NOT NULL,
        payload           TEXT    NOT NULL,
        status            TEXT    NOT NULL DEFAULT 'pending',
        size_bytes        INTEGER,
        bytes_transferred INTEGER NOT NULL DEFAULT 0,
        error             TEXT,
        retry_count       INTEGER NOT NULL DEFAULT 0,
        created_at        TEXT    NOT NULL,
        started_at        TEXT,
        finished_at       TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

/// SQLite-backed task store.
pub struct QueueStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
}

impl QueueStore {
    /// Open (or create) the queue database.
    ///
    /// Unlike the hash cache, the queue is not rebuildable, so corruption is
    /// surfaced instead of silently recreating the file.
    pub fn open(db_path: &Path) -> Result<QueueStore, CoreError> {
        let conn = Connection::open(db_path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(CREATE_TABLES_SQL)?;

        let version: Option<String> = conn
            .prepare_cached("SELECT value FROM meta WHERE key = 'schema_version'")?
            .query_row([], |row| row.get(0))
            .optional()?;
        match version.as_deref() {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                return Err(CoreError::Storage {
                    message: format!("queue schema version {v} unsupported (expected {SCHEMA_VERSION})"),
                });
            }
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
        }

        Ok(QueueStore {
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
            Err(p) => p.into_inner(),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Append a task in `pending` state; returns the stored row.
    pub fn enqueue(&self, payload: &TaskPayload, size_bytes: Option<u64>) -> Result<Task, CoreError> {
        let payload_json = serde_json::to_string(payload)?;
        let now = Utc::now();
        let conn = self.lock();
        conn.prepare_cached(
            "INSERT INTO tasks (task_type, payload, status, size_bytes, created_at)
             VALUES (?1, ?2, 'pending', ?3, ?4)",
        )?
        .execute(params![
            payload.task_type(),
            payload_json,
            size_bytes.map(|s| s as i64),
            now.to_rfc3339()
        ])?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get(id)?.ok_or_else(|| CoreError::Storage {
            message: format!("enqueued task {id} not found"),
        })
    }

    /// Claim the oldest pending task: flips it to `running` and stamps
    /// `started_at`. Returns `None` when nothing is pending.
    pub fn claim_next(&self) -> Result<Option<Task>, CoreError> {
        let conn = self.lock();
        let id: Option<i64> = conn
            .prepare_cached(
                "SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at, id LIMIT 1",
            )?
            .query_row([], |row| row.get(0))
            .optional()?;
        let Some(id) = id else {
            return Ok(None);
        };
        // The last transient error (if any) stays on the row until a terminal
        // transition overwrites it.
        conn.prepare_cached("UPDATE tasks SET status = 'running', started_at = ?1 WHERE id = ?2")?
            .execute(params![Utc::now().to_rfc3339(), id])?;
        drop(conn);
        self.get(id)
    }

    pub fn update_progress(&self, id: i64, bytes_transferred: u64) -> Result<(), CoreError> {
        let conn = self.lock();
        conn.prepare_cached("UPDATE tasks SET bytes_transferred = ?1 WHERE id = ?2")?
            .execute(params![bytes_transferred as i64, id])?;
        Ok(())
    }

    /// Record the total size once known (verify/dedupe discover it late).
    pub fn update_size(&self, id: i64, size_bytes: u64) -> Result<(), CoreError> {
        let conn = self.lock();
        conn.prepare_cached("UPDATE tasks SET size_bytes = ?1 WHERE id = ?2")?
            .execute(params![size_bytes as i64, id])?;
        Ok(())
    }

    /// Terminal transition from `running`.
    pub fn finish(&self, id: i64, status: TaskStatus, error: Option<&str>) -> Result<(), CoreError> {
        debug_assert!(status.is_terminal());
        let conn = self.lock();
        conn.prepare_cached(
            "UPDATE tasks SET status = ?1, error = ?2, finished_at = ?3 WHERE id = ?4",
        )?
        .execute(params![status.as_str(), error, Utc::now().to_rfc3339(), id])?;
        Ok(())
    }

    /// Transient failure: back to `pending` (keeping `created_at`, hence the
    /// head slot), bump `retry_count`, record the intermediate error.
    pub fn requeue(&self, id: i64, error: &str) -> Result<(), CoreError> {
        let conn = self.lock();
        conn.prepare_cached(
            "UPDATE tasks SET status = 'pending', started_at = NULL, bytes_transferred = 0,
                 retry_count = retry_count + 1, error = ?1
             WHERE id = ?2",
        )?
        .execute(params![error, id])?;
        Ok(())
    }

    /// Cancel a pending task. Returns false if it was not pending.
    pub fn cancel_pending(&self, id: i64) -> Result<bool, CoreError> {
        let conn = self.lock();
        let n = conn
            .prepare_cached(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
            )?
            .execute(params![Utc::now().to_rfc3339(), id])?;
        Ok(n > 0)
    }

    /// Cancel every pending task; returns how many were flipped.
    pub fn cancel_all_pending(&self) -> Result<usize, CoreError> {
        let conn = self.lock();
        let n = conn
            .prepare_cached(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?1 WHERE status = 'pending'",
            )?
            .execute(params![Utc::now().to_rfc3339()])?;
        Ok(n)
    }

    /// Remove a pending task row outright. Returns false if not pending.
    pub fn remove_pending(&self, id: i64) -> Result<bool, CoreError> {
        let conn = self.lock();
        let n = conn
            .prepare_cached("DELETE FROM tasks WHERE id = ?1 AND status = 'pending'")?
            .execute(params![id])?;
        Ok(n > 0)
    }

    /// Server restarts leave `running` rows orphaned; flip them back to
    /// `pending` with progress cleared. Returns how many were reset.
    pub fn reset_orphaned_running(&self) -> Result<usize, CoreError> {
        let conn = self.lock();
        let n = conn
            .prepare_cached(
                "UPDATE tasks SET status = 'pending', started_at = NULL,
                     bytes_transferred = 0, error = NULL
                 WHERE status = 'running'",
            )?
            .execute([])?;
        Ok(n)
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn get(&self, id: i64) -> Result<Option<Task>, CoreError> {
        let conn = self.lock();
        let task = conn
            .prepare_cached("SELECT * FROM tasks WHERE id = ?1")?
            .query_row(params![id], row_to_task)
            .optional()?;
        task.transpose().map_err(|e| CoreError::Storage {
            message: format!("task {id} row decode: {e}"),
        })
    }

    /// All tasks: the running one first, then pending in FIFO order, then
    /// terminal rows newest-first.
    pub fn list(&self) -> Result<Vec<Task>, CoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT * FROM tasks
             ORDER BY CASE status
                          WHEN 'running' THEN 0
                          WHEN 'pending' THEN 1
                          ELSE 2
                      END,
                      CASE WHEN status IN ('running', 'pending') THEN created_at ELSE '' END,
                      CASE WHEN status IN ('running', 'pending') THEN ''
                           ELSE COALESCE(finished_at, '') END DESC,
                      id",
        )?;
        let rows = stmt.query_map([], row_to_task)?;
        let mut out = Vec::new();
        for row in rows {
            match row? {
                Ok(task) => out.push(task),
                Err(e) => log::warn!("queue row decode failed: {e}"),
            }
        }
        Ok(out)
    }

    /// The running task, if any.
    pub fn active(&self) -> Result<Option<Task>, CoreError> {
        let conn = self.lock();
        let task = conn
            .prepare_cached("SELECT * FROM tasks WHERE status = 'running' LIMIT 1")?
            .query_row([], row_to_task)
            .optional()?;
        task.transpose().map_err(|e| CoreError::Storage {
            message: format!("active task row decode: {e}"),
        })
    }

    /// Count of pending tasks (executor idle check).
    pub fn pending_count(&self) -> Result<usize, CoreError> {
        let conn = self.lock();
        let n: i64 = conn
            .prepare_cached("SELECT COUNT(*) FROM tasks WHERE status = 'pending'")?
            .query_row([], |row| row.get(0))?;
        Ok(n as usize)
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

type TaskDecode = Result<Task, serde_json::Error>;

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskDecode> {
    let id: i64 = row.get("id")?;
    let payload_json: String = row.get("payload")?;
    let status_raw: String = row.get("status")?;
    let size_bytes: Option<i64> = row.get("size_bytes")?;
    let bytes_transferred: i64 = row.get("bytes_transferred")?;
    let error: Option<String> = row.get("error")?;
    let retry_count: i64 = row.get("retry_count")?;
    let created_at: String = row.get("created_at")?;
    let started_at: Option<String> = row.get("started_at")?;
    let finished_at: Option<String> = row.get("finished_at")?;

    Ok(serde_json::from_str::<TaskPayload>(&payload_json).map(|payload| Task {
        id,
        task_type: payload.task_type(),
        status: TaskStatus::parse(&status_raw).unwrap_or(TaskStatus::Failed),
        payload,
        size_bytes: size_bytes.map(|s| s as u64),
        bytes_transferred: bytes_transferred as u64,
        error,
        retry_count: retry_count as u32,
        created_at: parse_ts(Some(created_at)).unwrap_or_else(Utc::now),
        started_at: parse_ts(started_at),
        finished_at: parse_ts(finished_at),
    }))
}
