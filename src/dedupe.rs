//! Duplicate-group scanner and deletion executor.
//!
//! A `dedupe_scan` queue task walks one side's index, hashes candidates
//! through the worker pool (cache-first), groups by digest, and persists
//! groups under a fresh scan id. Executing selections stat-checks each
//! group against the scan-time coordinates and enqueues policy-bypassing
//! delete tasks for the non-kept members.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Core;
use crate::config::Side;
use crate::error::CoreError;
use crate::events::{QueueProgress, Topic};
use crate::hasher::HashJob;
use crate::paths::{RelPath, join_guarded};
use crate::queue::{DedupeMode, Task};

const SCHEMA_VERSION: &str = "1";

const CREATE_TABLES_SQL: &str = "
    CREATE TABLE IF NOT EXISTS scans (
        scan_id              TEXT PRIMARY KEY,
        side                 TEXT    NOT NULL,
        created_at           TEXT    NOT NULL,
        duplicate_groups     INTEGER NOT NULL,
        duplicate_files      INTEGER NOT NULL,
        total_bytes_redundant INTEGER NOT NULL
    ) WITHOUT ROWID;

    CREATE TABLE IF NOT EXISTS groups (
        id      INTEGER PRIMARY KEY AUTOINCREMENT,
        scan_id TEXT NOT NULL,
        side    TEXT NOT NULL,
        hash    TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_groups_scan ON groups (scan_id);

    CREATE TABLE IF NOT EXISTS group_files (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        relpath  TEXT    NOT NULL,
        size     INTEGER NOT NULL,
        mtime_ms INTEGER NOT NULL,
        keep     INTEGER NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_group_files_group ON group_files (group_id);

    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    ) WITHOUT ROWID;
";

// ── Models ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateFile {
    pub relpath: RelPath,
    pub size: u64,
    pub mtime_ms: i64,
    /// Default keep suggestion (first member by relpath).
    pub keep: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub id: i64,
    pub hash: String,
    pub side: Side,
    pub files: Vec<DuplicateFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanSummary {
    pub scan_id: String,
    pub side: Side,
    pub created_at: String,
    pub duplicate_groups: usize,
    pub duplicate_files: usize,
    pub total_bytes_redundant: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeepSelection {
    pub group_id: i64,
    pub keep_relpath: RelPath,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedGroup {
    pub group_id: i64,
    pub error: String,
}

/// Best-effort execution report.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    pub skipped: Vec<SkippedGroup>,
}

// ── Store ────────────────────────────────────────────────────────────

/// SQLite persistence for scan results.
pub struct DedupeStore {
    db_path: PathBuf,
    conn: Mutex<Connection>,
}

impl DedupeStore {
    pub fn open(db_path: &Path) -> Result<DedupeStore, CoreError> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(CREATE_TABLES_SQL)?;
        let version: Option<String> = conn
            .prepare_cached("SELECT value FROM meta WHERE key = 'schema_version'")?
            .query_row([], |row| row.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Ok(DedupeStore {
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

    /// Persist a scan and its groups in one transaction.
    pub fn record_scan(
        &self,
        summary: &ScanSummary,
        groups: &[(String, Vec<DuplicateFile>)],
    ) -> Result<(), CoreError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO scans (scan_id, side, created_at, duplicate_groups, duplicate_files, total_bytes_redundant)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.scan_id,
                summary.side.as_str(),
                summary.created_at,
                summary.duplicate_groups as i64,
                summary.duplicate_files as i64,
                summary.total_bytes_redundant as i64
            ],
        )?;
        for (hash, files) in groups {
            tx.execute(
                "INSERT INTO groups (scan_id, side, hash) VALUES (?1, ?2, ?3)",
                params![summary.scan_id, summary.side.as_str(), hash],
            )?;
            let group_id = tx.last_insert_rowid();
            let mut stmt = tx.prepare_cached(
                "INSERT INTO group_files (group_id, relpath, size, mtime_ms, keep)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for file in files {
                stmt.execute(params![
                    group_id,
                    file.relpath.as_str(),
                    file.size as i64,
                    file.mtime_ms,
                    file.keep as i32
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_scan(&self, scan_id: &str) -> Result<Option<ScanSummary>, CoreError> {
        let conn = self.lock();
        let row = conn
            .prepare_cached(
                "SELECT scan_id, side, created_at, duplicate_groups, duplicate_files, total_bytes_redundant
                 FROM scans WHERE scan_id = ?1",
            )?
            .query_row(params![scan_id], scan_row)
            .optional()?;
        Ok(row)
    }

    /// Most recent scan summary, if any.
    pub fn latest_scan(&self) -> Result<Option<ScanSummary>, CoreError> {
        let conn = self.lock();
        let row = conn
            .prepare_cached(
                "SELECT scan_id, side, created_at, duplicate_groups, duplicate_files, total_bytes_redundant
                 FROM scans ORDER BY created_at DESC LIMIT 1",
            )?
            .query_row([], scan_row)
            .optional()?;
        Ok(row)
    }

    pub fn groups_for_scan(&self, scan_id: &str) -> Result<Vec<DuplicateGroup>, CoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare_cached("SELECT id, side, hash FROM groups WHERE scan_id = ?1 ORDER BY id")?;
        let headers: Vec<(i64, String, String)> = stmt
            .query_map(params![scan_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut out = Vec::with_capacity(headers.len());
        let mut file_stmt = conn.prepare_cached(
            "SELECT relpath, size, mtime_ms, keep FROM group_files WHERE group_id = ?1 ORDER BY relpath",
        )?;
        for (id, side_raw, hash) in headers {
            let Some(side) = Side::parse(&side_raw) else {
                log::warn!("dedupe group {id} has invalid side {side_raw:?}");
                continue;
            };
            let files: Vec<DuplicateFile> = file_stmt
                .query_map(params![id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i32>(3)?,
                    ))
                })?
                .filter_map(|row| {
                    let (relpath, size, mtime_ms, keep) = match row {
                        Ok(r) => r,
                        Err(e) => {
                            log::warn!("dedupe file row decode failed: {e}");
                            return None;
                        }
                    };
                    match RelPath::new(&relpath) {
                        Ok(relpath) => Some(DuplicateFile {
                            relpath,
                            size: size as u64,
                            mtime_ms,
                            keep: keep != 0,
                        }),
                        Err(e) => {
                            log::warn!("dedupe file row holds invalid relpath: {e}");
                            None
                        }
                    }
                })
                .collect();
            out.push(DuplicateGroup { id, hash, side, files });
        }
        Ok(out)
    }

    pub fn get_group(&self, scan_id: &str, group_id: i64) -> Result<Option<DuplicateGroup>, CoreError> {
        Ok(self
            .groups_for_scan(scan_id)?
            .into_iter()
            .find(|g| g.id == group_id))
    }

    /// Drop a scan and all its groups. Returns false if the scan is unknown.
    pub fn delete_scan(&self, scan_id: &str) -> Result<bool, CoreError> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "DELETE FROM group_files WHERE group_id IN (SELECT id FROM groups WHERE scan_id = ?1)",
            params![scan_id],
        )?;
        tx.execute("DELETE FROM groups WHERE scan_id = ?1", params![scan_id])?;
        let n = tx.execute("DELETE FROM scans WHERE scan_id = ?1", params![scan_id])?;
        tx.commit()?;
        Ok(n > 0)
    }
}

fn scan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanSummary> {
    let side_raw: String = row.get(1)?;
    Ok(ScanSummary {
        scan_id: row.get(0)?,
        side: Side::parse(&side_raw).unwrap_or(Side::Local),
        created_at: row.get(2)?,
        duplicate_groups: row.get::<_, i64>(3)? as usize,
        duplicate_files: row.get::<_, i64>(4)? as usize,
        total_bytes_redundant: row.get::<_, i64>(5)? as u64,
    })
}

// ── Scan ─────────────────────────────────────────────────────────────

/// Execute a `dedupe_scan` queue task; returns the summary for the
/// `task_complete` payload.
pub fn run_scan(
    core: &Core,
    task: &Task,
    cancel: &Arc<AtomicBool>,
    side: Side,
    mode: DedupeMode,
    min_size_bytes: u64,
) -> Result<serde_json::Value, CoreError> {
    let snapshot = core.index.snapshot(side);
    let eligible: Vec<_> = snapshot
        .values()
        .filter(|e| e.size >= min_size_bytes)
        .collect();

    // Fast mode only hashes files whose (size, mtime) pre-group has company;
    // full mode hashes everything in scope.
    let candidates: Vec<RelPath> = match mode {
        DedupeMode::Full => eligible.iter().map(|e| e.relpath.clone()).collect(),
        DedupeMode::Fast => {
            let mut pre_groups: std::collections::HashMap<(u64, i64), Vec<&RelPath>> =
                std::collections::HashMap::new();
            for entry in &eligible {
                pre_groups
                    .entry((entry.size, entry.mtime_ms))
                    .or_default()
                    .push(&entry.relpath);
            }
            let mut out: Vec<RelPath> = pre_groups
                .into_values()
                .filter(|members| members.len() >= 2)
                .flatten()
                .cloned()
                .collect();
            out.sort();
            out
        }
    };

    let total = candidates.len();
    core.queue.store().update_size(task.id, total as u64)?;
    log::info!(
        "dedupe scan on {side}: {total} candidates ({mode:?}, min size {min_size_bytes})"
    );

    // Submit everything up front so the pool works in parallel, then collect
    // each reply in order.
    let mut pending = Vec::with_capacity(total);
    for relpath in candidates {
        let (reply_tx, reply_rx) = mpsc::channel();
        core.hashers.submit(HashJob {
            side,
            relpath: relpath.clone(),
            force: false,
            cancel: Arc::clone(cancel),
            reply: Some(reply_tx),
        })?;
        pending.push((relpath, reply_rx));
    }

    let mut hashed: Vec<(RelPath, String)> = Vec::with_capacity(total);
    for (done, (relpath, reply_rx)) in pending.into_iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled);
        }
        match reply_rx.recv() {
            Ok(Ok(outcome)) => hashed.push((relpath, outcome.hash)),
            Ok(Err(CoreError::Cancelled)) => return Err(CoreError::Cancelled),
            Ok(Err(e)) => log::warn!("dedupe scan: skipping {relpath}: {e}"),
            Err(_) => {
                return Err(CoreError::Storage {
                    message: "hash worker dropped its reply".into(),
                });
            }
        }
        core.queue.store().update_progress(task.id, (done + 1) as u64)?;
        core.bus.publish(
            Topic::QueueProgress,
            &QueueProgress {
                task_id: task.id,
                bytes_transferred: (done + 1) as u64,
                total_bytes: total as u64,
                progress_pct: if total > 0 { (((done + 1) * 100) / total) as u8 } else { 100 },
            },
        );
    }

    // Group by digest; only groups of two or more are duplicates.
    let mut by_hash: std::collections::BTreeMap<String, Vec<RelPath>> = std::collections::BTreeMap::new();
    for (relpath, hash) in hashed {
        by_hash.entry(hash).or_default().push(relpath);
    }

    let mut groups: Vec<(String, Vec<DuplicateFile>)> = Vec::new();
    let mut duplicate_files = 0usize;
    let mut redundant = 0u64;
    for (hash, mut members) in by_hash {
        if members.len() < 2 {
            continue;
        }
        members.sort();
        let files: Vec<DuplicateFile> = members
            .into_iter()
            .enumerate()
            .filter_map(|(i, relpath)| {
                snapshot.get(&relpath).map(|entry| DuplicateFile {
                    relpath,
                    size: entry.size,
                    mtime_ms: entry.mtime_ms,
                    keep: i == 0,
                })
            })
            .collect();
        duplicate_files += files.len();
        redundant += files.iter().skip(1).map(|f| f.size).sum::<u64>();
        groups.push((hash, files));
    }

    let summary = ScanSummary {
        scan_id: Uuid::new_v4().to_string(),
        side,
        created_at: chrono::Utc::now().to_rfc3339(),
        duplicate_groups: groups.len(),
        duplicate_files,
        total_bytes_redundant: redundant,
    };
    core.dedupe.record_scan(&summary, &groups)?;
    log::info!(
        "dedupe scan {} done: {} groups, {} redundant bytes",
        summary.scan_id,
        summary.duplicate_groups,
        summary.total_bytes_redundant
    );
    Ok(serde_json::to_value(&summary)?)
}

// ── Execute ──────────────────────────────────────────────────────────

/// Enqueue deletion of every non-kept member of the selected groups.
///
/// A group whose files no longer stat-match the scan is skipped with a
/// per-group error; the whole operation is best-effort.
pub fn execute_selections(
    core: &Core,
    scan_id: &str,
    selections: &[KeepSelection],
) -> Result<ExecuteReport, CoreError> {
    if core.dedupe.get_scan(scan_id)?.is_none() {
        return Err(CoreError::NotFound {
            path: format!("dedupe scan {scan_id}"),
        });
    }

    let mut report = ExecuteReport {
        deleted: 0,
        freed_bytes: 0,
        skipped: Vec::new(),
    };

    for selection in selections {
        let Some(group) = core.dedupe.get_group(scan_id, selection.group_id)? else {
            report.skipped.push(SkippedGroup {
                group_id: selection.group_id,
                error: format!("group {} not found in scan {scan_id}", selection.group_id),
            });
            continue;
        };
        if !group.files.iter().any(|f| f.relpath == selection.keep_relpath) {
            report.skipped.push(SkippedGroup {
                group_id: group.id,
                error: format!("{} is not a member of group {}", selection.keep_relpath, group.id),
            });
            continue;
        }

        // Every member must still match its scan-time coordinates.
        if let Some(stale) = find_stale_member(core, &group) {
            let err = CoreError::DedupeStaleGroup {
                group_id: group.id,
                relpath: stale,
            };
            log::warn!("dedupe execute: {err}");
            report.skipped.push(SkippedGroup {
                group_id: group.id,
                error: err.to_string(),
            });
            continue;
        }

        for file in &group.files {
            if file.relpath == selection.keep_relpath {
                continue;
            }
            core.queue
                .enqueue_delete(&core.config, group.side, file.relpath.clone(), true)?;
            report.deleted += 1;
            report.freed_bytes += file.size;
        }
    }
    Ok(report)
}

/// First group member whose live stat no longer matches the scan record.
fn find_stale_member(core: &Core, group: &DuplicateGroup) -> Option<String> {
    for file in &group.files {
        let path = match join_guarded(core.config.root(group.side), &file.relpath) {
            Ok(p) => p,
            Err(_) => return Some(file.relpath.as_str().to_string()),
        };
        match std::fs::metadata(&path) {
            Ok(stat)
                if stat.len() == file.size
                    && crate::index::mtime_ms(&stat) == file.mtime_ms => {}
            _ => return Some(file.relpath.as_str().to_string()),
        }
    }
    None
}
