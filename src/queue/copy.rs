//! The copy task protocol.
//!
//! Source bytes stream through BLAKE3 into a `<dst>.part` staging file with
//! a cancellation check between chunks; the staging file is fsynced and
//! atomically renamed over the destination. The source mtime is preserved
//! and both sides' cache/index rows learn the digest, so a diff taken right
//! after completion reports `same`.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use filetime::FileTime;

use crate::Core;
use crate::error::CoreError;
use crate::events::{QueueProgress, Topic};
use crate::hasher::CHUNK_SIZE;
use crate::index::{DiffStatus, IndexEntry, classify_pair, mtime_ms};
use crate::paths::join_guarded;
use crate::queue::task::{Task, TaskPayload};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const DB_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Staging path: `<dst>.part` next to the final destination.
fn part_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dst.with_file_name(name)
}

pub(super) fn execute_copy(core: &Core, task: &Task, cancel: &Arc<AtomicBool>) -> Result<(), CoreError> {
    let TaskPayload::Copy {
        src_side,
        src_relpath,
        dst_side,
        dst_relpath,
    } = &task.payload
    else {
        return Err(CoreError::Invalid {
            message: "copy handler received a non-copy payload".into(),
        });
    };
    let (src_side, dst_side) = (*src_side, *dst_side);

    let src_path = join_guarded(core.config.root(src_side), src_relpath)?;
    let dst_path = join_guarded(core.config.root(dst_side), dst_relpath)?;

    // Refuse only on a confirmed conflict at the destination identity.
    let local_entry = core.index.get(crate::config::Side::Local, dst_relpath);
    let lake_entry = core.index.get(crate::config::Side::Lake, dst_relpath);
    if classify_pair(local_entry.as_ref(), lake_entry.as_ref()) == DiffStatus::Conflict {
        return Err(CoreError::ConflictRefused {
            relpath: dst_relpath.as_str().to_string(),
        });
    }

    let src_stat = fs::metadata(&src_path).map_err(|e| CoreError::from(e).with_path(&src_path))?;
    if !src_stat.is_file() {
        return Err(CoreError::NotFound {
            path: src_path.display().to_string(),
        });
    }
    let src_size = src_stat.len();
    let src_mtime = mtime_ms(&src_stat);

    if let Some(parent) = dst_path.parent() {
        fs::create_dir_all(parent).map_err(|e| CoreError::from(e).with_path(parent))?;
    }

    let staging = part_path(&dst_path);
    let result = stream_to_part(core, task, cancel, &src_path, &staging, src_size);
    let hash = match result {
        Ok(hash) => hash,
        Err(e) => {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
    };

    if let Err(e) = fs::rename(&staging, &dst_path) {
        let _ = fs::remove_file(&staging);
        return Err(CoreError::from(e).with_path(&dst_path));
    }

    // Preserve the source mtime so a later stat-only diff still pairs up.
    let ft = FileTime::from_unix_time(src_mtime / 1000, ((src_mtime % 1000) * 1_000_000) as u32);
    if let Err(e) = filetime::set_file_mtime(&dst_path, ft) {
        log::warn!("copy: failed to preserve mtime on {}: {e}", dst_path.display());
    }

    let dst_stat = fs::metadata(&dst_path).map_err(|e| CoreError::from(e).with_path(&dst_path))?;
    let dst_mtime = mtime_ms(&dst_stat);

    core.cache.put(dst_side, dst_relpath, dst_stat.len(), dst_mtime, &hash)?;
    core.index.upsert(
        dst_side,
        IndexEntry {
            relpath: dst_relpath.clone(),
            size: dst_stat.len(),
            mtime_ms: dst_mtime,
            hash: Some(hash.clone()),
        },
    );

    // The stream digest is also the source digest, valid as long as the
    // source did not change underneath the copy.
    match fs::metadata(&src_path) {
        Ok(stat) if stat.len() == src_size && mtime_ms(&stat) == src_mtime => {
            core.cache.put(src_side, src_relpath, src_size, src_mtime, &hash)?;
            core.index.set_hash(src_side, src_relpath, &hash);
        }
        _ => log::warn!("copy: source {src_relpath} changed during copy, not caching its digest"),
    }

    core.queue.store().update_progress(task.id, src_size)?;
    log::info!(
        "copied {src_relpath} {src_side} -> {dst_side} ({src_size} bytes, {})",
        &hash[..8.min(hash.len())]
    );
    Ok(())
}

/// Chunked read/write into the staging file, hashing as it goes.
/// Returns the hex digest of everything written.
fn stream_to_part(
    core: &Core,
    task: &Task,
    cancel: &Arc<AtomicBool>,
    src_path: &Path,
    staging: &Path,
    total_bytes: u64,
) -> Result<String, CoreError> {
    let mut src = fs::File::open(src_path).map_err(|e| CoreError::from(e).with_path(src_path))?;
    let mut dst = fs::File::create(staging).map_err(|e| CoreError::from(e).with_path(staging))?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes_copied = 0u64;
    let mut last_event = Instant::now();
    let mut last_db_update = Instant::now();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled);
        }
        let n = src
            .read(&mut buffer)
            .map_err(|e| CoreError::from(e).with_path(src_path))?;
        if n == 0 {
            break;
        }
        dst.write_all(&buffer[..n])
            .map_err(|e| CoreError::from(e).with_path(staging))?;
        hasher.update(&buffer[..n]);
        bytes_copied += n as u64;

        if last_event.elapsed() >= PROGRESS_INTERVAL {
            publish_progress(core, task.id, bytes_copied, total_bytes);
            last_event = Instant::now();
        }
        if last_db_update.elapsed() >= DB_PROGRESS_INTERVAL {
            core.queue.store().update_progress(task.id, bytes_copied)?;
            last_db_update = Instant::now();
        }
    }

    dst.sync_all().map_err(|e| CoreError::from(e).with_path(staging))?;
    drop(dst);

    publish_progress(core, task.id, bytes_copied, total_bytes);
    Ok(hasher.finalize().to_hex().to_string())
}

fn publish_progress(core: &Core, task_id: i64, bytes_transferred: u64, total_bytes: u64) {
    let progress_pct = if total_bytes > 0 {
        ((bytes_transferred as f64 / total_bytes as f64) * 100.0).min(100.0) as u8
    } else {
        100
    };
    core.bus.publish(
        Topic::QueueProgress,
        &QueueProgress {
            task_id,
            bytes_transferred,
            total_bytes,
            progress_pct,
        },
    );
}
