//! The queue executor: a single long-lived worker that claims the next
//! runnable task and dispatches to the type-specific handler.
//!
//! Holds no locks during I/O. Transient failures re-enqueue the task at the
//! head with exponential backoff until `QUEUE_RETRY_COUNT` is exhausted;
//! cancellation is cooperative and observed between chunks. A cancelled
//! task never consumes a retry.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::Core;
use crate::config::Side;
use crate::error::CoreError;
use crate::events::{QueueProgress, TaskComplete, TaskStarted, Topic, VerifyProgress};
use crate::paths::{RelPath, join_guarded};
use crate::queue::copy::execute_copy;
use crate::queue::task::{Task, TaskPayload, TaskStatus};

const IDLE_WAIT: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Start the executor thread. It runs until `Core::request_stop` is called.
pub fn spawn_executor(core: Arc<Core>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("queue-executor".into())
        .spawn(move || executor_loop(core))
        .expect("failed to spawn queue executor")
}

fn executor_loop(core: Arc<Core>) {
    log::info!("queue executor started");
    while !core.stopping() {
        if core.queue.is_paused() {
            core.queue.wait_for_work(IDLE_WAIT);
            continue;
        }
        match core.queue.store().claim_next() {
            Ok(Some(task)) => process_task(&core, task),
            Ok(None) => core.queue.wait_for_work(IDLE_WAIT),
            Err(e) => {
                log::error!("executor failed to claim next task: {e}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }
    log::info!("queue executor stopped");
}

fn process_task(core: &Arc<Core>, task: Task) {
    let cancel = core.queue.register_cancel(task.id);
    core.bus.publish(
        Topic::TaskStarted,
        &TaskStarted {
            task_id: task.id,
            task_type: task.task_type,
        },
    );
    log::info!("task {} ({}) started", task.id, task.task_type);

    let result = dispatch(core, &task, &cancel);
    core.queue.unregister_cancel(task.id);

    match result {
        Ok(result_value) => {
            if let Err(e) = core.queue.store().finish(task.id, TaskStatus::Completed, None) {
                log::error!("task {}: failed to record completion: {e}", task.id);
            }
            core.bus.publish(
                Topic::TaskComplete,
                &TaskComplete {
                    task_id: task.id,
                    status: "completed",
                    error: None,
                    result: result_value,
                },
            );
            log::info!("task {} completed", task.id);
        }
        Err(CoreError::Cancelled) => {
            if let Err(e) = core.queue.store().finish(task.id, TaskStatus::Cancelled, None) {
                log::error!("task {}: failed to record cancellation: {e}", task.id);
            }
            core.bus.publish(
                Topic::TaskComplete,
                &TaskComplete {
                    task_id: task.id,
                    status: "cancelled",
                    error: None,
                    result: None,
                },
            );
            log::info!("task {} cancelled", task.id);
        }
        Err(e) if e.is_transient() && task.retry_count < core.config.queue_retry_count => {
            log::warn!(
                "task {} hit transient error (attempt {}/{}): {e}",
                task.id,
                task.retry_count + 1,
                core.config.queue_retry_count
            );
            if let Err(store_err) = core.queue.store().requeue(task.id, &e.to_string()) {
                log::error!("task {}: failed to requeue: {store_err}", task.id);
            }
            backoff(core, task.retry_count);
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(store_err) = core.queue.store().finish(task.id, TaskStatus::Failed, Some(&message)) {
                log::error!("task {}: failed to record failure: {store_err}", task.id);
            }
            core.bus.publish(
                Topic::TaskComplete,
                &TaskComplete {
                    task_id: task.id,
                    status: "failed",
                    error: Some(message.clone()),
                    result: None,
                },
            );
            log::warn!("task {} failed: {message}", task.id);
        }
    }
}

fn dispatch(
    core: &Arc<Core>,
    task: &Task,
    cancel: &Arc<AtomicBool>,
) -> Result<Option<serde_json::Value>, CoreError> {
    match &task.payload {
        TaskPayload::Copy { .. } => execute_copy(core, task, cancel).map(|_| None),
        TaskPayload::Delete { side, relpath, .. } => {
            execute_delete(core, *side, relpath).map(|_| None)
        }
        TaskPayload::Verify { side, folder, relpath } => {
            execute_verify(core, task, cancel, *side, folder.as_deref(), relpath.as_ref()).map(|_| None)
        }
        TaskPayload::HashFile { side, relpath } => {
            execute_hash_file(core, task, *side, relpath, cancel).map(|_| None)
        }
        TaskPayload::DedupeScan {
            side,
            mode,
            min_size_bytes,
        } => crate::dedupe::run_scan(core, task, cancel, *side, *mode, *min_size_bytes).map(Some),
    }
}

/// Exponential backoff between retries, sliced so stop requests and queue
/// pauses are not held up.
fn backoff(core: &Core, retry_count: u32) {
    let delay = BACKOFF_BASE
        .saturating_mul(1u32 << retry_count.min(8))
        .min(BACKOFF_CAP);
    let mut waited = Duration::ZERO;
    let slice = Duration::from_millis(100);
    while waited < delay {
        if core.stopping() {
            return;
        }
        thread::sleep(slice);
        waited += slice;
    }
}

// ── Delete ───────────────────────────────────────────────────────────

/// Remove a file; absence counts as success (idempotent). The cache row is
/// invalidated and the index entry dropped either way.
fn execute_delete(core: &Core, side: Side, relpath: &RelPath) -> Result<(), CoreError> {
    let path = join_guarded(core.config.root(side), relpath)?;
    match fs::remove_file(&path) {
        Ok(()) => log::info!("deleted {relpath} from {side}"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("delete {relpath} from {side}: already absent");
        }
        Err(e) => return Err(CoreError::from(e).with_path(&path)),
    }
    core.cache.invalidate(side, relpath)?;
    core.index.remove(side, relpath);
    Ok(())
}

// ── Hash file ────────────────────────────────────────────────────────

fn execute_hash_file(
    core: &Core,
    task: &Task,
    side: Side,
    relpath: &RelPath,
    cancel: &Arc<AtomicBool>,
) -> Result<(), CoreError> {
    let outcome = core.hashers.submit_and_wait(side, relpath, false, cancel)?;
    core.queue.store().update_size(task.id, outcome.size)?;
    core.queue.store().update_progress(task.id, outcome.size)?;
    // A source URL filed under the relpath fallback key can now move to its
    // hash key.
    if side == Side::Lake
        && let Ok(true) = core.sources.rekey_to_hash(relpath, &outcome.hash)
    {
        log::info!("source URL for {relpath} re-keyed to its digest");
    }
    Ok(())
}

// ── Verify ───────────────────────────────────────────────────────────

/// Force re-hash of the requested scope. Upgrades `probable_same` entries
/// through the cache/index write-back performed by the hash workers; a
/// digest disagreeing with a live cache row fails the task with
/// `HashMismatch`.
fn execute_verify(
    core: &Core,
    task: &Task,
    cancel: &Arc<AtomicBool>,
    side: Option<Side>,
    folder: Option<&str>,
    relpath: Option<&RelPath>,
) -> Result<(), CoreError> {
    let sides: Vec<Side> = match side {
        Some(s) => vec![s],
        None => vec![Side::Local, Side::Lake],
    };

    let mut candidates: Vec<(Side, RelPath)> = Vec::new();
    for s in sides {
        let snap = core.index.snapshot(s);
        match relpath {
            Some(rel) => {
                if snap.contains_key(rel) {
                    candidates.push((s, rel.clone()));
                }
            }
            None => {
                for key in snap.keys() {
                    if folder.is_none_or(|f| key.is_under(f)) {
                        candidates.push((s, key.clone()));
                    }
                }
            }
        }
    }

    if let Some(rel) = relpath
        && candidates.is_empty()
    {
        return Err(CoreError::NotFound {
            path: rel.as_str().to_string(),
        });
    }

    let total = candidates.len();
    core.queue.store().update_size(task.id, total as u64)?;

    for (current, (s, rel)) in candidates.into_iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled);
        }
        if let Some(folder) = folder {
            core.bus.publish(
                Topic::VerifyProgress,
                &VerifyProgress {
                    folder: folder.to_string(),
                    current: current + 1,
                    total,
                    relpath: rel.clone(),
                },
            );
        }

        match core.hashers.submit_and_wait(s, &rel, true, cancel) {
            Ok(_) => {}
            Err(CoreError::NotFound { .. }) if relpath.is_none() => {
                // Bulk scope tolerates files that vanished since the scan.
                log::warn!("verify: {rel} disappeared from {s}, skipping");
            }
            Err(e) => return Err(e),
        }

        core.queue.store().update_progress(task.id, (current + 1) as u64)?;
        core.bus.publish(
            Topic::QueueProgress,
            &QueueProgress {
                task_id: task.id,
                bytes_transferred: (current + 1) as u64,
                total_bytes: total as u64,
                progress_pct: if total > 0 {
                    (((current + 1) * 100) / total) as u8
                } else {
                    100
                },
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexEntry;
    use crate::index::mtime_ms;
    use crate::test_support::test_core;

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    fn not_cancelled() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn delete_is_idempotent_and_clears_state() {
        let (core, _dir) = test_core();
        let path = core.config.root(Side::Lake).join("doomed.bin");
        fs::write(&path, b"bytes").unwrap();
        let r = rel("doomed.bin");
        let stat = fs::metadata(&path).unwrap();
        core.cache
            .put(Side::Lake, &r, stat.len(), mtime_ms(&stat), "h")
            .unwrap();
        core.index.upsert(
            Side::Lake,
            IndexEntry {
                relpath: r.clone(),
                size: stat.len(),
                mtime_ms: mtime_ms(&stat),
                hash: Some("h".into()),
            },
        );

        execute_delete(&core, Side::Lake, &r).unwrap();
        assert!(!path.exists());
        assert!(core.index.get(Side::Lake, &r).is_none());
        assert_eq!(core.cache.get(Side::Lake, &r, stat.len(), mtime_ms(&stat)), None);

        // Second delete of an absent file still succeeds.
        execute_delete(&core, Side::Lake, &r).unwrap();
    }

    #[test]
    fn verify_single_relpath_upgrades_probable_same() {
        let (core, _dir) = test_core();
        let contents = b"identical bytes on both sides";
        fs::write(core.config.root(Side::Local).join("m.safetensors"), contents).unwrap();
        fs::write(core.config.root(Side::Lake).join("m.safetensors"), contents).unwrap();
        let r = rel("m.safetensors");
        for side in [Side::Local, Side::Lake] {
            let stat = fs::metadata(core.config.root(side).join("m.safetensors")).unwrap();
            core.index.upsert(
                side,
                IndexEntry {
                    relpath: r.clone(),
                    size: stat.len(),
                    mtime_ms: mtime_ms(&stat),
                    hash: None,
                },
            );
        }
        let local = core.index.get(Side::Local, &r);
        let lake = core.index.get(Side::Lake, &r);
        assert_eq!(
            crate::index::classify_pair(local.as_ref(), lake.as_ref()),
            crate::index::DiffStatus::ProbableSame
        );

        let task = core
            .queue
            .enqueue(TaskPayload::Verify {
                side: None,
                folder: None,
                relpath: Some(r.clone()),
            })
            .unwrap();
        execute_verify(&core, &task, &not_cancelled(), None, None, Some(&r)).unwrap();

        let local = core.index.get(Side::Local, &r);
        let lake = core.index.get(Side::Lake, &r);
        assert_eq!(
            crate::index::classify_pair(local.as_ref(), lake.as_ref()),
            crate::index::DiffStatus::Same
        );
    }

    #[test]
    fn verify_missing_explicit_relpath_fails() {
        let (core, _dir) = test_core();
        let r = rel("ghost.bin");
        let task = core
            .queue
            .enqueue(TaskPayload::Verify {
                side: None,
                folder: None,
                relpath: Some(r.clone()),
            })
            .unwrap();
        let err = execute_verify(&core, &task, &not_cancelled(), None, None, Some(&r)).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn verify_folder_emits_rolled_up_progress() {
        let (core, _dir) = test_core();
        let root = core.config.root(Side::Local);
        fs::create_dir_all(root.join("checkpoints")).unwrap();
        for name in ["checkpoints/a.bin", "checkpoints/b.bin"] {
            let p = root.join(name);
            fs::write(&p, name.as_bytes()).unwrap();
            let stat = fs::metadata(&p).unwrap();
            core.index.upsert(
                Side::Local,
                IndexEntry {
                    relpath: rel(name),
                    size: stat.len(),
                    mtime_ms: mtime_ms(&stat),
                    hash: None,
                },
            );
        }

        let mut rx = core.bus.subscribe();
        let task = core
            .queue
            .enqueue(TaskPayload::Verify {
                side: Some(Side::Local),
                folder: Some("checkpoints".into()),
                relpath: None,
            })
            .unwrap();
        execute_verify(
            &core,
            &task,
            &not_cancelled(),
            Some(Side::Local),
            Some("checkpoints"),
            None,
        )
        .unwrap();

        let mut verify_events = 0;
        while let Ok(ev) = rx.try_recv() {
            if ev.topic == Topic::VerifyProgress {
                verify_events += 1;
                assert_eq!(ev.data["folder"], "checkpoints");
                assert_eq!(ev.data["total"], 2);
            }
        }
        assert_eq!(verify_events, 2);
    }
}
