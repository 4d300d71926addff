//! Persistent task queue: the system's spine.
//!
//! `QueueService` wraps the durable store with the runtime pieces the
//! executor needs: the pause flag, per-task cancellation handles, and a
//! wakeup signal so enqueues are picked up promptly.

mod copy;
mod executor;
mod store;
mod task;

pub use executor::spawn_executor;
pub use store::QueueStore;
pub use task::{DedupeMode, Task, TaskPayload, TaskStatus};

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Duration;

use crate::config::{Config, Side};
use crate::error::CoreError;
use crate::paths::{RelPath, join_guarded};

/// Outcome of a cancel request, for API reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Pending task flipped straight to `cancelled`.
    CancelledPending,
    /// Running task signalled; it will stop at the next chunk boundary.
    SignalledRunning,
    /// Task already terminal; cancellation is idempotent.
    AlreadyFinished(TaskStatus),
    NotFound,
}

/// Shared queue handle: one instance per app-data directory.
pub struct QueueService {
    store: QueueStore,
    paused: AtomicBool,
    cancels: RwLock<HashMap<i64, Arc<AtomicBool>>>,
    wake_lock: Mutex<bool>,
    wake_cond: Condvar,
}

impl QueueService {
    pub fn open(db_path: &Path) -> Result<QueueService, CoreError> {
        Ok(QueueService {
            store: QueueStore::open(db_path)?,
            paused: AtomicBool::new(false),
            cancels: RwLock::new(HashMap::new()),
            wake_lock: Mutex::new(false),
            wake_cond: Condvar::new(),
        })
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    // ── Enqueue ──────────────────────────────────────────────────────

    /// Enqueue a copy between sides. The payload is validated here; the
    /// conflict check happens at execution time against the then-current
    /// diff status.
    pub fn enqueue_copy(
        &self,
        config: &Config,
        src_side: Side,
        src_relpath: RelPath,
        dst_side: Side,
        dst_relpath: Option<RelPath>,
    ) -> Result<Task, CoreError> {
        if src_side == dst_side {
            return Err(CoreError::Invalid {
                message: "copy requires two different sides".into(),
            });
        }
        let dst_relpath = dst_relpath.unwrap_or_else(|| src_relpath.clone());
        let src_path = join_guarded(config.root(src_side), &src_relpath)?;
        join_guarded(config.root(dst_side), &dst_relpath)?;
        let size_bytes = std::fs::metadata(&src_path).ok().map(|m| m.len());

        let task = self.store.enqueue(
            &TaskPayload::Copy {
                src_side,
                src_relpath,
                dst_side,
                dst_relpath,
            },
            size_bytes,
        )?;
        self.wake();
        Ok(task)
    }

    /// Enqueue a delete. Sync-path deletes are policy-gated here, so a
    /// denied task never exists, let alone runs. Dedupe passes
    /// `from_dedupe` to bypass the gate by contract.
    pub fn enqueue_delete(
        &self,
        config: &Config,
        side: Side,
        relpath: RelPath,
        from_dedupe: bool,
    ) -> Result<Task, CoreError> {
        if !from_dedupe && !config.allow_delete_from_sync(side) {
            return Err(CoreError::PolicyDenied {
                side,
                relpath: relpath.as_str().to_string(),
            });
        }
        let path = join_guarded(config.root(side), &relpath)?;
        let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());

        let task = self.store.enqueue(
            &TaskPayload::Delete {
                side,
                relpath,
                from_dedupe,
            },
            size_bytes,
        )?;
        self.wake();
        Ok(task)
    }

    /// Enqueue any other task type (verify, hash_file, dedupe_scan).
    pub fn enqueue(&self, payload: TaskPayload) -> Result<Task, CoreError> {
        let task = self.store.enqueue(&payload, None)?;
        self.wake();
        Ok(task)
    }

    // ── Pause / resume ───────────────────────────────────────────────

    /// A paused queue stops claiming new tasks; the running one finishes.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        log::info!("queue paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        log::info!("queue resumed");
        self.wake();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    // ── Cancellation ─────────────────────────────────────────────────

    /// Cancel one task. Idempotent: re-cancelling a finished task reports
    /// its terminal status.
    pub fn cancel(&self, id: i64) -> Result<CancelOutcome, CoreError> {
        if self.store.cancel_pending(id)? {
            return Ok(CancelOutcome::CancelledPending);
        }
        match self.store.get(id)? {
            Some(task) if task.status == TaskStatus::Running => {
                self.signal_cancel(id);
                Ok(CancelOutcome::SignalledRunning)
            }
            Some(task) if task.status.is_terminal() => {
                Ok(CancelOutcome::AlreadyFinished(task.status))
            }
            Some(_) => Ok(CancelOutcome::CancelledPending),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    /// Cancel everything: pending rows directly, the running task via its
    /// handle.
    pub fn cancel_all(&self) -> Result<usize, CoreError> {
        let n = self.store.cancel_all_pending()?;
        let ids: Vec<i64> = match self.cancels.read() {
            Ok(map) => map.keys().copied().collect(),
            Err(p) => p.into_inner().keys().copied().collect(),
        };
        for id in &ids {
            self.signal_cancel(*id);
        }
        Ok(n + ids.len())
    }

    fn signal_cancel(&self, id: i64) {
        let map = match self.cancels.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(flag) = map.get(&id) {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Executor-side: register a fresh cancellation handle for a claimed task.
    pub(crate) fn register_cancel(&self, id: i64) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut map = match self.cancels.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        map.insert(id, Arc::clone(&flag));
        flag
    }

    pub(crate) fn unregister_cancel(&self, id: i64) {
        let mut map = match self.cancels.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        map.remove(&id);
    }

    // ── Executor wakeup ──────────────────────────────────────────────

    fn wake(&self) {
        let Ok(mut flag) = self.wake_lock.lock() else {
            return;
        };
        *flag = true;
        self.wake_cond.notify_all();
    }

    /// Block until woken or `timeout` elapses. The executor also polls so a
    /// missed wakeup only costs one interval.
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let Ok(mut flag) = self.wake_lock.lock() else {
            std::thread::sleep(timeout);
            return;
        };
        if !*flag {
            let (guard, _timeout) = match self.wake_cond.wait_timeout(flag, timeout) {
                Ok(r) => r,
                Err(p) => {
                    drop(p);
                    return;
                }
            };
            flag = guard;
        }
        *flag = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideConfig;

    fn fixture() -> (tempfile::TempDir, Config, QueueService) {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let lake = dir.path().join("lake");
        for p in [&local, &lake] {
            std::fs::create_dir_all(p).unwrap();
        }
        let config = Config {
            local: SideConfig {
                root: local,
                allow_delete_from_sync: false,
            },
            lake: SideConfig {
                root: lake,
                allow_delete_from_sync: true,
            },
            queue_concurrency: 1,
            queue_retry_count: 3,
            hash_workers: 1,
            app_data_dir: dir.path().join("data"),
            host: "127.0.0.1".into(),
            port: 0,
        };
        std::fs::create_dir_all(&config.app_data_dir).unwrap();
        let queue = QueueService::open(&config.queue_db_path()).unwrap();
        (dir, config, queue)
    }

    fn rel(s: &str) -> RelPath {
        RelPath::new(s).unwrap()
    }

    #[test]
    fn copy_to_same_side_is_rejected() {
        let (_dir, config, queue) = fixture();
        let err = queue
            .enqueue_copy(&config, Side::Local, rel("a.bin"), Side::Local, None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Invalid { .. }));
    }

    #[test]
    fn copy_records_source_size() {
        let (_dir, config, queue) = fixture();
        std::fs::write(config.root(Side::Local).join("a.bin"), vec![0u8; 1024]).unwrap();
        let task = queue
            .enqueue_copy(&config, Side::Local, rel("a.bin"), Side::Lake, None)
            .unwrap();
        assert_eq!(task.size_bytes, Some(1024));
        assert_eq!(task.task_type, "copy");
    }

    #[test]
    fn sync_delete_respects_policy_per_side() {
        let (_dir, config, queue) = fixture();
        // Local forbids sync deletes.
        let err = queue
            .enqueue_delete(&config, Side::Local, rel("a.bin"), false)
            .unwrap_err();
        assert!(matches!(err, CoreError::PolicyDenied { side: Side::Local, .. }));

        // Lake allows them.
        assert!(queue.enqueue_delete(&config, Side::Lake, rel("a.bin"), false).is_ok());

        // Dedupe bypasses the gate everywhere.
        assert!(queue.enqueue_delete(&config, Side::Local, rel("a.bin"), true).is_ok());
    }

    #[test]
    fn cancel_is_idempotent_across_states() {
        let (_dir, config, queue) = fixture();
        std::fs::write(config.root(Side::Local).join("a.bin"), b"x").unwrap();
        let task = queue
            .enqueue_copy(&config, Side::Local, rel("a.bin"), Side::Lake, None)
            .unwrap();

        assert_eq!(queue.cancel(task.id).unwrap(), CancelOutcome::CancelledPending);
        assert_eq!(
            queue.cancel(task.id).unwrap(),
            CancelOutcome::AlreadyFinished(TaskStatus::Cancelled)
        );
        assert_eq!(queue.cancel(99_999).unwrap(), CancelOutcome::NotFound);
    }

    #[test]
    fn pause_resume_toggles_flag() {
        let (_dir, _config, queue) = fixture();
        assert!(!queue.is_paused());
        queue.pause();
        assert!(queue.is_paused());
        queue.resume();
        assert!(!queue.is_paused());
    }

    #[test]
    fn running_cancel_signals_registered_flag() {
        let (_dir, config, queue) = fixture();
        std::fs::write(config.root(Side::Local).join("a.bin"), b"x").unwrap();
        let task = queue
            .enqueue_copy(&config, Side::Local, rel("a.bin"), Side::Lake, None)
            .unwrap();
        queue.store().claim_next().unwrap().unwrap();
        let flag = queue.register_cancel(task.id);

        assert_eq!(queue.cancel(task.id).unwrap(), CancelOutcome::SignalledRunning);
        assert!(flag.load(Ordering::Relaxed));
        queue.unregister_cancel(task.id);
    }
}
