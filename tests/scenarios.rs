//! End-to-end scenarios exercising the core through the queue executor:
//! enqueue → claim → execute → index/cache updates → events.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lakesync::Core;
use lakesync::config::{Config, Side, SideConfig};
use lakesync::dedupe::KeepSelection;
use lakesync::index::{DiffStatus, compute_diff, scan_side};
use lakesync::mirror::{execute_plan, plan_mirror};
use lakesync::paths::RelPath;
use lakesync::queue::{DedupeMode, TaskPayload, TaskStatus};

struct Harness {
    core: Arc<Core>,
    executor: Option<std::thread::JoinHandle<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn start() -> Harness {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = Config {
            local: SideConfig {
                root: dir.path().join("local"),
                allow_delete_from_sync: false,
            },
            lake: SideConfig {
                root: dir.path().join("lake"),
                allow_delete_from_sync: true,
            },
            queue_concurrency: 1,
            queue_retry_count: 3,
            hash_workers: 2,
            app_data_dir: dir.path().join("data"),
            host: "127.0.0.1".into(),
            port: 0,
        };
        fs::create_dir_all(&config.local.root).unwrap();
        fs::create_dir_all(&config.lake.root).unwrap();
        let core = Core::open(config).expect("core open");
        let executor = core.start_executor();
        Harness {
            core,
            executor: Some(executor),
            _dir: dir,
        }
    }

    fn root(&self, side: Side) -> std::path::PathBuf {
        self.core.config.root(side).to_path_buf()
    }

    fn write(&self, side: Side, relpath: &str, contents: &[u8]) {
        let path = self.root(side).join(relpath);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn scan(&self, side: Side) {
        scan_side(&self.core.config, side, &self.core.cache, &self.core.index, &self.core.bus)
            .expect("scan");
    }

    fn wait_terminal(&self, task_id: i64) -> TaskStatus {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let task = self
                .core
                .queue
                .store()
                .get(task_id)
                .expect("store get")
                .expect("task exists");
            if task.status.is_terminal() {
                return task.status;
            }
            assert!(Instant::now() < deadline, "task {task_id} did not finish in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn diff(&self) -> Vec<lakesync::index::DiffEntry> {
        compute_diff(
            &self.core.index.snapshot(Side::Local),
            &self.core.index.snapshot(Side::Lake),
            None,
            None,
        )
    }

    fn assert_no_part_files(&self) {
        for side in [Side::Local, Side::Lake] {
            assert_no_part_under(&self.root(side));
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.core.request_stop();
        if let Some(handle) = self.executor.take() {
            let _ = handle.join();
        }
    }
}

fn assert_no_part_under(dir: &Path) {
    for entry in fs::read_dir(dir).unwrap().flatten() {
        let path = entry.path();
        if path.is_dir() {
            assert_no_part_under(&path);
        } else {
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            assert!(!name.ends_with(".part"), "stray staging file {}", path.display());
        }
    }
}

fn rel(s: &str) -> RelPath {
    RelPath::new(s).unwrap()
}

#[test]
fn only_local_copy_becomes_same() {
    let h = Harness::start();
    h.write(Side::Local, "checkpoints/a.safetensors", &[7u8; 1024]);
    h.scan(Side::Local);
    h.scan(Side::Lake);

    let task = h
        .core
        .queue
        .enqueue_copy(
            &h.core.config,
            Side::Local,
            rel("checkpoints/a.safetensors"),
            Side::Lake,
            None,
        )
        .unwrap();
    assert_eq!(task.size_bytes, Some(1024));
    assert_eq!(h.wait_terminal(task.id), TaskStatus::Completed);

    let dst = h.root(Side::Lake).join("checkpoints/a.safetensors");
    assert_eq!(fs::metadata(&dst).unwrap().len(), 1024);

    let diff = h.diff();
    assert_eq!(diff.len(), 1);
    assert_eq!(diff[0].status, DiffStatus::Same);
    assert_eq!(diff[0].local_hash, diff[0].lake_hash);

    // mtime preserved within filesystem resolution.
    let src_mtime = diff[0].local_mtime_ms.unwrap();
    let dst_mtime = diff[0].lake_mtime_ms.unwrap();
    assert!((src_mtime - dst_mtime).abs() < 1000);
    h.assert_no_part_files();
}

#[test]
fn conflicting_copy_is_refused() {
    let h = Harness::start();
    h.write(Side::Local, "x.bin", b"local contents A");
    h.write(Side::Lake, "x.bin", b"lake contents BB");
    h.scan(Side::Local);
    h.scan(Side::Lake);

    // Hash both sides so the conflict is confirmed.
    let verify = h
        .core
        .queue
        .enqueue(TaskPayload::Verify {
            side: None,
            folder: None,
            relpath: Some(rel("x.bin")),
        })
        .unwrap();
    assert_eq!(h.wait_terminal(verify.id), TaskStatus::Completed);
    assert_eq!(h.diff()[0].status, DiffStatus::Conflict);

    let copy = h
        .core
        .queue
        .enqueue_copy(&h.core.config, Side::Local, rel("x.bin"), Side::Lake, None)
        .unwrap();
    assert_eq!(h.wait_terminal(copy.id), TaskStatus::Failed);
    let stored = h.core.queue.store().get(copy.id).unwrap().unwrap();
    assert!(stored.error.unwrap().contains("conflict"));

    // Destination bytes untouched, no staging leftovers.
    assert_eq!(
        fs::read(h.root(Side::Lake).join("x.bin")).unwrap(),
        b"lake contents BB"
    );
    h.assert_no_part_files();
}

#[test]
fn additive_mirror_then_verify_all_same() {
    let h = Harness::start();
    h.write(Side::Lake, "models/A.bin", b"alpha contents");
    h.write(Side::Lake, "models/B.bin", b"bravo contents!");
    h.write(Side::Lake, "models/C.bin", b"charlie contents");
    h.write(Side::Local, "models/A.bin", b"alpha contents");
    h.scan(Side::Local);
    h.scan(Side::Lake);

    let plan = plan_mirror(
        &h.core.index.snapshot(Side::Local),
        &h.core.index.snapshot(Side::Lake),
        Side::Lake,
        "models",
        Side::Local,
        None,
        h.core.config.allow_delete_from_sync(Side::Local),
    )
    .unwrap();
    assert_eq!(plan.copy.len(), 2);
    assert!(plan.delete.is_empty());
    assert!(plan.extras.is_empty());
    assert!(plan.conflicts.is_empty());

    let task_ids = execute_plan(&h.core, &plan, false).unwrap();
    assert_eq!(task_ids.len(), 2);
    for id in &task_ids {
        assert_eq!(h.wait_terminal(*id), TaskStatus::Completed);
    }

    // B and C were hashed during the copy; A needs a verify to upgrade.
    let verify = h
        .core
        .queue
        .enqueue(TaskPayload::Verify {
            side: None,
            folder: Some("models".into()),
            relpath: None,
        })
        .unwrap();
    assert_eq!(h.wait_terminal(verify.id), TaskStatus::Completed);

    let diff = h.diff();
    assert_eq!(diff.len(), 3);
    for entry in &diff {
        assert_eq!(entry.status, DiffStatus::Same, "{} not same", entry.relpath);
    }
    h.assert_no_part_files();
}

#[test]
fn dedupe_scan_and_execute_frees_duplicates() {
    let h = Harness::start();
    let payload = b"identical model payload bytes";
    h.write(Side::Local, "d/1", payload);
    h.write(Side::Local, "d/2", payload);
    h.write(Side::Local, "e/3", payload);
    h.write(Side::Local, "unique.bin", b"one of a kind");
    h.scan(Side::Local);

    let scan = h
        .core
        .queue
        .enqueue(TaskPayload::DedupeScan {
            side: Side::Local,
            mode: DedupeMode::Full,
            min_size_bytes: 0,
        })
        .unwrap();
    assert_eq!(h.wait_terminal(scan.id), TaskStatus::Completed);

    let summary = h.core.dedupe.latest_scan().unwrap().unwrap();
    assert_eq!(summary.duplicate_groups, 1);
    assert_eq!(summary.duplicate_files, 3);
    assert_eq!(summary.total_bytes_redundant, 2 * payload.len() as u64);

    let groups = h.core.dedupe.groups_for_scan(&summary.scan_id).unwrap();
    assert_eq!(groups[0].files.len(), 3);

    // allow_delete_from_sync is false on Local; dedupe ignores it.
    let report = lakesync::dedupe::execute_selections(
        &h.core,
        &summary.scan_id,
        &[KeepSelection {
            group_id: groups[0].id,
            keep_relpath: rel("d/1"),
        }],
    )
    .unwrap();
    assert_eq!(report.deleted, 2);
    assert_eq!(report.freed_bytes, 2 * payload.len() as u64);
    assert!(report.skipped.is_empty());

    // Wait for the enqueued deletes to run.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let tasks = h.core.queue.store().list().unwrap();
        let deletes: Vec<_> = tasks.iter().filter(|t| t.task_type == "delete").collect();
        if deletes.len() == 2 && deletes.iter().all(|t| t.status == TaskStatus::Completed) {
            break;
        }
        assert!(Instant::now() < deadline, "deletes did not finish");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(h.root(Side::Local).join("d/1").exists());
    assert!(!h.root(Side::Local).join("d/2").exists());
    assert!(!h.root(Side::Local).join("e/3").exists());
    assert!(h.root(Side::Local).join("unique.bin").exists());

    // Index reflects the deletions without a re-scan.
    assert!(h.core.index.get(Side::Local, &rel("d/2")).is_none());
    assert!(h.core.index.get(Side::Local, &rel("e/3")).is_none());

    // A second scan over the deduplicated side finds nothing.
    let rescan = h
        .core
        .queue
        .enqueue(TaskPayload::DedupeScan {
            side: Side::Local,
            mode: DedupeMode::Full,
            min_size_bytes: 0,
        })
        .unwrap();
    assert_eq!(h.wait_terminal(rescan.id), TaskStatus::Completed);
    let summary = h.core.dedupe.latest_scan().unwrap().unwrap();
    assert_eq!(summary.duplicate_groups, 0);
}

#[test]
fn verify_upgrades_probable_same() {
    let h = Harness::start();
    let contents = b"same bytes, never hashed";
    h.write(Side::Local, "m.safetensors", contents);
    h.write(Side::Lake, "m.safetensors", contents);
    h.scan(Side::Local);
    h.scan(Side::Lake);

    assert_eq!(h.diff()[0].status, DiffStatus::ProbableSame);

    let verify = h
        .core
        .queue
        .enqueue(TaskPayload::Verify {
            side: None,
            folder: None,
            relpath: Some(rel("m.safetensors")),
        })
        .unwrap();
    assert_eq!(h.wait_terminal(verify.id), TaskStatus::Completed);

    let diff = h.diff();
    assert_eq!(diff[0].status, DiffStatus::Same);

    // Both sides' cache rows hold the digest at live coordinates.
    for side in [Side::Local, Side::Lake] {
        let entry = h.core.index.get(side, &rel("m.safetensors")).unwrap();
        assert_eq!(
            h.core
                .cache
                .get(side, &rel("m.safetensors"), entry.size, entry.mtime_ms)
                .as_deref(),
            Some(blake3::hash(contents).to_hex().to_string().as_str())
        );
    }
}

#[test]
fn round_trip_copy_preserves_bytes_and_hash() {
    let h = Harness::start();
    let contents: Vec<u8> = (0..4096u32).flat_map(|i| i.to_le_bytes()).collect();
    h.write(Side::Local, "rt.bin", &contents);
    h.scan(Side::Local);
    h.scan(Side::Lake);

    // Local -> Lake
    let first = h
        .core
        .queue
        .enqueue_copy(&h.core.config, Side::Local, rel("rt.bin"), Side::Lake, None)
        .unwrap();
    assert_eq!(h.wait_terminal(first.id), TaskStatus::Completed);
    let original_hash = h.core.index.get(Side::Lake, &rel("rt.bin")).unwrap().hash.unwrap();

    // Delete the Local copy (Lake->Local restore target must be absent),
    // then copy back.
    fs::remove_file(h.root(Side::Local).join("rt.bin")).unwrap();
    h.core.index.remove(Side::Local, &rel("rt.bin"));
    h.core.cache.invalidate(Side::Local, &rel("rt.bin")).unwrap();

    let back = h
        .core
        .queue
        .enqueue_copy(&h.core.config, Side::Lake, rel("rt.bin"), Side::Local, None)
        .unwrap();
    assert_eq!(h.wait_terminal(back.id), TaskStatus::Completed);

    assert_eq!(fs::read(h.root(Side::Local).join("rt.bin")).unwrap(), contents);
    let restored_hash = h.core.index.get(Side::Local, &rel("rt.bin")).unwrap().hash.unwrap();
    assert_eq!(restored_hash, original_hash);
    h.assert_no_part_files();
}

#[test]
fn tasks_run_in_fifo_order() {
    let h = Harness::start();
    // Pause so all three tasks queue up before any runs.
    h.core.queue.pause();
    for name in ["f1.bin", "f2.bin", "f3.bin"] {
        h.write(Side::Local, name, name.as_bytes());
    }
    h.scan(Side::Local);

    let ids: Vec<i64> = ["f1.bin", "f2.bin", "f3.bin"]
        .iter()
        .map(|name| {
            h.core
                .queue
                .enqueue_copy(&h.core.config, Side::Local, rel(name), Side::Lake, None)
                .unwrap()
                .id
        })
        .collect();
    h.core.queue.resume();

    for id in &ids {
        assert_eq!(h.wait_terminal(*id), TaskStatus::Completed);
    }
    let tasks = h.core.queue.store().list().unwrap();
    let mut started: Vec<(i64, chrono::DateTime<chrono::Utc>)> = tasks
        .iter()
        .filter(|t| t.task_type == "copy")
        .map(|t| (t.id, t.started_at.unwrap()))
        .collect();
    started.sort_by_key(|(_, at)| *at);
    let order: Vec<i64> = started.into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, ids, "copies started in enqueue order");
}

#[test]
fn cancelled_pending_task_never_runs() {
    let h = Harness::start();
    h.core.queue.pause();
    h.write(Side::Local, "never.bin", b"should not be copied");
    h.scan(Side::Local);

    let task = h
        .core
        .queue
        .enqueue_copy(&h.core.config, Side::Local, rel("never.bin"), Side::Lake, None)
        .unwrap();
    h.core.queue.cancel(task.id).unwrap();
    h.core.queue.resume();

    assert_eq!(h.wait_terminal(task.id), TaskStatus::Cancelled);
    // Give the executor a beat to (incorrectly) pick it up if it were going to.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!h.root(Side::Lake).join("never.bin").exists());
    let stored = h.core.queue.store().get(task.id).unwrap().unwrap();
    assert!(stored.started_at.is_none(), "cancelled task was never claimed");
}

#[test]
fn policy_denied_delete_never_reaches_the_queue() {
    let h = Harness::start();
    h.write(Side::Local, "keep.bin", b"protected");
    let err = h
        .core
        .queue
        .enqueue_delete(&h.core.config, Side::Local, rel("keep.bin"), false)
        .unwrap_err();
    assert!(matches!(err, lakesync::error::CoreError::PolicyDenied { .. }));
    assert!(h.core.queue.store().list().unwrap().is_empty());
}
