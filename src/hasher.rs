//! Streaming BLAKE3 hashing and the bounded hash worker pool.
//!
//! Files are hashed in 1 MiB chunks with a cancellation check between
//! chunks. A final re-stat detects files mutated mid-hash (`HashRaced`).
//! The pool runs on its own threads so hashing never blocks the transfer
//! worker; callers submit jobs and may wait for the outcome.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use std::io::Read;

use crate::cache::HashCache;
use crate::config::{Config, Side};
use crate::error::CoreError;
use crate::events::{EventBus, HashProgress, Topic};
use crate::index::{IndexStore, mtime_ms};
use crate::paths::{RelPath, join_guarded};

/// Chunk size for streaming hash and copy loops (1 MiB): large enough for
/// I/O efficiency, small enough for prompt cancellation.
pub const CHUNK_SIZE: usize = 1024 * 1024;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Digest plus the stat coordinates it was computed against.
#[derive(Debug, Clone)]
pub struct HashOutcome {
    pub hash: String,
    pub size: u64,
    pub mtime_ms: i64,
}

/// Stream a file through BLAKE3.
///
/// `on_progress` is called after every chunk with `(bytes_hashed, total)`.
/// If the file's size or mtime changed between open and completion the
/// result is discarded and `HashRaced` returned (retryable).
pub fn hash_file(
    path: &Path,
    cancel: &Arc<AtomicBool>,
    mut on_progress: impl FnMut(u64, u64),
) -> Result<HashOutcome, CoreError> {
    let opening_stat = fs::metadata(path).map_err(|e| CoreError::from(e).with_path(path))?;
    let total = opening_stat.len();
    let opening_mtime = mtime_ms(&opening_stat);

    let mut file = fs::File::open(path).map_err(|e| CoreError::from(e).with_path(path))?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes_hashed = 0u64;

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(CoreError::Cancelled);
        }
        let n = file
            .read(&mut buffer)
            .map_err(|e| CoreError::from(e).with_path(path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        bytes_hashed += n as u64;
        on_progress(bytes_hashed, total);
    }

    let closing_stat = fs::metadata(path).map_err(|e| CoreError::from(e).with_path(path))?;
    if closing_stat.len() != total || mtime_ms(&closing_stat) != opening_mtime {
        return Err(CoreError::HashRaced {
            relpath: path.display().to_string(),
        });
    }

    Ok(HashOutcome {
        hash: hasher.finalize().to_hex().to_string(),
        size: total,
        mtime_ms: opening_mtime,
    })
}

// ── Worker pool ──────────────────────────────────────────────────────

/// A unit of hash work.
pub struct HashJob {
    pub side: Side,
    pub relpath: RelPath,
    /// Skip the cache read and recompute; disagreements with a live cache
    /// row fail with `HashMismatch` (verify semantics).
    pub force: bool,
    pub cancel: Arc<AtomicBool>,
    /// Optional reply channel for callers that wait on the outcome.
    pub reply: Option<mpsc::Sender<Result<HashOutcome, CoreError>>>,
}

/// Bounded pool of hash workers consuming `HashJob`s.
pub struct HashPool {
    tx: Mutex<Option<mpsc::Sender<HashJob>>>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl HashPool {
    pub fn spawn(
        workers: u32,
        config: Arc<Config>,
        cache: Arc<HashCache>,
        index: Arc<IndexStore>,
        bus: Arc<EventBus>,
    ) -> HashPool {
        let (tx, rx) = mpsc::channel::<HashJob>();
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::new();
        for i in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let config = Arc::clone(&config);
            let cache = Arc::clone(&cache);
            let index = Arc::clone(&index);
            let bus = Arc::clone(&bus);
            let handle = thread::Builder::new()
                .name(format!("hash-worker-{i}"))
                .spawn(move || worker_loop(rx, config, cache, index, bus))
                .expect("failed to spawn hash worker");
            handles.push(handle);
        }
        HashPool {
            tx: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
        }
    }

    /// Submit a job without waiting for its outcome.
    pub fn submit(&self, job: HashJob) -> Result<(), CoreError> {
        let guard = match self.tx.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| CoreError::Storage {
                message: "hash pool has shut down".into(),
            }),
            None => Err(CoreError::Storage {
                message: "hash pool has shut down".into(),
            }),
        }
    }

    /// Submit a job and block until a worker has processed it.
    pub fn submit_and_wait(
        &self,
        side: Side,
        relpath: &RelPath,
        force: bool,
        cancel: &Arc<AtomicBool>,
    ) -> Result<HashOutcome, CoreError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.submit(HashJob {
            side,
            relpath: relpath.clone(),
            force,
            cancel: Arc::clone(cancel),
            reply: Some(reply_tx),
        })?;
        reply_rx.recv().map_err(|_| CoreError::Storage {
            message: "hash worker dropped its reply".into(),
        })?
    }

    /// Close the job channel and join all workers (used on orderly shutdown).
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        let handles = match self.handles.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(p) => std::mem::take(&mut *p.into_inner()),
        };
        for handle in handles {
            if let Err(e) = handle.join() {
                log::warn!("hash worker panicked on shutdown: {e:?}");
            }
        }
    }
}

fn worker_loop(
    rx: Arc<Mutex<mpsc::Receiver<HashJob>>>,
    config: Arc<Config>,
    cache: Arc<HashCache>,
    index: Arc<IndexStore>,
    bus: Arc<EventBus>,
) {
    loop {
        let job = {
            let guard = match rx.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            guard.recv()
        };
        let Ok(job) = job else {
            return; // channel closed
        };
        let result = process_job(&job, &config, &cache, &index, &bus);
        if let Err(e) = &result
            && !matches!(e, CoreError::Cancelled)
        {
            log::warn!("hash {}:{} failed: {e}", job.side, job.relpath);
        }
        if let Some(reply) = &job.reply {
            let _ = reply.send(result);
        }
    }
}

/// Hash one file: cache short-circuit on matching stat coordinates, then
/// streaming digest with progress events and cache/index write-back.
fn process_job(
    job: &HashJob,
    config: &Config,
    cache: &HashCache,
    index: &IndexStore,
    bus: &EventBus,
) -> Result<HashOutcome, CoreError> {
    let path = join_guarded(config.root(job.side), &job.relpath)?;
    let stat = fs::metadata(&path).map_err(|e| CoreError::from(e).with_path(&path))?;
    let size = stat.len();
    let mtime = mtime_ms(&stat);

    if !job.force
        && let Some(hash) = cache.get(job.side, &job.relpath, size, mtime)
    {
        index.set_hash(job.side, &job.relpath, &hash);
        bus.publish(
            Topic::HashProgress,
            &HashProgress {
                side: job.side,
                relpath: job.relpath.clone(),
                bytes_hashed: size,
                total_bytes: size,
            },
        );
        return Ok(HashOutcome {
            hash,
            size,
            mtime_ms: mtime,
        });
    }

    let mut last_progress = Instant::now();
    let outcome = hash_file(&path, &job.cancel, |bytes_hashed, total_bytes| {
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            bus.publish(
                Topic::HashProgress,
                &HashProgress {
                    side: job.side,
                    relpath: job.relpath.clone(),
                    bytes_hashed,
                    total_bytes,
                },
            );
            last_progress = Instant::now();
        }
    })?;

    if job.force
        && let Some(row) = cache.get_row(job.side, &job.relpath)
        && row.size == outcome.size
        && row.mtime_ms == outcome.mtime_ms
        && row.hash != outcome.hash
    {
        cache.invalidate(job.side, &job.relpath)?;
        return Err(CoreError::HashMismatch {
            relpath: job.relpath.as_str().to_string(),
            expected: row.hash,
            actual: outcome.hash,
        });
    }

    cache.put(job.side, &job.relpath, outcome.size, outcome.mtime_ms, &outcome.hash)?;
    index.set_hash(job.side, &job.relpath, &outcome.hash);
    bus.publish(
        Topic::HashProgress,
        &HashProgress {
            side: job.side,
            relpath: job.relpath.clone(),
            bytes_hashed: outcome.size,
            total_bytes: outcome.size,
        },
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideConfig;
    use crate::index::IndexEntry;

    fn not_cancelled() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn digest_matches_single_shot_blake3() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let contents = vec![7u8; CHUNK_SIZE * 2 + 123];
        fs::write(&path, &contents).unwrap();

        let outcome = hash_file(&path, &not_cancelled(), |_, _| {}).unwrap();
        assert_eq!(outcome.hash, blake3::hash(&contents).to_hex().to_string());
        assert_eq!(outcome.size, contents.len() as u64);
    }

    #[test]
    fn empty_file_hashes_to_empty_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();

        let outcome = hash_file(&path, &not_cancelled(), |_, _| {}).unwrap();
        assert_eq!(outcome.hash, blake3::hash(b"").to_hex().to_string());
        assert_eq!(outcome.size, 0);
    }

    #[test]
    fn progress_callback_reports_monotonic_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, vec![1u8; CHUNK_SIZE * 3]).unwrap();

        let mut seen = Vec::new();
        hash_file(&path, &not_cancelled(), |done, total| {
            assert_eq!(total, (CHUNK_SIZE * 3) as u64);
            seen.push(done);
        })
        .unwrap();
        assert!(seen.len() >= 3);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), (CHUNK_SIZE * 3) as u64);
    }

    #[test]
    fn pre_cancelled_flag_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, vec![1u8; CHUNK_SIZE + 1]).unwrap();

        let cancel = Arc::new(AtomicBool::new(true));
        let err = hash_file(&path, &cancel, |_, _| {}).unwrap_err();
        assert_eq!(err, CoreError::Cancelled);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = hash_file(&dir.path().join("nope.bin"), &not_cancelled(), |_, _| {}).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    // ── Pool tests ───────────────────────────────────────────────────

    fn pool_fixture() -> (tempfile::TempDir, Arc<Config>, Arc<HashCache>, Arc<IndexStore>, Arc<EventBus>) {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let lake = dir.path().join("lake");
        let data = dir.path().join("data");
        for p in [&local, &lake, &data] {
            fs::create_dir_all(p).unwrap();
        }
        let config = Arc::new(Config {
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
            hash_workers: 2,
            app_data_dir: data,
            host: "127.0.0.1".into(),
            port: 0,
        });
        let cache = Arc::new(HashCache::open(&config.hash_cache_db_path()).unwrap());
        (dir, config, cache, Arc::new(IndexStore::new()), Arc::new(EventBus::new()))
    }

    #[test]
    fn pool_hashes_and_updates_cache_and_index() {
        let (_dir, config, cache, index, bus) = pool_fixture();
        let contents = b"model weights";
        fs::write(config.root(Side::Local).join("m.bin"), contents).unwrap();
        let rel = RelPath::new("m.bin").unwrap();
        let stat = fs::metadata(config.root(Side::Local).join("m.bin")).unwrap();
        index.upsert(
            Side::Local,
            IndexEntry {
                relpath: rel.clone(),
                size: stat.len(),
                mtime_ms: mtime_ms(&stat),
                hash: None,
            },
        );

        let pool = HashPool::spawn(2, Arc::clone(&config), Arc::clone(&cache), Arc::clone(&index), bus);
        let outcome = pool
            .submit_and_wait(Side::Local, &rel, false, &not_cancelled())
            .unwrap();
        assert_eq!(outcome.hash, blake3::hash(contents).to_hex().to_string());

        assert_eq!(
            cache.get(Side::Local, &rel, outcome.size, outcome.mtime_ms).as_deref(),
            Some(outcome.hash.as_str())
        );
        assert_eq!(index.get(Side::Local, &rel).unwrap().hash, Some(outcome.hash.clone()));
        pool.shutdown();
    }

    #[test]
    fn pool_serves_cache_hit_without_rereading() {
        let (_dir, config, cache, index, bus) = pool_fixture();
        let path = config.root(Side::Local).join("m.bin");
        fs::write(&path, b"contents").unwrap();
        let rel = RelPath::new("m.bin").unwrap();
        let stat = fs::metadata(&path).unwrap();
        // Seed a (deliberately wrong) cached digest at the live coordinates:
        // a cache hit must be returned verbatim.
        cache
            .put(Side::Local, &rel, stat.len(), mtime_ms(&stat), "cached-digest")
            .unwrap();

        let pool = HashPool::spawn(1, Arc::clone(&config), Arc::clone(&cache), index, bus);
        let outcome = pool
            .submit_and_wait(Side::Local, &rel, false, &not_cancelled())
            .unwrap();
        assert_eq!(outcome.hash, "cached-digest");
        pool.shutdown();
    }

    #[test]
    fn force_job_detects_mismatch_and_invalidates() {
        let (_dir, config, cache, index, bus) = pool_fixture();
        let path = config.root(Side::Local).join("m.bin");
        fs::write(&path, b"actual bytes").unwrap();
        let rel = RelPath::new("m.bin").unwrap();
        let stat = fs::metadata(&path).unwrap();
        cache
            .put(Side::Local, &rel, stat.len(), mtime_ms(&stat), "stale-wrong-digest")
            .unwrap();

        let pool = HashPool::spawn(1, Arc::clone(&config), Arc::clone(&cache), index, bus);
        let err = pool
            .submit_and_wait(Side::Local, &rel, true, &not_cancelled())
            .unwrap_err();
        assert!(matches!(err, CoreError::HashMismatch { .. }));
        // The bad row is gone.
        assert_eq!(cache.get(Side::Local, &rel, stat.len(), mtime_ms(&stat)), None);
        pool.shutdown();
    }
}
