//! Filesystem scanner: walks a side's root and rebuilds its index snapshot.
//!
//! Regular files only; symlinks are skipped, as are dot-entries directly
//! under the root (the source-URL sidecar lives there). Hashes are adopted
//! from the cache when the stored `(size, mtime)` still matches, so a
//! re-scan never throws verified work away.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, UNIX_EPOCH};

use crate::cache::HashCache;
use crate::config::{Config, Side};
use crate::error::CoreError;
use crate::events::{EventBus, IndexRefreshed, ScanProgress, Topic};
use crate::index::{IndexEntry, IndexStore};
use crate::paths::{RelPath, to_relpath};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Result of one completed scan.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub side: Side,
    pub file_count: usize,
    pub total_bytes: u64,
    pub duration_ms: u64,
}

/// Millisecond mtime from file metadata; clamps pre-epoch times to zero.
pub fn mtime_ms(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Walk a side's root and atomically replace its index snapshot.
///
/// Failure to open the root is fatal for the scan; failure to stat an
/// individual entry is logged and the entry skipped.
pub fn scan_side(
    config: &Config,
    side: Side,
    cache: &HashCache,
    index: &IndexStore,
    bus: &EventBus,
) -> Result<ScanOutcome, CoreError> {
    let root = config.root(side);
    let started = Instant::now();

    // Surface an unreadable root before walking, per the scan contract.
    fs::read_dir(root).map_err(|e| CoreError::from(e).with_path(root))?;

    let mut map = BTreeMap::new();
    let mut total_bytes = 0u64;
    let mut last_progress = Instant::now();
    walk(
        root,
        root,
        0,
        &mut map,
        &mut total_bytes,
        side,
        bus,
        &mut last_progress,
    );

    // Adopt cached hashes for entries whose stat coordinates still match.
    for entry in map.values_mut() {
        if let Some(hash) = cache.get(side, &entry.relpath, entry.size, entry.mtime_ms) {
            entry.hash = Some(hash);
        }
    }

    let outcome = ScanOutcome {
        side,
        file_count: map.len(),
        total_bytes,
        duration_ms: started.elapsed().as_millis() as u64,
    };
    index.replace(side, map);
    bus.publish(
        Topic::IndexRefreshed,
        &IndexRefreshed {
            side,
            file_count: outcome.file_count,
            total_bytes: outcome.total_bytes,
            duration_ms: outcome.duration_ms,
        },
    );
    log::info!(
        "scan {}: {} files, {} bytes in {} ms",
        side,
        outcome.file_count,
        outcome.total_bytes,
        outcome.duration_ms
    );
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn walk(
    dir: &Path,
    root: &Path,
    depth: usize,
    map: &mut BTreeMap<RelPath, IndexEntry>,
    total_bytes: &mut u64,
    side: Side,
    bus: &EventBus,
    last_progress: &mut Instant,
) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("scan {side}: failed to read {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if depth == 0 && name.to_string_lossy().starts_with('.') {
            continue;
        }

        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("scan {side}: failed to stat {}: {e}", path.display());
                continue;
            }
        };

        if metadata.is_symlink() {
            continue;
        }
        if metadata.is_dir() {
            walk(&path, root, depth + 1, map, total_bytes, side, bus, last_progress);
            continue;
        }
        if !metadata.is_file() {
            continue;
        }

        let relpath = match to_relpath(root, &path) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("scan {side}: skipping {}: {e}", path.display());
                continue;
            }
        };

        *total_bytes += metadata.len();
        map.insert(
            relpath.clone(),
            IndexEntry {
                relpath,
                size: metadata.len(),
                mtime_ms: mtime_ms(&metadata),
                hash: None,
            },
        );

        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            bus.publish(
                Topic::ScanProgress,
                &ScanProgress {
                    side,
                    files_found: map.len(),
                    bytes_found: *total_bytes,
                },
            );
            *last_progress = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SideConfig;

    fn test_config(local: &Path, lake: &Path, data: &Path) -> Config {
        Config {
            local: SideConfig {
                root: local.to_path_buf(),
                allow_delete_from_sync: false,
            },
            lake: SideConfig {
                root: lake.to_path_buf(),
                allow_delete_from_sync: true,
            },
            queue_concurrency: 1,
            queue_retry_count: 3,
            hash_workers: 1,
            app_data_dir: data.to_path_buf(),
            host: "127.0.0.1".into(),
            port: 0,
        }
    }

    fn setup() -> (tempfile::TempDir, Config, HashCache, IndexStore, EventBus) {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("local");
        let lake = dir.path().join("lake");
        let data = dir.path().join("data");
        fs::create_dir_all(&local).unwrap();
        fs::create_dir_all(&lake).unwrap();
        fs::create_dir_all(&data).unwrap();
        let config = test_config(&local, &lake, &data);
        let cache = HashCache::open(&config.hash_cache_db_path()).unwrap();
        (dir, config, cache, IndexStore::new(), EventBus::new())
    }

    #[test]
    fn indexes_regular_files_sorted() {
        let (_dir, config, cache, index, bus) = setup();
        let root = config.root(Side::Local);
        fs::create_dir_all(root.join("checkpoints")).unwrap();
        fs::write(root.join("checkpoints/b.safetensors"), b"bbbb").unwrap();
        fs::write(root.join("checkpoints/a.safetensors"), b"aa").unwrap();
        fs::write(root.join("top.bin"), b"123").unwrap();

        let outcome = scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();
        assert_eq!(outcome.file_count, 3);
        assert_eq!(outcome.total_bytes, 9);

        let snap = index.snapshot(Side::Local);
        let keys: Vec<&str> = snap.keys().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["checkpoints/a.safetensors", "checkpoints/b.safetensors", "top.bin"]
        );
        let entry = snap.get(&RelPath::new("top.bin").unwrap()).unwrap();
        assert_eq!(entry.size, 3);
        assert!(entry.mtime_ms > 0);
        assert!(entry.hash.is_none());
    }

    #[test]
    fn skips_root_dotfiles_but_not_nested_ones() {
        let (_dir, config, cache, index, bus) = setup();
        let root = config.root(Side::Lake);
        fs::write(root.join(".model_sources.json"), b"{}").unwrap();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/.hidden"), b"x").unwrap();
        fs::write(root.join("sub/visible.bin"), b"x").unwrap();

        scan_side(&config, Side::Lake, &cache, &index, &bus).unwrap();
        let snap = index.snapshot(Side::Lake);
        assert!(!snap.contains_key(&RelPath::new(".model_sources.json").unwrap()));
        assert!(snap.contains_key(&RelPath::new("sub/.hidden").unwrap()));
        assert!(snap.contains_key(&RelPath::new("sub/visible.bin").unwrap()));
    }

    #[cfg(unix)]
    #[test]
    fn skips_symlinks() {
        let (_dir, config, cache, index, bus) = setup();
        let root = config.root(Side::Local);
        fs::write(root.join("real.bin"), b"data").unwrap();
        std::os::unix::fs::symlink(root.join("real.bin"), root.join("link.bin")).unwrap();

        scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();
        let snap = index.snapshot(Side::Local);
        assert_eq!(snap.len(), 1);
        assert!(snap.contains_key(&RelPath::new("real.bin").unwrap()));
    }

    #[test]
    fn missing_root_is_fatal() {
        let (_dir, mut config, cache, index, bus) = setup();
        config.local.root = config.local.root.join("does-not-exist");
        let err = scan_side(&config, Side::Local, &cache, &index, &bus).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn rescan_adopts_cached_hash_when_stat_matches() {
        let (_dir, config, cache, index, bus) = setup();
        let root = config.root(Side::Local);
        fs::write(root.join("model.bin"), b"payload").unwrap();

        scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();
        let rel = RelPath::new("model.bin").unwrap();
        let entry = index.get(Side::Local, &rel).unwrap();
        cache
            .put(Side::Local, &rel, entry.size, entry.mtime_ms, "deadbeef")
            .unwrap();

        scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();
        assert_eq!(
            index.get(Side::Local, &rel).unwrap().hash.as_deref(),
            Some("deadbeef")
        );
    }

    #[test]
    fn rescan_drops_disappeared_files() {
        let (_dir, config, cache, index, bus) = setup();
        let root = config.root(Side::Local);
        fs::write(root.join("temp.bin"), b"x").unwrap();
        scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();
        assert_eq!(index.snapshot(Side::Local).len(), 1);

        fs::remove_file(root.join("temp.bin")).unwrap();
        scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();
        assert_eq!(index.snapshot(Side::Local).len(), 0);
    }

    #[test]
    fn publishes_index_refreshed_event() {
        let (_dir, config, cache, index, bus) = setup();
        let mut rx = bus.subscribe();
        fs::write(config.root(Side::Local).join("a.bin"), b"1234").unwrap();
        scan_side(&config, Side::Local, &cache, &index, &bus).unwrap();

        let mut saw_refresh = false;
        while let Ok(ev) = rx.try_recv() {
            if ev.topic == Topic::IndexRefreshed {
                assert_eq!(ev.data["side"], "local");
                assert_eq!(ev.data["file_count"], 1);
                saw_refresh = true;
            }
        }
        assert!(saw_refresh);
    }
}
