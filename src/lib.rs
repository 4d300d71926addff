// Use log::* macros instead of println!/eprintln! for proper log level control
#![deny(clippy::print_stdout, clippy::print_stderr)]

//! lakesync core: the storage coordination engine behind the HTTP/WS API.
//!
//! Components talk to each other only through the [`Core`] handle and the
//! event bus; the API layer in [`api`] is a thin JSON adapter over core
//! calls.

pub mod api;
pub mod bundles;
pub mod cache;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod events;
pub mod hasher;
pub mod index;
pub mod mirror;
pub mod paths;
pub mod queue;
pub mod sources;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bundles::BundleStore;
use crate::cache::HashCache;
use crate::config::{Config, Side};
use crate::dedupe::DedupeStore;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::hasher::HashPool;
use crate::index::IndexStore;
use crate::queue::QueueService;
use crate::sources::SourceStore;

/// Shared service handle: one instance per app-data directory, passed into
/// the adapter at startup (never a process global).
pub struct Core {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub index: Arc<IndexStore>,
    pub cache: Arc<HashCache>,
    pub queue: Arc<QueueService>,
    pub dedupe: Arc<DedupeStore>,
    pub sources: Arc<SourceStore>,
    pub bundles: Arc<BundleStore>,
    pub hashers: HashPool,
    stop: AtomicBool,
    scanning: [AtomicBool; 2],
}

impl Core {
    /// Open every store and spawn the hash worker pool. The queue executor
    /// is started separately via [`Core::start_executor`].
    pub fn open(config: Config) -> Result<Arc<Core>, CoreError> {
        std::fs::create_dir_all(&config.app_data_dir)
            .map_err(|e| CoreError::from(e).with_path(&config.app_data_dir))?;

        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let index = Arc::new(IndexStore::new());
        let cache = Arc::new(HashCache::open(&config.hash_cache_db_path())?);
        let queue = Arc::new(QueueService::open(&config.queue_db_path())?);
        let dedupe = Arc::new(DedupeStore::open(&config.dedupe_db_path())?);
        let sources = Arc::new(SourceStore::new(config.sources_sidecar_path()));
        let bundles = Arc::new(BundleStore::new(config.bundles_dir()));

        let reset = queue.store().reset_orphaned_running()?;
        if reset > 0 {
            log::info!("reset {reset} orphaned running task(s) to pending");
        }

        let hashers = HashPool::spawn(
            config.hash_workers,
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&index),
            Arc::clone(&bus),
        );

        Ok(Arc::new(Core {
            config,
            bus,
            index,
            cache,
            queue,
            dedupe,
            sources,
            bundles,
            hashers,
            stop: AtomicBool::new(false),
            scanning: [AtomicBool::new(false), AtomicBool::new(false)],
        }))
    }

    /// Spawn the queue executor thread.
    pub fn start_executor(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        queue::spawn_executor(Arc::clone(self))
    }

    /// Ask long-lived workers to wind down.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.hashers.shutdown();
    }

    pub fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn scan_flag(&self, side: Side) -> &AtomicBool {
        match side {
            Side::Local => &self.scanning[0],
            Side::Lake => &self.scanning[1],
        }
    }

    /// Try to claim the per-side scanner slot (one scanner per side).
    pub fn begin_scan(&self, side: Side) -> bool {
        self.scan_flag(side)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_scan(&self, side: Side) {
        self.scan_flag(side).store(false, Ordering::Release);
    }
}
