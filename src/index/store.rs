//! In-memory per-side index with copy-on-write snapshots.
//!
//! Readers take an `Arc` snapshot and never observe a half-applied refresh;
//! writers build a replacement map and swap it in atomically. Targeted
//! updates (after a completed copy or delete) clone the current map, which
//! is acceptable at model-library file counts.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::config::Side;
use crate::paths::RelPath;

/// One live file on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    pub relpath: RelPath,
    pub size: u64,
    /// Modification time, milliseconds since the Unix epoch (UTC).
    pub mtime_ms: i64,
    pub hash: Option<String>,
}

/// Immutable view of one side's index, ordered by relpath.
pub type IndexSnapshot = Arc<BTreeMap<RelPath, IndexEntry>>;

/// Aggregate numbers for one side.
#[derive(Debug, Clone, Serialize)]
pub struct SideStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub hashed_count: usize,
}

/// Holder of the two per-side snapshots.
pub struct IndexStore {
    local: RwLock<IndexSnapshot>,
    lake: RwLock<IndexSnapshot>,
}

impl Default for IndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexStore {
    pub fn new() -> IndexStore {
        IndexStore {
            local: RwLock::new(Arc::new(BTreeMap::new())),
            lake: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    fn slot(&self, side: Side) -> &RwLock<IndexSnapshot> {
        match side {
            Side::Local => &self.local,
            Side::Lake => &self.lake,
        }
    }

    /// Current snapshot for a side. Cheap (`Arc` clone).
    pub fn snapshot(&self, side: Side) -> IndexSnapshot {
        match self.slot(side).read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace a side's snapshot wholesale (scanner completion).
    pub fn replace(&self, side: Side, map: BTreeMap<RelPath, IndexEntry>) {
        let next = Arc::new(map);
        match self.slot(side).write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Insert or update a single entry (executor after a completed copy).
    pub fn upsert(&self, side: Side, entry: IndexEntry) {
        self.mutate(side, |map| {
            map.insert(entry.relpath.clone(), entry);
        });
    }

    /// Remove an entry (executor after a completed delete).
    pub fn remove(&self, side: Side, relpath: &RelPath) {
        self.mutate(side, |map| {
            map.remove(relpath);
        });
    }

    /// Set the hash of an existing entry, leaving stat fields untouched.
    pub fn set_hash(&self, side: Side, relpath: &RelPath, hash: &str) {
        self.mutate(side, |map| {
            if let Some(entry) = map.get_mut(relpath) {
                entry.hash = Some(hash.to_string());
            }
        });
    }

    pub fn get(&self, side: Side, relpath: &RelPath) -> Option<IndexEntry> {
        self.snapshot(side).get(relpath).cloned()
    }

    pub fn stats(&self, side: Side) -> SideStats {
        let snap = self.snapshot(side);
        SideStats {
            file_count: snap.len(),
            total_bytes: snap.values().map(|e| e.size).sum(),
            hashed_count: snap.values().filter(|e| e.hash.is_some()).count(),
        }
    }

    fn mutate(&self, side: Side, f: impl FnOnce(&mut BTreeMap<RelPath, IndexEntry>)) {
        let slot = self.slot(side);
        let mut guard = match slot.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}
