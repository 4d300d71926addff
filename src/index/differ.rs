//! Diff engine: joins the two side indexes by relpath and classifies each
//! entry.
//!
//! Pure over snapshots; the API layer calls this on every diff query so a
//! task's index updates are visible immediately after its completion event.

use serde::Serialize;

use crate::index::{IndexEntry, IndexSnapshot};
use crate::paths::RelPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffStatus {
    OnlyLocal,
    OnlyLake,
    Same,
    ProbableSame,
    Conflict,
}

/// Per-relpath join of the two sides.
#[derive(Debug, Clone, Serialize)]
pub struct DiffEntry {
    pub relpath: RelPath,
    pub status: DiffStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_mtime_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lake_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lake_mtime_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lake_hash: Option<String>,
}

/// Classify a pair of entries present under the same identity.
///
/// `probable_same` is the only status later hashing may upgrade; a
/// `conflict` stands until one side changes on disk.
pub fn classify_pair(local: Option<&IndexEntry>, lake: Option<&IndexEntry>) -> DiffStatus {
    match (local, lake) {
        (Some(_), None) => DiffStatus::OnlyLocal,
        (None, Some(_)) => DiffStatus::OnlyLake,
        (None, None) => DiffStatus::OnlyLocal, // unreachable by construction
        (Some(l), Some(k)) => {
            if let (Some(lh), Some(kh)) = (&l.hash, &k.hash) {
                if lh == kh {
                    DiffStatus::Same
                } else {
                    DiffStatus::Conflict
                }
            } else if l.size != k.size {
                DiffStatus::Conflict
            } else {
                DiffStatus::ProbableSame
            }
        }
    }
}

/// Join both snapshots, optionally restricted to a folder prefix and a
/// substring query, sorted by relpath.
pub fn compute_diff(
    local: &IndexSnapshot,
    lake: &IndexSnapshot,
    folder: Option<&str>,
    query: Option<&str>,
) -> Vec<DiffEntry> {
    let matches = |relpath: &RelPath| -> bool {
        if let Some(folder) = folder
            && !relpath.is_under(folder)
        {
            return false;
        }
        if let Some(q) = query
            && !q.is_empty()
            && !relpath.as_str().contains(q)
        {
            return false;
        }
        true
    };

    // Both maps iterate in relpath order; a merge join keeps the output sorted.
    let mut out = Vec::new();
    let mut left = local.iter().peekable();
    let mut right = lake.iter().peekable();

    loop {
        let entry = match (left.peek(), right.peek()) {
            (Some((lk, _)), Some((rk, _))) => {
                if lk < rk {
                    let (_, l) = left.next().unwrap();
                    make_entry(Some(l), None)
                } else if rk < lk {
                    let (_, r) = right.next().unwrap();
                    make_entry(None, Some(r))
                } else {
                    let (_, l) = left.next().unwrap();
                    let (_, r) = right.next().unwrap();
                    make_entry(Some(l), Some(r))
                }
            }
            (Some(_), None) => {
                let (_, l) = left.next().unwrap();
                make_entry(Some(l), None)
            }
            (None, Some(_)) => {
                let (_, r) = right.next().unwrap();
                make_entry(None, Some(r))
            }
            (None, None) => break,
        };
        if matches(&entry.relpath) {
            out.push(entry);
        }
    }
    out
}

fn make_entry(local: Option<&IndexEntry>, lake: Option<&IndexEntry>) -> DiffEntry {
    let relpath = local
        .or(lake)
        .map(|e| e.relpath.clone())
        .expect("diff join always has at least one side");
    DiffEntry {
        relpath,
        status: classify_pair(local, lake),
        local_size: local.map(|e| e.size),
        local_mtime_ms: local.map(|e| e.mtime_ms),
        local_hash: local.and_then(|e| e.hash.clone()),
        lake_size: lake.map(|e| e.size),
        lake_mtime_ms: lake.map(|e| e.mtime_ms),
        lake_hash: lake.and_then(|e| e.hash.clone()),
    }
}
