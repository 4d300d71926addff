//! Mirror planner: a pure function over two index snapshots that produces
//! the copy/delete/conflict plan for one folder pair, plus the executor
//! that turns an approved plan into queue tasks.
//!
//! Identity inside the plan is the path suffix relative to each side's
//! folder, so mirroring `checkpoints` to a differently named destination
//! folder still pairs files correctly.

use serde::{Deserialize, Serialize};

use crate::Core;
use crate::config::Side;
use crate::error::CoreError;
use crate::index::{DiffStatus, IndexSnapshot, classify_pair};
use crate::paths::RelPath;

/// One file slated for copying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyItem {
    pub src_relpath: RelPath,
    pub dst_relpath: RelPath,
    pub size: u64,
}

/// One destination file slated for deletion (or listed as an extra).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteItem {
    pub relpath: RelPath,
    pub size: u64,
}

/// A suffix present on both sides whose pair is in confirmed conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictItem {
    pub src_relpath: RelPath,
    pub dst_relpath: RelPath,
}

/// The precomputed plan. `delete` is populated only when the destination
/// side allows sync deletes; otherwise the surplus files are reported in
/// `extras` for information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorPlan {
    pub src_side: Side,
    pub src_folder: String,
    pub dst_side: Side,
    pub dst_folder: String,
    pub copy: Vec<CopyItem>,
    pub delete: Vec<DeleteItem>,
    pub extras: Vec<DeleteItem>,
    pub conflicts: Vec<ConflictItem>,
    pub total_copy_bytes: u64,
    pub total_delete_bytes: u64,
}

/// Build a mirror plan from the current snapshots.
pub fn plan_mirror(
    local: &IndexSnapshot,
    lake: &IndexSnapshot,
    src_side: Side,
    src_folder: &str,
    dst_side: Side,
    dst_folder: Option<&str>,
    allow_delete_dst: bool,
) -> Result<MirrorPlan, CoreError> {
    if src_side == dst_side {
        return Err(CoreError::Invalid {
            message: "mirror requires two different sides".into(),
        });
    }
    let dst_folder = dst_folder.unwrap_or(src_folder);

    // suffix → entry, per side, restricted to each folder.
    fn collect(
        snap: &IndexSnapshot,
        folder: &str,
    ) -> std::collections::BTreeMap<String, crate::index::IndexEntry> {
        let mut out = std::collections::BTreeMap::new();
        for (relpath, entry) in snap.iter() {
            if let Some(suffix) = relpath.strip_folder(folder) {
                out.insert(suffix.to_string(), entry.clone());
            }
        }
        out
    }
    let pick = |side: Side| if side == Side::Local { local } else { lake };
    let src_entries = collect(pick(src_side), src_folder);
    let dst_entries = collect(pick(dst_side), dst_folder);

    let mut plan = MirrorPlan {
        src_side,
        src_folder: src_folder.trim_matches('/').to_string(),
        dst_side,
        dst_folder: dst_folder.trim_matches('/').to_string(),
        copy: Vec::new(),
        delete: Vec::new(),
        extras: Vec::new(),
        conflicts: Vec::new(),
        total_copy_bytes: 0,
        total_delete_bytes: 0,
    };

    for (suffix, src_entry) in &src_entries {
        match dst_entries.get(suffix) {
            None => {
                plan.total_copy_bytes += src_entry.size;
                plan.copy.push(CopyItem {
                    src_relpath: src_entry.relpath.clone(),
                    dst_relpath: RelPath::prefixed(dst_folder, suffix)?,
                    size: src_entry.size,
                });
            }
            Some(dst_entry) => {
                // classify_pair takes (local, lake) in that order.
                let (local_entry, lake_entry) = match src_side {
                    Side::Local => (src_entry, dst_entry),
                    Side::Lake => (dst_entry, src_entry),
                };
                if classify_pair(Some(local_entry), Some(lake_entry)) == DiffStatus::Conflict {
                    plan.conflicts.push(ConflictItem {
                        src_relpath: src_entry.relpath.clone(),
                        dst_relpath: dst_entry.relpath.clone(),
                    });
                }
            }
        }
    }

    for (suffix, dst_entry) in &dst_entries {
        if src_entries.contains_key(suffix) {
            continue;
        }
        let item = DeleteItem {
            relpath: dst_entry.relpath.clone(),
            size: dst_entry.size,
        };
        if allow_delete_dst {
            plan.total_delete_bytes += item.size;
            plan.delete.push(item);
        } else {
            plan.extras.push(item);
        }
    }

    Ok(plan)
}

/// Enqueue an approved plan: copies first, then deletes, skipping conflicts.
/// Returns the created task ids in order.
pub fn execute_plan(core: &Core, plan: &MirrorPlan, skip_deletes: bool) -> Result<Vec<i64>, CoreError> {
    let mut task_ids = Vec::with_capacity(plan.copy.len() + plan.delete.len());
    for item in &plan.copy {
        let task = core.queue.enqueue_copy(
            &core.config,
            plan.src_side,
            item.src_relpath.clone(),
            plan.dst_side,
            Some(item.dst_relpath.clone()),
        )?;
        task_ids.push(task.id);
    }
    if !skip_deletes {
        for item in &plan.delete {
            let task = core
                .queue
                .enqueue_delete(&core.config, plan.dst_side, item.relpath.clone(), false)?;
            task_ids.push(task.id);
        }
    }
    if !plan.conflicts.is_empty() {
        log::info!(
            "mirror execute: skipped {} conflicting entries",
            plan.conflicts.len()
        );
    }
    Ok(task_ids)
}
