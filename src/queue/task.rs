//! Task model: the tagged payload variants and task row shape shared by the
//! queue store, the executor, and the API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Side;
use crate::paths::RelPath;

/// Dedupe scan mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupeMode {
    /// Pre-group by `(size, mtime)` and hash only candidate groups.
    Fast,
    /// Hash every file in scope.
    Full,
}

/// Typed task payload. Unknown variants are rejected at the API boundary by
/// serde's tagged-enum deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Copy {
        src_side: Side,
        src_relpath: RelPath,
        dst_side: Side,
        dst_relpath: RelPath,
    },
    Delete {
        side: Side,
        relpath: RelPath,
        /// Dedupe-initiated deletes bypass the sync allow-delete policy.
        #[serde(default)]
        from_dedupe: bool,
    },
    Verify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        side: Option<Side>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relpath: Option<RelPath>,
    },
    HashFile {
        side: Side,
        relpath: RelPath,
    },
    DedupeScan {
        side: Side,
        mode: DedupeMode,
        #[serde(default)]
        min_size_bytes: u64,
    },
}

impl TaskPayload {
    pub fn task_type(&self) -> &'static str {
        match self {
            TaskPayload::Copy { .. } => "copy",
            TaskPayload::Delete { .. } => "delete",
            TaskPayload::Verify { .. } => "verify",
            TaskPayload::HashFile { .. } => "hash_file",
            TaskPayload::DedupeScan { .. } => "dedupe_scan",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One queue row.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: i64,
    #[serde(rename = "type")]
    pub task_type: &'static str,
    pub payload: TaskPayload,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
