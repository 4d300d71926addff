//! Core error type shared by all storage-coordination components.
//!
//! Follows the struct-variant enum pattern: each variant carries the context
//! needed to render a useful message, and `is_transient()` drives the queue's
//! retry classification.

use crate::config::Side;

/// Errors surfaced by the storage coordination core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A path-bearing input escaped (or would escape) its side's root.
    PathEscape { path: String },
    /// The relpath does not exist on the given side.
    NotFound { path: String },
    /// Copy refused because the destination diff status is a confirmed conflict.
    ConflictRefused { relpath: String },
    /// Filesystem permission error.
    PermissionDenied { path: String, message: String },
    /// Timeout, share disconnect or similar; retried by the queue.
    TransientIo { path: String, message: String },
    /// The file mutated while it was being hashed; retryable.
    HashRaced { relpath: String },
    /// Verify computed a digest that disagrees with the cached one.
    HashMismatch {
        relpath: String,
        expected: String,
        actual: String,
    },
    /// Sync-path delete refused by the side's allow-delete flag.
    PolicyDenied { side: Side, relpath: String },
    /// A dedupe group's files changed on disk since the scan.
    DedupeStaleGroup { group_id: i64, relpath: String },
    /// The operation's cancellation handle was signalled.
    Cancelled,
    /// SQLite-level failure in one of the persistent stores.
    Storage { message: String },
    /// Uncategorized I/O failure.
    Io { path: String, message: String },
    /// Request-shaped input that fails validation (bad side, bad payload, ...).
    Invalid { message: String },
}

impl CoreError {
    /// Whether the queue should re-enqueue the failed task (up to the retry cap).
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientIo { .. } | CoreError::HashRaced { .. })
    }

    /// Attach a path to an error converted from a bare `io::Error`.
    pub fn with_path(self, path: &std::path::Path) -> Self {
        let p = path.display().to_string();
        match self {
            CoreError::NotFound { .. } => CoreError::NotFound { path: p },
            CoreError::PermissionDenied { message, .. } => CoreError::PermissionDenied { path: p, message },
            CoreError::TransientIo { message, .. } => CoreError::TransientIo { path: p, message },
            CoreError::Io { message, .. } => CoreError::Io { path: p, message },
            other => other,
        }
    }
}

impl std::fmt::Display for CoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoreError::PathEscape { path } => write!(f, "path escapes its root: {path}"),
            CoreError::NotFound { path } => write!(f, "not found: {path}"),
            CoreError::ConflictRefused { relpath } => {
                write!(f, "copy refused, destination conflicts: {relpath}")
            }
            CoreError::PermissionDenied { path, message } => {
                write!(f, "permission denied for {path}: {message}")
            }
            CoreError::TransientIo { path, message } => {
                if path.is_empty() {
                    write!(f, "transient I/O error: {message}")
                } else {
                    write!(f, "transient I/O error on {path}: {message}")
                }
            }
            CoreError::HashRaced { relpath } => {
                write!(f, "file changed while hashing: {relpath}")
            }
            CoreError::HashMismatch {
                relpath,
                expected,
                actual,
            } => write!(
                f,
                "hash mismatch for {relpath}: cached {expected}, computed {actual}"
            ),
            CoreError::PolicyDenied { side, relpath } => {
                write!(f, "delete not allowed on {side} side: {relpath}")
            }
            CoreError::DedupeStaleGroup { group_id, relpath } => {
                write!(f, "dedupe group {group_id} is stale ({relpath} changed since scan)")
            }
            CoreError::Cancelled => write!(f, "operation cancelled"),
            CoreError::Storage { message } => write!(f, "storage error: {message}"),
            CoreError::Io { path, message } => {
                if path.is_empty() {
                    write!(f, "I/O error: {message}")
                } else {
                    write!(f, "I/O error on {path}: {message}")
                }
            }
            CoreError::Invalid { message } => write!(f, "invalid request: {message}"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let message = err.to_string();
        match err.kind() {
            ErrorKind::NotFound => CoreError::NotFound { path: String::new() },
            ErrorKind::PermissionDenied => CoreError::PermissionDenied {
                path: String::new(),
                message,
            },
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::WouldBlock => CoreError::TransientIo {
                path: String::new(),
                message,
            },
            _ => CoreError::Io {
                path: String::new(),
                message,
            },
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        CoreError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Storage {
            message: format!("payload encoding: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let e = CoreError::TransientIo {
            path: "x".into(),
            message: "timed out".into(),
        };
        assert!(e.is_transient());
        assert!(CoreError::HashRaced { relpath: "a/b".into() }.is_transient());
        assert!(!CoreError::NotFound { path: "x".into() }.is_transient());
        assert!(!CoreError::Cancelled.is_transient());
        assert!(
            !CoreError::PermissionDenied {
                path: "x".into(),
                message: "denied".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn io_error_kind_mapping() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(CoreError::from(not_found), CoreError::NotFound { .. }));

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow share");
        assert!(CoreError::from(timeout).is_transient());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(CoreError::from(denied), CoreError::PermissionDenied { .. }));
    }

    #[test]
    fn with_path_fills_in_location() {
        let err = CoreError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"))
            .with_path(std::path::Path::new("/mnt/lake/a.bin"));
        match err {
            CoreError::TransientIo { path, .. } => assert_eq!(path, "/mnt/lake/a.bin"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
