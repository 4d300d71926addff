//! In-process event bus bridging workers to the WebSocket adapter.
//!
//! Fan-out to per-subscriber bounded channels. Progress topics are lossy:
//! a full channel drops the event. Lifecycle topics must be delivered: a
//! subscriber that cannot keep up is disconnected and logged instead of
//! blocking the publisher.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::Side;
use crate::paths::RelPath;

/// Per-subscriber channel capacity.
const PROGRESS_CAPACITY: usize = 256;

// ── Topics and payloads ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    QueueProgress,
    TaskStarted,
    TaskComplete,
    HashProgress,
    VerifyProgress,
    ScanProgress,
    IndexRefreshed,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::QueueProgress => "queue_progress",
            Topic::TaskStarted => "task_started",
            Topic::TaskComplete => "task_complete",
            Topic::HashProgress => "hash_progress",
            Topic::VerifyProgress => "verify_progress",
            Topic::ScanProgress => "scan_progress",
            Topic::IndexRefreshed => "index_refreshed",
        }
    }

    /// Progress streams may drop events under load; lifecycle events may not.
    pub fn is_lossy(self) -> bool {
        matches!(
            self,
            Topic::QueueProgress | Topic::HashProgress | Topic::VerifyProgress | Topic::ScanProgress
        )
    }
}

/// A published event: topic plus JSON payload, as delivered to WebSocket
/// clients in `{type, data}` frames.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Topic,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueProgress {
    pub task_id: i64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub progress_pct: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStarted {
    pub task_id: i64,
    pub task_type: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskComplete {
    pub task_id: i64,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashProgress {
    pub side: Side,
    pub relpath: RelPath,
    pub bytes_hashed: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyProgress {
    pub folder: String,
    pub current: usize,
    pub total: usize,
    pub relpath: RelPath,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub side: Side,
    pub files_found: usize,
    pub bytes_found: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexRefreshed {
    pub side: Side,
    pub file_count: usize,
    pub total_bytes: u64,
    pub duration_ms: u64,
}

// ── Bus ──────────────────────────────────────────────────────────────

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Topic-based publish/subscribe hub. Publishers never block; see module doc
/// for the per-topic overflow policy.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber; the returned receiver gets all future events.
    pub fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(PROGRESS_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(Subscriber { id, tx }),
            Err(_) => log::error!("event bus subscriber lock poisoned; subscriber not registered"),
        }
        rx
    }

    /// Publish a payload to all subscribers.
    pub fn publish<T: Serialize>(&self, topic: Topic, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::error!("event bus: failed to encode {} payload: {e}", topic.as_str());
                return;
            }
        };
        let event = Event { topic, data };

        let Ok(mut subs) = self.subscribers.lock() else {
            log::error!("event bus subscriber lock poisoned; dropping {}", topic.as_str());
            return;
        };
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                if topic.is_lossy() {
                    true // drop this event, keep the subscriber
                } else {
                    log::warn!(
                        "event bus: subscriber {} too slow for {}, disconnecting",
                        sub.id,
                        topic.as_str()
                    );
                    false
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Number of live subscribers (test and diagnostics hook).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
