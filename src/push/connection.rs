//! A single admitted push client.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::frame::Frame;

/// Result of a non-blocking push onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the frame was dropped so the publisher never blocks.
    Dropped,
    /// The receiver side is gone; the connection should be evicted.
    Closed,
}

/// One admitted client connection.
///
/// Mutable state is interior and atomic: the fan-out path writes frames, the
/// heartbeat loop writes pings, the transport reports activity, and the
/// cleanup loop reads idle times — none of them blocks another.
pub struct Connection {
    pub client_id: String,
    pub connected_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    sender: mpsc::Sender<Frame>,
    subscriptions: Mutex<HashSet<String>>,
    last_activity_ms: AtomicI64,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        client_id: String,
        metadata: BTreeMap<String, serde_json::Value>,
        queue_size: usize,
    ) -> (Self, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let conn = Self {
            client_id,
            connected_at: Utc::now(),
            metadata,
            sender,
            subscriptions: Mutex::new(HashSet::new()),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        (conn, receiver)
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn try_push(&self, frame: Frame) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }
        match self.sender.try_send(frame) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close();
                PushOutcome::Closed
            }
        }
    }

    /// Record client activity; drives idle eviction.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    pub fn idle_millis(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_activity_ms.load(Ordering::Acquire)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Idempotent close guard: returns true only for the first close, so a
    /// connection torn down by explicit disconnect is never also torn down
    /// by the cleanup loop.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn add_subscription(&self, topic: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string());
    }

    pub fn remove_subscription(&self, topic: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(topic);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("connected_at", &self.connected_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}
