use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use sled::{Db, Tree};
use tracing::warn;

use crate::message::{Envelope, Message};
use crate::utils::BusError;

const LOG_PREFIX: &str = "log:";
const DLQ_PREFIX: &str = "dlq:";

/// Capped, per-topic message log with a separate dead-letter log.
///
/// Entries are keyed by publish timestamp (millis, big-endian) plus a
/// process-local sequence number so same-millisecond appends stay ordered.
pub struct ReplayLog {
    db: Db,
    ttl_seconds: Option<i64>,
    max_per_topic: usize,
    seq: AtomicU64,
}

impl ReplayLog {
    pub fn open(
        path: &str,
        ttl_seconds: Option<i64>,
        max_per_topic: usize,
    ) -> Result<Self, BusError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            ttl_seconds,
            max_per_topic,
            seq: AtomicU64::new(0),
        })
    }

    fn key(&self, at: DateTime<Utc>) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&at.timestamp_millis().to_be_bytes());
        key[8..].copy_from_slice(&self.seq.fetch_add(1, Ordering::Relaxed).to_be_bytes());
        key
    }

    fn tree(&self, prefix: &str, topic: &str) -> Result<Tree, BusError> {
        Ok(self.db.open_tree(format!("{prefix}{topic}"))?)
    }

    /// Append a message to the topic's replay log, trimming oldest entries
    /// past the per-topic cap.
    pub fn append(&self, message: &Message) -> Result<(), BusError> {
        let tree = self.tree(LOG_PREFIX, &message.topic)?;
        self.append_to(&tree, message)?;
        while tree.len() > self.max_per_topic {
            tree.pop_min()?;
        }
        Ok(())
    }

    /// Append to the topic's dead-letter log. The DLQ log is not capped by
    /// count, only by the configured ttl.
    pub fn append_dead_letter(&self, message: &Message) -> Result<(), BusError> {
        let tree = self.tree(DLQ_PREFIX, &message.topic)?;
        self.append_to(&tree, message)
    }

    fn append_to(&self, tree: &Tree, message: &Message) -> Result<(), BusError> {
        let body = Envelope::encode(message)?;
        tree.insert(self.key(Utc::now()), body)?;
        Ok(())
    }

    /// Read back logged messages for a topic, oldest first. `since` bounds
    /// the range from below; `limit` caps the result size.
    pub fn replay(
        &self,
        topic: &str,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, BusError> {
        self.cleanup_expired(LOG_PREFIX, topic)?;
        self.read_range(&self.tree(LOG_PREFIX, topic)?, since, limit)
    }

    /// Messages that exhausted their retries on this topic.
    pub fn dead_letters(&self, topic: &str) -> Result<Vec<Message>, BusError> {
        self.cleanup_expired(DLQ_PREFIX, topic)?;
        self.read_range(&self.tree(DLQ_PREFIX, topic)?, None, usize::MAX)
    }

    fn read_range(
        &self,
        tree: &Tree,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Message>, BusError> {
        let iter = match since {
            Some(at) => {
                let mut lower = [0u8; 16];
                lower[..8].copy_from_slice(&at.timestamp_millis().to_be_bytes());
                tree.range(lower.to_vec()..)
            }
            None => tree.iter(),
        };

        let mut out = Vec::new();
        for entry in iter {
            let (_, value) = entry?;
            match Envelope::decode(&value) {
                Ok(message) => out.push(message),
                // A corrupt entry is skipped rather than poisoning replay.
                Err(e) => warn!("skipping undecodable log entry: {e}"),
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Drop expired entries from every topic tree. Reads already clean the
    /// tree they touch; this sweep covers topics nobody is reading.
    pub fn sweep(&self) -> Result<(), BusError> {
        for name in self.db.tree_names() {
            let Ok(name) = std::str::from_utf8(&name) else {
                continue;
            };
            if let Some(topic) = name.strip_prefix(LOG_PREFIX) {
                self.cleanup_expired(LOG_PREFIX, topic)?;
            } else if let Some(topic) = name.strip_prefix(DLQ_PREFIX) {
                self.cleanup_expired(DLQ_PREFIX, topic)?;
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), BusError> {
        self.db.flush()?;
        Ok(())
    }

    fn cleanup_expired(&self, prefix: &str, topic: &str) -> Result<(), BusError> {
        let Some(ttl) = self.ttl_seconds else {
            return Ok(());
        };
        let expiry_millis = (Utc::now().timestamp() - ttl) * 1000;
        let tree = self.tree(prefix, topic)?;

        let mut old_keys = Vec::new();
        for entry in tree.iter() {
            let (key, _) = entry?;
            if key.len() == 16 {
                let ts = i64::from_be_bytes(key[..8].try_into().unwrap_or_default());
                if ts < expiry_millis {
                    old_keys.push(key);
                    continue;
                }
            }
            // Keys are time-ordered; the first fresh entry ends the scan.
            break;
        }
        for key in old_keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReplayLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayLog")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_per_topic", &self.max_per_topic)
            .finish()
    }
}
