//! The `persistence` module provides the capped replay and dead-letter logs
//! used by the ephemeral broker.
//!
//! Replay is explicit: late subscribers ask for a range, nothing is replayed
//! automatically. The log is bounded per topic (oldest entries trimmed) and
//! optionally time-limited, so it never grows into arbitrary payload history.
//!
//! Backed by `sled` as an embedded key-value store, one tree per topic.

pub mod replay;

pub use replay::ReplayLog;
