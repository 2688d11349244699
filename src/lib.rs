//! # Omnibus
//!
//! `omnibus` is a multi-backend publish/subscribe bus. One message type and
//! one manager front three delivery backends with different guarantees:
//!
//! - `durable`: AMQP-backed delivery with persistent messages, durable
//!   queues, and dead-letter routing.
//! - `ephemeral`: fast in-process fan-out with inline retries and an
//!   optional capped replay log.
//! - `push`: bounded fan-out to connected clients over WebSockets, with
//!   heartbeats, rooms, and drop-on-full queues.
//!
//! ## Core Modules
//!
//! - `message`: the message value type, its lifecycle state machine, and
//!   the versioned wire envelope.
//! - `durable`, `ephemeral`, `push`: the three backends.
//! - `manager`: the facade that owns the enabled backends, fans publishes
//!   out to them, and aggregates their health.
//! - `persistence`: the capped replay and dead-letter logs.
//! - `transport`: the WebSocket server and client protocol.
//! - `config`: layered configuration (defaults, file, environment).
//! - `utils`: shared utilities, such as error handling.

pub mod config;
pub mod durable;
pub mod ephemeral;
pub mod manager;
pub mod message;
pub mod persistence;
pub mod push;
pub mod transport;
pub mod utils;
