//! The `transport` module is the connection-facing edge of the bus.
//!
//! It defines the JSON protocol WebSocket clients speak and the server that
//! accepts them. Each accepted socket registers with the push channel (which
//! enforces the connection cap and owns the outbound queue) and forwards
//! client requests to the messaging manager.

pub mod message;
pub mod websocket;

#[cfg(test)]
mod tests;

pub use message::{ClientMessage, parse_selector};
pub use websocket::{run, start_websocket_server};
