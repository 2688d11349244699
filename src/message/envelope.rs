//! Versioned wire envelope.
//!
//! Every message that crosses a process boundary is wrapped in an explicit,
//! versioned envelope and (de)serialized strictly: unknown fields, malformed
//! bodies, and unsupported versions are rejected with [`BusError::Codec`]
//! rather than coerced or stringified.

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::utils::BusError;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub version: u8,
    pub message: Message,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    version: u8,
    message: &'a Message,
}

impl Envelope {
    /// Serialize a message into a version-1 envelope.
    pub fn encode(message: &Message) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(&EnvelopeRef {
            version: ENVELOPE_VERSION,
            message,
        })
        .map_err(|e| BusError::Codec(e.to_string()))
    }

    /// Strictly decode an envelope, rejecting unsupported versions.
    pub fn decode(bytes: &[u8]) -> Result<Message, BusError> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| BusError::Codec(e.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(BusError::Codec(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope.message)
    }
}
