//! Serialization and deserialization for the `ProjChat` channel protocol.
//!
//! Frames are JSON text. Decoding also enforces the structural invariants of
//! the payload so that a malformed event never reaches client state.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::event::{ClientEvent, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame parsed but violates a protocol invariant.
    #[error("invalid event: {0}")]
    Invalid(String),
}

/// Encodes any protocol value into a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes any protocol value from a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text cannot be deserialized.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a [`ClientEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    encode(event)
}

/// Decodes and validates a [`ServerEvent`].
///
/// Messages carried by `new-message` / `message-edited` must satisfy the
/// edit-flag invariant and have a canonical id; ids in the local placeholder
/// namespace are rejected.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for unparsable frames or unknown
/// events, and `CodecError::Invalid` for invariant violations.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    let event: ServerEvent = decode(text)?;
    match &event {
        ServerEvent::NewMessage { message } | ServerEvent::MessageEdited { message } => {
            if !message.id.is_canonical() {
                return Err(CodecError::Invalid(format!(
                    "{} carries a message without a server id: {:?}",
                    event.name(),
                    message.id.as_str()
                )));
            }
            if !message.edit_flags_consistent() {
                return Err(CodecError::Invalid(format!(
                    "message {} has isEdited={} but editedAt={:?}",
                    message.id, message.is_edited, message.edited_at
                )));
            }
        }
        ServerEvent::MessageDeleted { message_id } if !message_id.is_canonical() => {
            return Err(CodecError::Invalid(format!(
                "message-deleted without a server id: {:?}",
                message_id.as_str()
            )));
        }
        _ => {}
    }
    Ok(event)
}

/// Encodes a [`ServerEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    encode(event)
}

/// Decodes a [`ClientEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text cannot be deserialized.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    decode(text)
}
