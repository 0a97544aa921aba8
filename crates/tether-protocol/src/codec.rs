//! Codec for the tether client protocol.
//!
//! Inbound frames are normalized (trimmed, embedded newlines collapsed to
//! spaces) before JSON decoding, so multi-line client input decodes the same
//! as single-line input.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::{Envelope, Outbound};

/// Protocol errors that can occur during encoding/decoding.
///
/// These are per-frame errors: the connection stays open, the frame is
/// discarded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    NotUtf8,

    /// JSON encoding or decoding error.
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode an inbound envelope from a raw text frame.
///
/// # Errors
///
/// Returns an error if the frame is not UTF-8 or not a valid envelope.
pub fn decode(raw: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::NotUtf8)?;
    let envelope = serde_json::from_str(&normalize(text))?;
    Ok(envelope)
}

/// Encode an outbound envelope to bytes.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode(outbound: &Outbound) -> Result<Bytes, ProtocolError> {
    let data = serde_json::to_vec(outbound)?;
    Ok(Bytes::from(data))
}

/// Trim surrounding whitespace and collapse embedded newlines to spaces.
fn normalize(text: &str) -> String {
    text.trim().replace('\n', " ")
}
