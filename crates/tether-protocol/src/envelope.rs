//! Envelope types for the tether client protocol.
//!
//! Commands are integer-coded on the wire and decoded once, at the
//! boundary, into a closed enum so downstream dispatch is exhaustive.

use serde::{Deserialize, Serialize};

/// Client command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Command {
    /// Add a personal channel membership.
    Subscribe = 0,
    /// Remove a personal channel membership.
    Unsubscribe = 1,
    /// Publish a payload to a channel on the bus.
    Publish = 2,
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        cmd as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Command::Subscribe),
            1 => Ok(Command::Unsubscribe),
            2 => Ok(Command::Publish),
            _ => Err("Invalid command"),
        }
    }
}

/// An inbound client envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The requested operation.
    pub command: Command,
    /// Target channel name.
    pub channel: String,
    /// Payload for `Publish`; absent for membership commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(command: Command, channel: impl Into<String>) -> Self {
        Self {
            command,
            channel: channel.into(),
            content: None,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// An outbound server envelope.
///
/// Either a delivery routed from the bus or an error report for a failed
/// client operation. The two shapes are distinguished by their fields, not
/// by a tag, matching the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    /// A message routed from a subscribed channel.
    Delivery {
        /// Message payload.
        content: String,
        /// Channel the message was published on.
        channel: String,
    },
    /// A failed operation, reported on the same connection.
    Error {
        /// Human-readable error message.
        err: String,
    },
}

impl Outbound {
    /// Create a delivery envelope.
    #[must_use]
    pub fn delivery(content: impl Into<String>, channel: impl Into<String>) -> Self {
        Outbound::Delivery {
            content: content.into(),
            channel: channel.into(),
        }
    }

    /// Create an error envelope.
    #[must_use]
    pub fn error(err: impl std::fmt::Display) -> Self {
        Outbound::Error {
            err: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(0), Ok(Command::Subscribe));
        assert_eq!(Command::try_from(1), Ok(Command::Unsubscribe));
        assert_eq!(Command::try_from(2), Ok(Command::Publish));
        assert!(Command::try_from(3).is_err());
        assert_eq!(u8::from(Command::Publish), 2);
    }

    #[test]
    fn test_envelope_decode() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"command": 2, "channel": "random", "content": "hi"}"#)
                .unwrap();
        assert_eq!(envelope.command, Command::Publish);
        assert_eq!(envelope.channel, "random");
        assert_eq!(envelope.content.as_deref(), Some("hi"));
    }

    #[test]
    fn test_envelope_content_optional() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"command": 0, "channel": "random"}"#).unwrap();
        assert_eq!(envelope.command, Command::Subscribe);
        assert!(envelope.content.is_none());

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("content"));
    }

    #[test]
    fn test_envelope_rejects_unknown_command() {
        let result: Result<Envelope, _> =
            serde_json::from_str(r#"{"command": 7, "channel": "random"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_outbound_delivery_shape() {
        let json = serde_json::to_string(&Outbound::delivery("hello", "random")).unwrap();
        assert_eq!(json, r#"{"content":"hello","channel":"random"}"#);
    }

    #[test]
    fn test_outbound_error_shape() {
        let json = serde_json::to_string(&Outbound::error("store unavailable")).unwrap();
        assert_eq!(json, r#"{"err":"store unavailable"}"#);
    }
}
