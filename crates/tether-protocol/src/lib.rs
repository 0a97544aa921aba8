//! # tether-protocol
//!
//! Wire envelope definitions for the tether relay.
//!
//! The client protocol is JSON over WebSocket text frames. Inbound envelopes
//! carry an integer-coded command; outbound envelopes are either a routed
//! delivery or an error report.
//!
//! ## Envelopes
//!
//! - inbound: `{"command": <0|1|2>, "channel": "...", "content": "..."}`
//! - outbound: `{"content": "...", "channel": "..."}` or `{"err": "..."}`
//!
//! ## Example
//!
//! ```rust
//! use tether_protocol::{codec, Command};
//!
//! let envelope = codec::decode(br#"{"command": 0, "channel": "random"}"#).unwrap();
//! assert_eq!(envelope.command, Command::Subscribe);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Command, Envelope, Outbound};
