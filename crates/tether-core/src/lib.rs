//! # tether-core
//!
//! Connection/session lifecycle and message routing for the tether relay.
//!
//! This crate provides the in-process engine that bridges persistent
//! per-device connections to a shared topic-based bus:
//!
//! - **Hub** - Process-wide registry and broadcaster of active sessions
//! - **Session** - Per-device bridge between a connection and the bus
//! - **ChannelStore** - Persisted presence and channel-membership contract
//! - **PubSubBus** - Multi-topic publish/subscribe contract
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Session   │────▶│  PubSubBus  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │     Hub     │     │ ChannelStore│
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! A device holds at most one active session at a time: connecting again
//! with the same token forcibly tears down the previous session before the
//! new one becomes visible.

pub mod bus;
pub mod hub;
pub mod session;
pub mod store;

pub use bus::{BusError, Delivery, MemoryBus, PubSubBus, Subscription};
pub use hub::{Hub, DEFAULT_CHANNEL};
pub use session::{Session, SessionError};
pub use store::{effective_channels, ChannelStore, MemoryStore, StoreError};
