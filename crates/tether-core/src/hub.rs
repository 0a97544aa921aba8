//! Hub: process-wide registry and broadcaster of active sessions.
//!
//! All registry mutation happens on a single actor task that drains a
//! command channel, so concurrent register/unregister/broadcast calls never
//! race and presence events are strictly ordered.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tether_protocol::{codec, Outbound};

use crate::session::Session;

/// The channel every device is implicitly addressed on for join/leave and
/// connect/disconnect notices.
pub const DEFAULT_CHANNEL: &str = "general";

enum HubCommand {
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
    Unregister {
        token: String,
        id: u64,
        reply: oneshot::Sender<bool>,
    },
    Broadcast {
        payload: Bytes,
    },
    Current {
        token: String,
        reply: oneshot::Sender<Option<Arc<Session>>>,
    },
}

/// Handle to the hub actor.
///
/// Handles are cheap clones of the command sender; the actor exits once
/// every handle has been dropped.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Spawn the hub actor and return a handle to it.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Register a session, displacing any previously registered session for
    /// the same token.
    ///
    /// Returns the displaced session, if any; the caller is responsible for
    /// tearing it down.
    pub async fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Register { session, reply });
        rx.await.unwrap_or(None)
    }

    /// Remove a session from the registry and close its outbound queue.
    ///
    /// Idempotent. Returns `true` when no *other* session owns the token
    /// afterwards, i.e. the caller may retire token-level state such as the
    /// presence record. A stale unregister that lost a reconnect race
    /// returns `false` and must leave that state alone.
    pub async fn unregister(&self, session: &Session) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Unregister {
            token: session.token().to_string(),
            id: session.id(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    /// Queue a payload to every registered session.
    ///
    /// A session whose queue is full is evicted from the registry and its
    /// queue closed, rather than blocking the broadcast.
    pub fn broadcast(&self, payload: Bytes) {
        self.send(HubCommand::Broadcast { payload });
    }

    /// Look up the currently registered session for a token.
    pub async fn current(&self, token: &str) -> Option<Arc<Session>> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Current {
            token: token.to_string(),
            reply,
        });
        rx.await.unwrap_or(None)
    }

    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            warn!("Hub actor is gone; command dropped");
        }
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<HubCommand>) {
    let mut registry: HashMap<String, Arc<Session>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register { session, reply } => {
                let token = session.token().to_string();
                let displaced = registry.insert(token.clone(), session);
                debug!(device = %token, sessions = registry.len(), "Session registered");
                notify(&mut registry, format!("{token} joined"));
                let _ = reply.send(displaced);
            }
            HubCommand::Unregister { token, id, reply } => {
                let is_owner = registry
                    .get(&token)
                    .is_some_and(|current| current.id() == id);
                if is_owner {
                    if let Some(session) = registry.remove(&token) {
                        session.close_outbound();
                    }
                    debug!(device = %token, sessions = registry.len(), "Session unregistered");
                    notify(&mut registry, format!("{token} left"));
                }
                // The token is free unless a different session still holds
                // it; an already-removed entry (eviction, repeated call)
                // counts as free.
                let newer_owner = !is_owner && registry.contains_key(&token);
                let _ = reply.send(!newer_owner);
            }
            HubCommand::Broadcast { payload } => {
                broadcast_all(&mut registry, payload);
            }
            HubCommand::Current { token, reply } => {
                let _ = reply.send(registry.get(&token).cloned());
            }
        }
    }
}

/// Deliver a payload to every registered queue, evicting slow consumers.
fn broadcast_all(registry: &mut HashMap<String, Arc<Session>>, payload: Bytes) {
    let mut evicted = Vec::new();
    for (token, session) in registry.iter() {
        if !session.try_queue(payload.clone()) {
            warn!(device = %token, "Outbound queue full; evicting slow consumer");
            session.close_outbound();
            evicted.push(token.clone());
        }
    }
    for token in evicted {
        registry.remove(&token);
    }
}

fn notify(registry: &mut HashMap<String, Arc<Session>>, content: String) {
    if let Ok(payload) = codec::encode(&Outbound::delivery(content, DEFAULT_CHANNEL)) {
        broadcast_all(registry, payload);
    }
}
