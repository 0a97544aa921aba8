//! Inbound command dispatch.
//!
//! Envelopes are decoded once at the transport boundary; dispatch over the
//! closed command set happens here, so adding a command is a compile error
//! until every arm handles it.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use tether_core::{Session, SessionError};
use tether_protocol::{Command, Envelope};

/// Dispatch a decoded envelope to the session.
///
/// # Errors
///
/// Returns the operation failure; the caller reports it to the client as an
/// error envelope. Dispatch failures never terminate the connection.
pub async fn dispatch(session: &Arc<Session>, envelope: Envelope) -> Result<(), SessionError> {
    debug!(
        device = %session.token(),
        command = ?envelope.command,
        channel = %envelope.channel,
        "Dispatching command"
    );

    match envelope.command {
        Command::Subscribe => session.subscribe(&envelope.channel).await,
        Command::Unsubscribe => session.unsubscribe(&envelope.channel).await,
        Command::Publish => {
            let payload = Bytes::from(envelope.content.unwrap_or_default());
            session.publish(&envelope.channel, payload).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::{ChannelStore, Hub, MemoryBus, MemoryStore, PubSubBus};
    use tether_protocol::Outbound;
    use tokio::time::timeout;

    async fn connect(
        store: &Arc<MemoryStore>,
        bus: &Arc<MemoryBus>,
    ) -> (Arc<Session>, tokio::sync::mpsc::Receiver<bytes::Bytes>) {
        Session::connect(
            "dev1",
            Hub::spawn(),
            Arc::clone(store) as Arc<dyn ChannelStore>,
            Arc::clone(bus) as Arc<dyn PubSubBus>,
            8,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_membership_commands() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let (session, _rx) = connect(&store, &bus).await;

        dispatch(&session, Envelope::new(Command::Subscribe, "random"))
            .await
            .unwrap();
        assert!(store.is_personal_member("dev1", "random").await.unwrap());

        dispatch(&session, Envelope::new(Command::Unsubscribe, "random"))
            .await
            .unwrap();
        assert!(!store.is_personal_member("dev1", "random").await.unwrap());
    }

    #[tokio::test]
    async fn test_dispatch_publish_routes_to_subscriber() {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(MemoryBus::new());
        let (session, mut rx) = connect(&store, &bus).await;

        dispatch(&session, Envelope::new(Command::Subscribe, "random"))
            .await
            .unwrap();
        dispatch(
            &session,
            Envelope::new(Command::Publish, "random").with_content("hello"),
        )
        .await
        .unwrap();

        loop {
            let raw = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("queue closed");
            match serde_json::from_slice::<Outbound>(&raw).unwrap() {
                Outbound::Delivery { content, channel } if channel == "random" => {
                    assert_eq!(content, "hello");
                    return;
                }
                _ => continue,
            }
        }
    }
}
