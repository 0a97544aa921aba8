//! Session lifecycle: the per-device bridge between a connection and the
//! shared bus.
//!
//! A session is ephemeral: created on connection upgrade, destroyed on
//! disconnect, never reused. A device reconnecting always gets a new
//! session, and the previous one is forcibly torn down first so at most one
//! session per token is ever active.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_protocol::{codec, Outbound};

use crate::bus::{BusError, PubSubBus, Subscription};
use crate::hub::{Hub, DEFAULT_CHANNEL};
use crate::store::{effective_channels, ChannelStore, StoreError};

/// Counter for session identity; used to tell a stale teardown from the
/// current owner of a token, never for ordering.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Session operation errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A channel-store operation failed; membership state is unchanged.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A bus operation failed. During connect this aborts session creation.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Teardown-sensitive state, guarded by one async mutex so that a forced
/// disconnect and an in-flight subscribe cannot interleave.
struct SessionState {
    active: bool,
    forward: Option<JoinHandle<()>>,
}

/// The runtime bridge between one connected device and the shared bus.
pub struct Session {
    token: String,
    id: u64,
    hub: Hub,
    store: Arc<dyn ChannelStore>,
    bus: Arc<dyn PubSubBus>,
    /// Sender side of the outbound queue; `None` once the queue is closed.
    outbound: StdMutex<Option<mpsc::Sender<Bytes>>>,
    state: Mutex<SessionState>,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Connect a device.
    ///
    /// If a session for the same token is already active it is torn down
    /// synchronously before this one becomes visible. The token is added to
    /// the presence set, the effective channel set (global ∪ personal) is
    /// resolved and subscribed on the bus, and the session is registered
    /// with the hub. A best-effort "connected" notice is published on the
    /// default broadcast channel.
    ///
    /// Returns the session and the receiver end of its outbound queue,
    /// which the connection's writer owns for the session's lifetime.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` if the presence write or membership
    /// reads fail, and `SessionError::Bus` if subscription setup fails. In
    /// both cases session creation is aborted and nothing stays registered.
    pub async fn connect(
        token: impl Into<String>,
        hub: Hub,
        store: Arc<dyn ChannelStore>,
        bus: Arc<dyn PubSubBus>,
        queue_capacity: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Bytes>), SessionError> {
        let token = token.into();

        // A reconnecting device wins: the prior session is fully torn down
        // before the new one touches any shared state.
        if let Some(prior) = hub.current(&token).await {
            debug!(device = %token, "Duplicate connection; tearing down prior session");
            prior.disconnect().await;
        }

        store.add_presence(&token).await?;

        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity);
        let (closed_tx, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            hub: hub.clone(),
            store: Arc::clone(&store),
            bus: Arc::clone(&bus),
            outbound: StdMutex::new(Some(queue_tx)),
            state: Mutex::new(SessionState {
                active: true,
                forward: None,
            }),
            closed_tx,
            token,
        });

        if let Err(e) = session.resubscribe().await {
            // The presence record written above must not outlive the abort.
            if let Err(rollback) = store.remove_presence(session.token()).await {
                warn!(device = %session.token, error = %rollback, "Presence rollback failed");
            }
            return Err(e);
        }

        // A concurrent connect for the same token may have registered while
        // this one was subscribing; whichever session gets displaced here is
        // torn down like any other duplicate.
        if let Some(displaced) = hub.register(Arc::clone(&session)).await {
            displaced.disconnect().await;
        }

        session.publish_notice("connected").await;
        debug!(device = %session.token, id = session.id, "Session connected");

        Ok((session, queue_rx))
    }

    /// The device token this session belongs to.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Unique identity of this session instance.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the session has not been torn down yet.
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    /// A signal that flips to `true` once the outbound queue is closed, so
    /// the connection's reader and the forwarding loop exit promptly on a
    /// forced disconnect or a slow-consumer eviction.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Add a personal channel membership and refresh the bus subscription.
    ///
    /// Idempotent: if the channel is already a personal membership this is
    /// a success with no side effect. On a store failure the previous
    /// subscription is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` if persistence fails.
    pub async fn subscribe(&self, channel: &str) -> Result<(), SessionError> {
        if self.store.is_personal_member(&self.token, channel).await? {
            return Ok(());
        }
        self.store.add_personal_channel(&self.token, channel).await?;
        self.resubscribe().await
    }

    /// Remove a personal channel membership and refresh the bus
    /// subscription. Idempotent if the channel is not currently a member.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` if persistence fails.
    pub async fn unsubscribe(&self, channel: &str) -> Result<(), SessionError> {
        if !self.store.is_personal_member(&self.token, channel).await? {
            return Ok(());
        }
        self.store
            .remove_personal_channel(&self.token, channel)
            .await?;
        self.resubscribe().await
    }

    /// Publish a payload to a channel on the shared bus.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Bus` if the publish fails.
    pub async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), SessionError> {
        self.bus.publish(channel, payload).await?;
        Ok(())
    }

    /// Tear down the session: cancel the bus subscription, deregister from
    /// the hub, retire the presence record if this session still owns the
    /// token, close the outbound queue, and publish a best-effort
    /// "disconnected" notice.
    ///
    /// At most one call performs the teardown; concurrent and repeated
    /// calls return only after it has completed.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if !state.active {
            return;
        }
        if let Some(forward) = state.forward.take() {
            forward.abort();
        }

        let owner = self.hub.unregister(self).await;
        if owner {
            if let Err(e) = self.store.remove_presence(&self.token).await {
                warn!(device = %self.token, error = %e, "Presence removal failed");
            }
        }

        self.close_outbound();
        self.publish_notice("disconnected").await;

        // Cleared last: callers blocked on the state lock observe the flag
        // only once teardown has fully completed.
        state.active = false;
        debug!(device = %self.token, id = self.id, owner, "Session disconnected");
    }

    /// Try to queue an already-encoded envelope without blocking.
    ///
    /// Returns `false` when the queue is full or closed; the hub uses this
    /// to evict slow consumers instead of stalling a broadcast.
    #[must_use]
    pub fn try_queue(&self, payload: Bytes) -> bool {
        match self.sender() {
            Some(tx) => tx.try_send(payload).is_ok(),
            None => false,
        }
    }

    /// Close the outbound queue and raise the closed signal. Queue closure
    /// is the uniform cancellation signal: the writer finishes with a close
    /// frame, and the reader and forwarding loop stop.
    pub fn close_outbound(&self) {
        self.outbound.lock().expect("outbound queue lock").take();
        let _ = self.closed_tx.send(true);
    }

    fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.outbound.lock().expect("outbound queue lock").clone()
    }

    /// Replace the current bus subscription with one matching the effective
    /// channel set. An empty set leaves the session without a subscription,
    /// which is a valid state.
    async fn resubscribe(&self) -> Result<(), SessionError> {
        // Resolve the set before touching the old subscription so a store
        // failure leaves it intact.
        let channels = effective_channels(self.store.as_ref(), &self.token).await?;

        let mut state = self.state.lock().await;
        if !state.active {
            // Lost a reconnect race; the winning session owns the bus state.
            return Ok(());
        }
        if let Some(forward) = state.forward.take() {
            forward.abort();
        }
        if channels.is_empty() {
            debug!(device = %self.token, "No channels to subscribe");
            return Ok(());
        }

        let channels: Vec<String> = channels.into_iter().collect();
        let subscription = self.bus.subscribe(&channels).await?;
        debug!(device = %self.token, channels = channels.len(), "Bus subscription opened");

        // A closed queue means the session is already being retired; there
        // is nothing to forward to.
        if let Some(queue_tx) = self.sender() {
            state.forward = Some(tokio::spawn(forward_deliveries(
                self.token.clone(),
                subscription,
                queue_tx,
                self.closed_tx.subscribe(),
            )));
        }

        Ok(())
    }

    /// Best-effort lifecycle notice on the default broadcast channel.
    async fn publish_notice(&self, event: &str) {
        let payload = Bytes::from(format!("{} {event}", self.token));
        if let Err(e) = self.bus.publish(DEFAULT_CHANNEL, payload).await {
            warn!(device = %self.token, error = %e, "Lifecycle notice publish failed");
        }
    }
}

/// Copy bus deliveries into the outbound queue until the subscription
/// terminates, the queue closes, or the session is torn down. Stream
/// termination stops the forwarding; it never resubscribes.
async fn forward_deliveries(
    token: String,
    mut subscription: Box<dyn Subscription>,
    queue_tx: mpsc::Sender<Bytes>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
            delivery = subscription.next() => {
                let Some(delivery) = delivery else {
                    debug!(device = %token, "Subscription stream terminated");
                    break;
                };
                let content = String::from_utf8_lossy(&delivery.payload).into_owned();
                match codec::encode(&Outbound::delivery(content, delivery.channel)) {
                    Ok(payload) => {
                        if queue_tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(device = %token, error = %e, "Delivery encode failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    const QUEUE: usize = 16;

    fn setup() -> (Hub, Arc<MemoryStore>, Arc<MemoryBus>) {
        (
            Hub::spawn(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryBus::new()),
        )
    }

    async fn connect(
        token: &str,
        hub: &Hub,
        store: &Arc<MemoryStore>,
        bus: &Arc<MemoryBus>,
        queue_capacity: usize,
    ) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        Session::connect(
            token,
            hub.clone(),
            Arc::clone(store) as Arc<dyn ChannelStore>,
            Arc::clone(bus) as Arc<dyn PubSubBus>,
            queue_capacity,
        )
        .await
        .unwrap()
    }

    /// Wait until the queue yields a delivery with the given channel and
    /// content, skipping unrelated envelopes such as join/leave notices.
    async fn assert_delivered(rx: &mut mpsc::Receiver<Bytes>, channel: &str, content: &str) {
        loop {
            let raw = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out waiting for delivery")
                .expect("queue closed while waiting for delivery");
            match serde_json::from_slice::<Outbound>(&raw).unwrap() {
                Outbound::Delivery {
                    content: c,
                    channel: ch,
                } if ch == channel && c == content => return,
                _ => continue,
            }
        }
    }

    /// Assert that no delivery for the given channel arrives.
    async fn assert_no_delivery(rx: &mut mpsc::Receiver<Bytes>, channel: &str) {
        loop {
            match timeout(Duration::from_millis(200), rx.recv()).await {
                Err(_) | Ok(None) => return,
                Ok(Some(raw)) => {
                    if let Ok(Outbound::Delivery {
                        channel: ch,
                        content,
                    }) = serde_json::from_slice::<Outbound>(&raw)
                    {
                        assert_ne!(ch, channel, "unexpected delivery: {content}");
                    }
                }
            }
        }
    }

    /// Drain a queue until it closes; panics if it stays open.
    async fn assert_queue_closed(rx: &mut mpsc::Receiver<Bytes>) {
        loop {
            match timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => panic!("outbound queue was not closed"),
            }
        }
    }

    /// Store wrapper counting personal-membership writes.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryStore,
        personal_writes: AtomicUsize,
    }

    #[async_trait]
    impl ChannelStore for CountingStore {
        async fn add_presence(&self, token: &str) -> Result<(), StoreError> {
            self.inner.add_presence(token).await
        }
        async fn remove_presence(&self, token: &str) -> Result<(), StoreError> {
            self.inner.remove_presence(token).await
        }
        async fn list_presence(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_presence().await
        }
        async fn add_personal_channel(&self, token: &str, channel: &str) -> Result<(), StoreError> {
            self.personal_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.add_personal_channel(token, channel).await
        }
        async fn remove_personal_channel(
            &self,
            token: &str,
            channel: &str,
        ) -> Result<(), StoreError> {
            self.inner.remove_personal_channel(token, channel).await
        }
        async fn is_personal_member(&self, token: &str, channel: &str) -> Result<bool, StoreError> {
            self.inner.is_personal_member(token, channel).await
        }
        async fn add_global_channel(&self, channel: &str) -> Result<(), StoreError> {
            self.inner.add_global_channel(channel).await
        }
        async fn list_global_channels(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_global_channels().await
        }
        async fn list_personal_channels(&self, token: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_personal_channels(token).await
        }
    }

    /// Bus that refuses every operation.
    struct FailingBus;

    #[async_trait]
    impl PubSubBus for FailingBus {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<(), BusError> {
            Err(BusError::Publish("bus down".into()))
        }
        async fn subscribe(&self, _channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
            Err(BusError::Subscribe("bus down".into()))
        }
    }

    #[tokio::test]
    async fn test_reconnect_displaces_prior_session() {
        let (hub, store, bus) = setup();

        let (first, mut rx1) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        let (second, _rx2) = connect("dev1", &hub, &store, &bus, QUEUE).await;

        assert!(!first.is_active().await);
        assert!(second.is_active().await);

        // The first connection's queue is closed by the forced teardown.
        assert_queue_closed(&mut rx1).await;

        let current = hub.current("dev1").await.unwrap();
        assert_eq!(current.id(), second.id());

        // Presence survives the handover: the new session owns it.
        assert_eq!(store.list_presence().await.unwrap(), vec!["dev1"]);
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let hub = Hub::spawn();
        let store = Arc::new(CountingStore::default());
        let bus = Arc::new(MemoryBus::new());

        let (session, _rx) = Session::connect(
            "dev1",
            hub,
            Arc::clone(&store) as Arc<dyn ChannelStore>,
            bus as Arc<dyn PubSubBus>,
            QUEUE,
        )
        .await
        .unwrap();

        session.subscribe("random").await.unwrap();
        session.subscribe("random").await.unwrap();

        assert_eq!(store.personal_writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.list_personal_channels("dev1").await.unwrap(),
            vec!["random"]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (hub, store, bus) = setup();
        let (session, _rx) = connect("dev1", &hub, &store, &bus, QUEUE).await;

        // Not a member yet: success, no side effect.
        session.unsubscribe("random").await.unwrap();

        session.subscribe("random").await.unwrap();
        session.unsubscribe("random").await.unwrap();
        assert!(store
            .list_personal_channels("dev1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_membership_survives_reconnect() {
        let (hub, store, bus) = setup();

        let (session, _rx) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        session.subscribe("random").await.unwrap();
        session.disconnect().await;

        let (_session, mut rx) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        bus.publish("random", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_delivered(&mut rx, "random", "hello").await;
    }

    #[tokio::test]
    async fn test_broadcast_and_personal_routing() {
        let (hub, store, bus) = setup();
        store.add_global_channel("general").await.unwrap();

        let (_a, mut rx_a) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        let (b, mut rx_b) = connect("dev2", &hub, &store, &bus, QUEUE).await;
        b.subscribe("random").await.unwrap();

        bus.publish("general", Bytes::from_static(b"to-all"))
            .await
            .unwrap();
        assert_delivered(&mut rx_a, "general", "to-all").await;
        assert_delivered(&mut rx_b, "general", "to-all").await;

        bus.publish("random", Bytes::from_static(b"only-dev2"))
            .await
            .unwrap();
        assert_delivered(&mut rx_b, "random", "only-dev2").await;
        assert_no_delivery(&mut rx_a, "random").await;
    }

    #[tokio::test]
    async fn test_broadcast_evicts_slow_consumer() {
        let (hub, store, bus) = setup();

        let (_fast, mut fast_rx) = connect("fast", &hub, &store, &bus, QUEUE).await;
        // Capacity 1: the session's own join notice fills the queue.
        let (_slow, mut slow_rx) = connect("slow", &hub, &store, &bus, 1).await;

        let payload = codec::encode(&Outbound::delivery("overflow", DEFAULT_CHANNEL)).unwrap();
        hub.broadcast(payload);

        // The broadcast completes for the healthy session.
        assert_delivered(&mut fast_rx, DEFAULT_CHANNEL, "overflow").await;

        // The overflowing session is evicted and its queue closed.
        assert!(hub.current("slow").await.is_none());
        assert_queue_closed(&mut slow_rx).await;
    }

    #[tokio::test]
    async fn test_presence_tracks_registration() {
        let (hub, store, bus) = setup();

        let (session, _rx) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        assert_eq!(store.list_presence().await.unwrap(), vec!["dev1"]);

        session.disconnect().await;
        assert!(store.list_presence().await.unwrap().is_empty());
        assert!(hub.current("dev1").await.is_none());

        // A second disconnect is a no-op.
        session.disconnect().await;
    }

    #[tokio::test]
    async fn test_stale_disconnect_preserves_new_presence() {
        let (hub, store, bus) = setup();

        let (first, _rx1) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        let (_second, _rx2) = connect("dev1", &hub, &store, &bus, QUEUE).await;

        // E.g. the displaced connection's reader observing the closed
        // transport after the new session took over.
        first.disconnect().await;

        assert_eq!(store.list_presence().await.unwrap(), vec!["dev1"]);
        assert!(hub.current("dev1").await.is_some());
    }

    #[tokio::test]
    async fn test_publish_routing_round_trip() {
        let (hub, store, bus) = setup();

        let (session, mut rx) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        session.subscribe("random").await.unwrap();

        bus.publish("random", Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_delivered(&mut rx, "random", "hello").await;

        session.unsubscribe("random").await.unwrap();
        bus.publish("random", Bytes::from_static(b"hello2"))
            .await
            .unwrap();
        assert_no_delivery(&mut rx, "random").await;
    }

    #[tokio::test]
    async fn test_connected_with_no_channels() {
        let (hub, store, bus) = setup();

        // No global and no personal channels: a valid, subscription-less
        // session.
        let (session, _rx) = connect("dev1", &hub, &store, &bus, QUEUE).await;
        assert!(session.is_active().await);
        assert_eq!(store.list_presence().await.unwrap(), vec!["dev1"]);
    }

    #[tokio::test]
    async fn test_connect_bus_failure_aborts_session() {
        let (hub, store, _bus) = setup();
        // A non-empty channel set forces subscription setup.
        store.add_global_channel("general").await.unwrap();

        let result = Session::connect(
            "dev1",
            hub.clone(),
            Arc::clone(&store) as Arc<dyn ChannelStore>,
            Arc::new(FailingBus) as Arc<dyn PubSubBus>,
            QUEUE,
        )
        .await;

        assert!(matches!(result, Err(SessionError::Bus(_))));
        assert!(store.list_presence().await.unwrap().is_empty());
        assert!(hub.current("dev1").await.is_none());
    }
}
