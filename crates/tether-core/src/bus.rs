//! Publish/subscribe bus collaborator contract.
//!
//! The bus is the fan-out substrate sessions bridge their connections to.
//! A subscription covers a fixed set of channels and yields deliveries until
//! it is dropped or the backend fails; stream termination means "stop
//! forwarding", never "resubscribe automatically".

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Per-topic broadcast capacity for the in-process bus.
const TOPIC_CAPACITY: usize = 1024;

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing a payload failed.
    #[error("Bus publish failed: {0}")]
    Publish(String),

    /// Opening a subscription failed.
    #[error("Bus subscribe failed: {0}")]
    Subscribe(String),
}

/// A message delivered from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel the payload was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// Multi-topic publish/subscribe.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    /// Publish a payload to a channel.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError>;

    /// Open one subscription covering all of `channels`.
    ///
    /// Dropping the returned handle cancels the subscription.
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError>;
}

/// A cancellable stream of deliveries.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next delivery.
    ///
    /// Returns `None` once the subscription has terminated, either because
    /// it was cancelled or because the backend connection failed.
    async fn next(&mut self) -> Option<Delivery>;
}

/// In-process `PubSubBus`: one broadcast channel per topic.
///
/// Fan-out is process-local; cross-process fan-out is the concern of an
/// external bus implementing the same contract.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: DashMap<String, broadcast::Sender<Delivery>>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, channel: &str) -> broadcast::Sender<Delivery> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSubBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), BusError> {
        let sender = match self.topics.get(channel) {
            Some(entry) => entry.clone(),
            None => {
                trace!(channel = %channel, "Publish to channel without subscribers");
                return Ok(());
            }
        };

        let delivery = Delivery {
            channel: channel.to_string(),
            payload,
        };
        if sender.send(delivery).is_err() {
            // No live receivers left; prune the topic.
            self.topics.remove_if(channel, |_, s| s.receiver_count() == 0);
        }
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        let (merged_tx, merged_rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::with_capacity(channels.len());

        for channel in channels {
            let mut topic_rx = self.topic(channel).subscribe();
            let tx = merged_tx.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    match topic_rx.recv().await {
                        Ok(delivery) => {
                            if tx.send(delivery).is_err() {
                                break; // Subscription dropped
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Subscription lagged behind topic");
                        }
                    }
                }
            }));
        }

        Ok(Box::new(MemorySubscription {
            merged_rx,
            forwarders,
        }))
    }
}

/// Subscription over the in-process bus: per-topic forwarders feeding one
/// merged stream.
struct MemorySubscription {
    merged_rx: mpsc::UnboundedReceiver<Delivery>,
    forwarders: Vec<JoinHandle<()>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        self.merged_rx.recv().await
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}
