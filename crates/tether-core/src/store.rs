//! Channel store collaborator contract.
//!
//! The store persists set membership: the global channel list, one personal
//! channel list per device token, and the presence set. Each operation is
//! atomic at single-key granularity; no cross-key transactions are assumed.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;
use thiserror::Error;

/// Store errors.
///
/// Surfaced to the caller of `Subscribe`/`Unsubscribe`/`Connect`; the
/// session stays in its prior subscription state when one occurs.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store rejected or failed the operation.
    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Persisted presence and channel-membership sets.
///
/// Implementations are responsible for their own internal concurrency
/// safety; callers treat each operation as an atomic black box.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Add a token to the presence set.
    async fn add_presence(&self, token: &str) -> Result<(), StoreError>;

    /// Remove a token from the presence set.
    async fn remove_presence(&self, token: &str) -> Result<(), StoreError>;

    /// List all present tokens.
    async fn list_presence(&self) -> Result<Vec<String>, StoreError>;

    /// Add a channel to a token's personal membership set.
    async fn add_personal_channel(&self, token: &str, channel: &str) -> Result<(), StoreError>;

    /// Remove a channel from a token's personal membership set.
    async fn remove_personal_channel(&self, token: &str, channel: &str) -> Result<(), StoreError>;

    /// Whether a channel is in a token's personal membership set.
    async fn is_personal_member(&self, token: &str, channel: &str) -> Result<bool, StoreError>;

    /// Add a channel to the global channel set.
    async fn add_global_channel(&self, channel: &str) -> Result<(), StoreError>;

    /// List the global channels every device is implicitly subscribed to.
    async fn list_global_channels(&self) -> Result<Vec<String>, StoreError>;

    /// List a token's personal channels.
    async fn list_personal_channels(&self, token: &str) -> Result<Vec<String>, StoreError>;
}

/// Resolve a token's effective channel set: global ∪ personal.
///
/// # Errors
///
/// Returns an error if either membership read fails.
pub async fn effective_channels(
    store: &dyn ChannelStore,
    token: &str,
) -> Result<BTreeSet<String>, StoreError> {
    let mut channels: BTreeSet<String> = store.list_global_channels().await?.into_iter().collect();
    channels.extend(store.list_personal_channels(token).await?);
    Ok(channels)
}

/// In-process `ChannelStore` backed by concurrent sets.
#[derive(Debug, Default)]
pub struct MemoryStore {
    presence: DashSet<String>,
    global: DashSet<String>,
    personal: DashMap<String, DashSet<String>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryStore {
    async fn add_presence(&self, token: &str) -> Result<(), StoreError> {
        self.presence.insert(token.to_string());
        Ok(())
    }

    async fn remove_presence(&self, token: &str) -> Result<(), StoreError> {
        self.presence.remove(token);
        Ok(())
    }

    async fn list_presence(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.presence.iter().map(|t| t.key().clone()).collect())
    }

    async fn add_personal_channel(&self, token: &str, channel: &str) -> Result<(), StoreError> {
        self.personal
            .entry(token.to_string())
            .or_default()
            .insert(channel.to_string());
        Ok(())
    }

    async fn remove_personal_channel(&self, token: &str, channel: &str) -> Result<(), StoreError> {
        if let Some(set) = self.personal.get(token) {
            set.remove(channel);
        }
        Ok(())
    }

    async fn is_personal_member(&self, token: &str, channel: &str) -> Result<bool, StoreError> {
        Ok(self
            .personal
            .get(token)
            .map(|set| set.contains(channel))
            .unwrap_or(false))
    }

    async fn add_global_channel(&self, channel: &str) -> Result<(), StoreError> {
        self.global.insert(channel.to_string());
        Ok(())
    }

    async fn list_global_channels(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.global.iter().map(|c| c.key().clone()).collect())
    }

    async fn list_personal_channels(&self, token: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .personal
            .get(token)
            .map(|set| set.iter().map(|c| c.key().clone()).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_presence_membership() {
        let store = MemoryStore::new();

        store.add_presence("dev1").await.unwrap();
        store.add_presence("dev1").await.unwrap();
        assert_eq!(store.list_presence().await.unwrap(), vec!["dev1"]);

        store.remove_presence("dev1").await.unwrap();
        assert!(store.list_presence().await.unwrap().is_empty());

        // Removing an absent token is a no-op.
        store.remove_presence("dev1").await.unwrap();
    }

    #[tokio::test]
    async fn test_personal_channels() {
        let store = MemoryStore::new();

        assert!(!store.is_personal_member("dev1", "random").await.unwrap());
        store.add_personal_channel("dev1", "random").await.unwrap();
        assert!(store.is_personal_member("dev1", "random").await.unwrap());
        assert_eq!(
            store.list_personal_channels("dev1").await.unwrap(),
            vec!["random"]
        );

        store
            .remove_personal_channel("dev1", "random")
            .await
            .unwrap();
        assert!(!store.is_personal_member("dev1", "random").await.unwrap());
    }

    #[tokio::test]
    async fn test_effective_channels_union() {
        let store = MemoryStore::new();

        store.add_global_channel("general").await.unwrap();
        store.add_global_channel("random").await.unwrap();
        store.add_personal_channel("dev1", "private").await.unwrap();
        store.add_personal_channel("dev1", "general").await.unwrap();

        let channels = effective_channels(&store, "dev1").await.unwrap();
        let expected: BTreeSet<String> = ["general", "random", "private"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(channels, expected);

        // A token with no personal channels still sees the globals.
        let channels = effective_channels(&store, "dev2").await.unwrap();
        assert_eq!(channels.len(), 2);
    }
}
