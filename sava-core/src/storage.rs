use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::message::{Message, MessageHandle};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message {0} not found in store")]
    NotFound(MessageHandle),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The store collaborator. Owns message payloads and hands out handles;
/// `reclaim` is invoked by the broker once a message's live-reference count
/// has dropped to zero. Durability is the implementation's concern, not the
/// dispatch engine's.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Stores a message and returns its handle together with the shared
    /// content the broker circulates to queues.
    async fn store_message(&self, message: Message) -> Result<(MessageHandle, Arc<Message>), StoreError>;

    /// Looks up a stored, not-yet-reclaimed message.
    async fn message(&self, handle: MessageHandle) -> Result<Arc<Message>, StoreError>;

    /// Releases the message's storage. Only called once no references remain.
    async fn reclaim(&self, handle: MessageHandle) -> Result<(), StoreError>;
}

/// In-memory message store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: DashMap<MessageHandle, Arc<Message>>,
    next_handle: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently held, reclaimed ones excluded.
    pub fn stored_count(&self) -> usize {
        self.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn store_message(&self, message: Message) -> Result<(MessageHandle, Arc<Message>), StoreError> {
        let handle = MessageHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let message = Arc::new(message);
        self.messages.insert(handle, message.clone());
        Ok((handle, message))
    }

    async fn message(&self, handle: MessageHandle) -> Result<Arc<Message>, StoreError> {
        self.messages
            .get(&handle)
            .map(|entry| entry.clone())
            .ok_or(StoreError::NotFound(handle))
    }

    async fn reclaim(&self, handle: MessageHandle) -> Result<(), StoreError> {
        match self.messages.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(handle)),
        }
    }
}

/// Storage backend selection. A journal-backed store plugs in through the
/// `MessageStore` trait; the broker only ships the in-memory backend.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type")]
pub enum StorageConfig {
    #[serde(rename = "inmemory")]
    InMemory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::InMemory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_message(payload: &[u8]) -> Message {
        Message {
            payload: payload.to_vec(),
            headers: HashMap::new(),
            producer_name: "producer-test".to_string(),
            publish_time: 0,
            priority: 0,
            ttl: None,
        }
    }

    #[tokio::test]
    async fn store_and_fetch_round_trip() {
        let store = MemoryStore::new();
        let (handle, shared) = store.store_message(make_message(b"hello")).await.unwrap();
        assert_eq!(shared.size(), 5);

        let fetched = store.message(handle).await.unwrap();
        assert_eq!(fetched.payload, b"hello");
    }

    #[tokio::test]
    async fn reclaim_removes_message() {
        let store = MemoryStore::new();
        let (handle, _) = store.store_message(make_message(b"bye")).await.unwrap();
        assert_eq!(store.stored_count(), 1);

        store.reclaim(handle).await.unwrap();
        assert_eq!(store.stored_count(), 0);
        assert!(matches!(
            store.message(handle).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reclaim_twice_is_an_error() {
        let store = MemoryStore::new();
        let (handle, _) = store.store_message(make_message(b"x")).await.unwrap();
        store.reclaim(handle).await.unwrap();
        assert!(store.reclaim(handle).await.is_err());
    }
}
