//! Durable job records and the callback registry.
//!
//! A scheduled job holds a live notifier reference that cannot be
//! serialized. The store therefore persists intent, not behavior: records
//! carry a symbolic callback name plus plain arguments, and the registry
//! turns names back into live notifiers at rehydration.

pub mod disk;
pub mod memory;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::notify::Notifier;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job store I/O failed: {0}")]
    Io(String),
    #[error("job record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Durable projection of a subscription, keyed by subscriber identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJobRecord {
    pub subscriber_id: String,
    pub chat_address: String,
    pub query: String,
    pub callback_name: String,
    pub interval_seconds: u64,
    pub next_fire_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upserts the record for its subscriber; idempotent under identical
    /// input. I/O failures surface to the caller, never get swallowed.
    async fn persist(&self, record: &PersistedJobRecord) -> Result<(), StoreError>;

    /// Full scan for startup rehydration.
    async fn load_all(&self) -> Result<Vec<PersistedJobRecord>, StoreError>;

    /// Removes the record; a missing key is a no-op, not an error.
    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError>;
}

/// Process-wide map from symbolic callback names to live notifiers.
/// Populated once at startup by the owning scheduler; lookups afterwards
/// are pure data operations.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Arc<dyn Notifier>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, notifier: Arc<dyn Notifier>) {
        self.callbacks
            .write()
            .unwrap()
            .insert(name.to_string(), notifier);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Notifier>> {
        self.callbacks.read().unwrap().get(name).cloned()
    }
}
