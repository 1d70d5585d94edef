//! In-memory job store for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{JobStore, PersistedJobRecord, StoreError};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, PersistedJobRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent mutations fail, to exercise persistence error
    /// surfacing in callers.
    #[cfg(test)]
    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn persist(&self, record: &PersistedJobRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.jobs
            .lock()
            .await
            .insert(record.subscriber_id.clone(), record.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PersistedJobRecord>, StoreError> {
        Ok(self.jobs.lock().await.values().cloned().collect())
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        self.check_writable()?;
        self.jobs.lock().await.remove(subscriber_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(subscriber: &str) -> PersistedJobRecord {
        PersistedJobRecord {
            subscriber_id: subscriber.to_string(),
            chat_address: subscriber.to_string(),
            query: "1 usd".to_string(),
            callback_name: "conversion".to_string(),
            interval_seconds: 60,
            next_fire_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_delete() {
        let store = MemoryJobStore::new();
        store.persist(&record("alice")).await.unwrap();
        store.persist(&record("alice")).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        store.delete("alice").await.unwrap();
        store.delete("alice").await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryJobStore::new();
        store.fail_writes(true);
        assert!(store.persist(&record("alice")).await.is_err());
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
