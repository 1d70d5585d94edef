//! fjall-backed durable job store.

use std::path::Path;

use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use tracing::debug;

use super::{JobStore, PersistedJobRecord, StoreError};

/// Stores one record per subscriber in a keyspace partition. Every
/// mutation is a single atomic partition operation, so memory and durable
/// state cannot diverge halfway through an upsert or delete.
pub struct DiskJobStore {
    _keyspace: Keyspace,
    jobs: PartitionHandle,
}

impl DiskJobStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path).map_err(|e| StoreError::Io(e.to_string()))?;

        let keyspace = fjall::Config::new(path)
            .open()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let jobs = keyspace
            .open_partition("jobs", PartitionCreateOptions::default())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self {
            _keyspace: keyspace,
            jobs,
        })
    }
}

#[async_trait]
impl JobStore for DiskJobStore {
    async fn persist(&self, record: &PersistedJobRecord) -> Result<(), StoreError> {
        self.jobs
            .insert(record.subscriber_id.as_bytes(), serde_json::to_vec(record)?)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        debug!("Persisted job for subscriber {}", record.subscriber_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<PersistedJobRecord>, StoreError> {
        let mut records = Vec::new();
        for item in self.jobs.iter() {
            let (_, value) = item.map_err(|e| StoreError::Io(e.to_string()))?;
            records.push(serde_json::from_slice(&value)?);
        }
        debug!("Loaded {} persisted jobs", records.len());
        Ok(records)
    }

    async fn delete(&self, subscriber_id: &str) -> Result<(), StoreError> {
        self.jobs
            .remove(subscriber_id.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        debug!("Deleted job for subscriber {}", subscriber_id);
        Ok(())
    }
}
