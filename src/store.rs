//! Result store collaborator.
//!
//! The bus itself never touches the store; handlers do. The trait keeps the
//! delivery pipeline independent of any particular database, and the
//! in-memory implementation backs the tests and demos.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{Error, Result};

/// Record written once per successfully completed unit of work.
///
/// Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedResult {
    // ---
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// Keyed storage for processing results.
#[async_trait::async_trait]
pub trait ResultStore: Send + Sync {
    // ---

    /// Insert a record. Inserting an id twice is an error; records are
    /// immutable once written.
    async fn insert(&self, record: ProcessedResult) -> Result<()>;

    /// Look up a record by work id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessedResult>>;
}

/// Shared store pointer.
pub type StorePtr = Arc<dyn ResultStore>;

/// In-process store for tests and demos.
#[derive(Default)]
pub struct MemoryResultStore {
    records: RwLock<HashMap<Uuid, ProcessedResult>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ResultStore for MemoryResultStore {
    // ---
    async fn insert(&self, record: ProcessedResult) -> Result<()> {
        // ---
        let mut records = self.records.write().await;

        if records.contains_key(&record.id) {
            return Err(Error::Store(format!(
                "result for '{}' already recorded",
                record.id
            )));
        }

        records.insert(record.id, record);
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessedResult>> {
        // ---
        Ok(self.records.read().await.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn record(id: Uuid) -> ProcessedResult {
        let now = Utc::now();
        ProcessedResult {
            id,
            created_at: now,
            processed_at: now,
            completed_at: now,
            data: serde_json::json!({"source": "test"}),
        }
    }

    #[tokio::test]
    async fn insert_then_find() {
        // ---
        let store = MemoryResultStore::new();
        let id = Uuid::new_v4();

        store.insert(record(id)).await.unwrap();

        let found = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(found.id, id);

        assert!(store.find_by_id(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        // ---
        let store = MemoryResultStore::new();
        let id = Uuid::new_v4();

        store.insert(record(id)).await.unwrap();
        assert!(matches!(
            store.insert(record(id)).await,
            Err(Error::Store(_))
        ));
    }
}
