use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{DocumentStore, StoredDocument};
use crate::models::StoreError;

#[derive(Default)]
struct MemoryInner {
    documents: HashMap<Uuid, StoredDocument>,
    ops: Vec<(Uuid, i64, String)>,
    snapshots: Vec<(Uuid, i64)>,
}

/// In-memory document store. Backs the server when no database is
/// configured, and gives tests direct visibility into save traffic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    saves: AtomicU64,
    fail_saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Test hooks: visibility into save traffic and injectable write failures.
#[cfg(test)]
impl MemoryStore {
    /// Number of successful state writes so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make the next `n` saves fail, for retry-path tests.
    pub fn fail_next_saves(&self, n: u64) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    pub fn operation_records(&self, document_id: Uuid) -> Vec<(i64, String)> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|(d, _, _)| *d == document_id)
            .map(|(_, v, by)| (*v, by.clone()))
            .collect()
    }

    pub fn snapshot_count(&self, document_id: Uuid) -> usize {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .filter(|(d, _)| *d == document_id)
            .count()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load_document(&self, document_id: Uuid) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.inner.lock().unwrap().documents.get(&document_id).cloned())
    }

    async fn save_state(
        &self,
        document_id: Uuid,
        state: &[u8],
        _saved_by: &str,
    ) -> Result<i64, StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) > 0 {
            self.fail_saves.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected save failure".into()));
        }

        let mut inner = self.inner.lock().unwrap();
        let doc = inner
            .documents
            .entry(document_id)
            .or_insert_with(|| StoredDocument {
                title: "Untitled".to_string(),
                version: 0,
                state: Vec::new(),
            });
        doc.version += 1;
        doc.state = state.to_vec();
        let version = doc.version;
        drop(inner);

        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(version)
    }

    async fn append_operation_record(
        &self,
        document_id: Uuid,
        _state: &[u8],
        version: i64,
        saved_by: &str,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .push((document_id, version, saved_by.to_string()));
        Ok(())
    }

    async fn append_snapshot_record(
        &self,
        document_id: Uuid,
        _state: &[u8],
        version: i64,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .snapshots
            .push((document_id, version));
        Ok(())
    }
}
