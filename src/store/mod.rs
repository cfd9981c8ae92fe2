pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::StoreError;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// A document as loaded from durable storage.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub title: String,
    pub version: i64,
    pub state: Vec<u8>,
}

/// The durable document store collaborator. All methods are called from a
/// room task or its background write task, never under the registry lock.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the latest persisted state and metadata, `None` if the document
    /// has never been saved.
    async fn load_document(&self, document_id: Uuid) -> Result<Option<StoredDocument>, StoreError>;

    /// Write the full encoded state; increments and returns the document's
    /// version counter.
    async fn save_state(
        &self,
        document_id: Uuid,
        state: &[u8],
        saved_by: &str,
    ) -> Result<i64, StoreError>;

    /// Append an operation-log record for audit/recovery granularity.
    async fn append_operation_record(
        &self,
        document_id: Uuid,
        state: &[u8],
        version: i64,
        saved_by: &str,
    ) -> Result<(), StoreError>;

    /// Append a full snapshot record; snapshots bound crash-recovery cost
    /// independent of operation-log length.
    async fn append_snapshot_record(
        &self,
        document_id: Uuid,
        state: &[u8],
        version: i64,
    ) -> Result<(), StoreError>;
}
