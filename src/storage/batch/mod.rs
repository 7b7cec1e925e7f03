use anyhow::Result;
use async_trait::async_trait;

use crate::schedule::types::BatchRecord;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBatchStore;
pub use sqlite::SqliteBatchStore;

/// Persistence for batch records. `save` replaces the whole record, so a
/// reader never sees half of an update.
#[async_trait]
pub trait BatchStore: Send + Sync + 'static {
    async fn save(&self, batch: &BatchRecord) -> Result<()>;
    async fn get(&self, batch_id: &str) -> Result<Option<BatchRecord>>;
    /// All batches, oldest first.
    async fn list(&self) -> Result<Vec<BatchRecord>>;
    /// Returns whether a record was removed.
    async fn delete(&self, batch_id: &str) -> Result<bool>;
}
