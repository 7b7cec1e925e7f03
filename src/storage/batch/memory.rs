use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::BatchStore;
use crate::schedule::types::BatchRecord;

#[derive(Default)]
pub struct MemoryBatchStore {
    batches: RwLock<HashMap<String, BatchRecord>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn save(&self, batch: &BatchRecord) -> Result<()> {
        self.batches.write().await.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        Ok(self.batches.read().await.get(batch_id).cloned())
    }

    async fn list(&self) -> Result<Vec<BatchRecord>> {
        let mut batches: Vec<BatchRecord> = self.batches.read().await.values().cloned().collect();
        batches.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(batches)
    }

    async fn delete(&self, batch_id: &str) -> Result<bool> {
        Ok(self.batches.write().await.remove(batch_id).is_some())
    }
}
