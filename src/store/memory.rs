//! 内存检查点存储（测试与单进程场景）

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::activity::ActivityEntry;
use crate::core::state::{RunId, RunState};
use crate::store::{CheckpointStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    runs: RwLock<HashMap<RunId, RunState>>,
    activity: RwLock<HashMap<String, Vec<ActivityEntry>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .insert(run_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        self.runs
            .read()
            .await
            .get(run_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))
    }

    async fn list(&self) -> Result<Vec<RunId>, StoreError> {
        let mut ids: Vec<RunId> = self.runs.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_activity(&self, entity_id: &str, entry: &ActivityEntry) -> Result<(), StoreError> {
        self.activity
            .write()
            .await
            .entry(entity_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn load_activity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        let activity = self.activity.read().await;
        let entries = activity.get(entity_id).map(Vec::as_slice).unwrap_or_default();
        Ok(entries[entries.len().saturating_sub(limit)..].to_vec())
    }
}
