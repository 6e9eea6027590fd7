//! 活动日志：按实体聚合、跨分支的时间线，供界面轮询
//!
//! 每个实体在内存中保留最近 capacity 条。挂上检查点存储后条目同时写入存储，
//! 重启后首次访问某实体时从存储回填；内存里的实体数超过上限时淘汰最久没有动静的那个，
//! 需要时再回填。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::core::state::RunId;
use crate::store::CheckpointStore;

pub const DEFAULT_ACTIVITY_CAPACITY: usize = 500;
pub const DEFAULT_CACHED_ENTITIES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    System,
    Thought,
    Action,
    ActionResult,
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ActivityKind::System => "system",
            ActivityKind::Thought => "thought",
            ActivityKind::Action => "action",
            ActivityKind::ActionResult => "action_result",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: DateTime<Utc>,
    pub run_id: RunId,
    pub kind: ActivityKind,
    pub message: String,
}

pub struct ActivityLog {
    entries: RwLock<HashMap<String, VecDeque<ActivityEntry>>>,
    capacity: usize,
    max_entities: usize,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ACTIVITY_CAPACITY)
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_entities: DEFAULT_CACHED_ENTITIES,
            store: None,
        }
    }

    /// 条目写穿到存储；只有挂了存储才会淘汰内存中的实体
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_entities(mut self, max_entities: usize) -> Self {
        self.max_entities = max_entities.max(1);
        self
    }

    pub async fn record(
        &self,
        entity_id: &str,
        run_id: &str,
        kind: ActivityKind,
        message: impl Into<String>,
    ) {
        let entry = ActivityEntry {
            at: Utc::now(),
            run_id: run_id.to_string(),
            kind,
            message: message.into(),
        };

        let mut entries = self.entries.write().await;
        if !entries.contains_key(entity_id) {
            let loaded = self.load_persisted(entity_id).await;
            self.make_room(&mut entries);
            entries.insert(entity_id.to_string(), loaded);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.append_activity(entity_id, &entry).await {
                tracing::warn!(entity_id = %entity_id, error = %e, "Failed to persist activity entry");
            }
        }
        let log = entries.entry(entity_id.to_string()).or_default();
        if log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(entry);
    }

    /// 该实体的全部条目（旧到新）
    pub async fn entries(&self, entity_id: &str) -> Vec<ActivityEntry> {
        if let Some(log) = self.entries.read().await.get(entity_id) {
            return log.iter().cloned().collect();
        }
        if self.store.is_none() {
            return Vec::new();
        }

        let mut entries = self.entries.write().await;
        if !entries.contains_key(entity_id) {
            let loaded = self.load_persisted(entity_id).await;
            if loaded.is_empty() {
                return Vec::new();
            }
            self.make_room(&mut entries);
            entries.insert(entity_id.to_string(), loaded);
        }
        entries
            .get(entity_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 内存中缓存的实体数
    pub async fn cached_entities(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn load_persisted(&self, entity_id: &str) -> VecDeque<ActivityEntry> {
        let Some(store) = &self.store else {
            return VecDeque::new();
        };
        match store.load_activity(entity_id, self.capacity).await {
            Ok(loaded) => loaded.into(),
            Err(e) => {
                tracing::warn!(entity_id = %entity_id, error = %e, "Failed to load activity");
                VecDeque::new()
            }
        }
    }

    fn make_room(&self, entries: &mut HashMap<String, VecDeque<ActivityEntry>>) {
        if self.store.is_none() || entries.len() < self.max_entities {
            return;
        }
        let stalest = entries
            .iter()
            .min_by_key(|(_, log)| log.back().map(|e| e.at))
            .map(|(entity_id, _)| entity_id.clone());
        if let Some(entity_id) = stalest {
            entries.remove(&entity_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JsonCheckpointStore, MemoryCheckpointStore};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_entries_are_ordered_and_bounded() {
        let log = ActivityLog::with_capacity(2);
        log.record("42", "42", ActivityKind::System, "started").await;
        log.record("42", "42", ActivityKind::Thought, "checking").await;
        log.record("42", "42_v1", ActivityKind::Action, "save").await;
        log.record("7", "7", ActivityKind::System, "other").await;

        let entries = log.entries("42").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ActivityKind::Thought);
        assert_eq!(entries[1].run_id, "42_v1");
        assert!(log.entries("missing").await.is_empty());
    }

    #[tokio::test]
    async fn test_timeline_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let log = ActivityLog::new().with_store(Arc::new(JsonCheckpointStore::new(dir.path())));
            log.record("42", "42", ActivityKind::System, "Run 42 started").await;
            log.record("42", "42", ActivityKind::Action, "Awaiting approval: save").await;
        }

        let log = ActivityLog::new().with_store(Arc::new(JsonCheckpointStore::new(dir.path())));
        log.record("42", "42", ActivityKind::Action, "Approved: executing save").await;
        let messages: Vec<String> = log
            .entries("42")
            .await
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(
            messages,
            vec![
                "Run 42 started",
                "Awaiting approval: save",
                "Approved: executing save"
            ]
        );
    }

    #[tokio::test]
    async fn test_evicted_entities_reload_from_store() {
        let log = ActivityLog::new()
            .with_store(Arc::new(MemoryCheckpointStore::new()))
            .with_max_entities(2);
        for entity in ["a", "b", "c"] {
            log.record(entity, entity, ActivityKind::System, format!("{entity} started"))
                .await;
        }
        assert_eq!(log.cached_entities().await, 2);

        let a = log.entries("a").await;
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].message, "a started");
        assert_eq!(log.cached_entities().await, 2);
    }
}
