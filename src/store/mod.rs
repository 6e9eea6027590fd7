//! 检查点存储抽象层
//!
//! 定义统一的检查点接口（按 run_id 保存 / 读取完整 RunState），支持内存、JSON 目录与 SQLite 三种实现。
//! 存储本身不检测过期覆盖：同一 run_id 的写入由调用方（引擎的运行锁）串行化。
//! 同一后端也保存按实体追加的活动日志，进程重启后时间线不丢。

pub mod json;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{StoreBackend, StoreSection};
use crate::core::activity::ActivityEntry;
use crate::core::state::{RunId, RunState};

pub use json::JsonCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// 存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Checkpoint not found: {0}")]
    NotFound(RunId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 覆盖写入 run_id 的完整状态（幂等）
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError>;

    /// 读取 run_id 的状态；从未保存过则返回 NotFound
    async fn load(&self, run_id: &str) -> Result<RunState, StoreError>;

    /// 列出全部 run_id（进程重启后重建运行目录用）
    async fn list(&self) -> Result<Vec<RunId>, StoreError>;

    /// 是否存在
    async fn exists(&self, run_id: &str) -> Result<bool, StoreError> {
        match self.load(run_id).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 追加一条实体活动；不支持的后端直接丢弃
    async fn append_activity(
        &self,
        _entity_id: &str,
        _entry: &ActivityEntry,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    /// 实体最近 limit 条活动，旧到新
    async fn load_activity(
        &self,
        _entity_id: &str,
        _limit: usize,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        Ok(Vec::new())
    }
}

/// 按配置创建检查点存储
///
/// memory 不跨进程；json / sqlite 未配置 path 时落在 data_dir 下的默认位置
pub fn open_store(
    section: &StoreSection,
    data_dir: &std::path::Path,
) -> Result<Arc<dyn CheckpointStore>, StoreError> {
    match section.backend {
        StoreBackend::Memory => {
            tracing::info!("Using in-memory checkpoint store");
            Ok(Arc::new(MemoryCheckpointStore::new()))
        }
        StoreBackend::Json => {
            let dir = section
                .path
                .clone()
                .unwrap_or_else(|| data_dir.join("checkpoints"));
            tracing::info!("Using JSON checkpoint store: {:?}", dir);
            Ok(Arc::new(JsonCheckpointStore::new(dir)))
        }
        StoreBackend::Sqlite => {
            let path = section
                .path
                .clone()
                .unwrap_or_else(|| data_dir.join("checkpoints.db"));
            tracing::info!("Using SQLite checkpoint store: {:?}", path);
            Ok(Arc::new(SqliteCheckpointStore::open(path)?))
        }
    }
}
