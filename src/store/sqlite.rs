//! SQLite 检查点存储
//!
//! run_checkpoints 表的 state_json 存完整 RunState；status / entity_id 冗余成列便于排查。
//! run_activity 表按实体追加活动日志。
//! rusqlite 是同步接口，所有调用放入 spawn_blocking，连接由 Mutex 串行化。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::activity::ActivityEntry;
use crate::core::state::{RunId, RunState};
use crate::store::{CheckpointStore, StoreError};

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCheckpointStore {
    /// 打开（必要时创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::from_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS run_checkpoints (
                run_id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                status TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_checkpoints_entity
            ON run_checkpoints (entity_id);
            CREATE TABLE IF NOT EXISTS run_activity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                entry_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_activity_entity
            ON run_activity (entity_id, id);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Task("sqlite connection lock poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        let entity_id = state.entity_id().to_string();
        let status = state.status().as_str();
        let json = serde_json::to_string(state)?;
        let updated_at_ms = state.updated_at().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO run_checkpoints (run_id, entity_id, status, state_json, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(run_id) DO UPDATE SET
                    entity_id = excluded.entity_id,
                    status = excluded.status,
                    state_json = excluded.state_json,
                    updated_at_ms = excluded.updated_at_ms",
                params![run_id, entity_id, status, json, updated_at_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        let id = run_id.to_string();
        let json: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT state_json FROM run_checkpoints WHERE run_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StoreError::NotFound(run_id.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<RunId>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT run_id FROM run_checkpoints ORDER BY run_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn append_activity(&self, entity_id: &str, entry: &ActivityEntry) -> Result<(), StoreError> {
        let entity_id = entity_id.to_string();
        let run_id = entry.run_id.clone();
        let json = serde_json::to_string(entry)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO run_activity (entity_id, run_id, entry_json) VALUES (?1, ?2, ?3)",
                params![entity_id, run_id, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_activity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        let entity_id = entity_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT entry_json FROM run_activity WHERE entity_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![entity_id, limit], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        let mut entries = rows
            .iter()
            .map(|json| serde_json::from_str(json))
            .collect::<Result<Vec<ActivityEntry>, _>>()?;
        entries.reverse();
        Ok(entries)
    }
}
