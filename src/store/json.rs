//! JSON 目录检查点存储
//!
//! 每个 run 一个 JSON 文件；先写临时文件再 rename，避免进程中途退出留下半截检查点。
//! run_id 中非 [A-Za-z0-9_-] 的字符按 %XX 编码进文件名。
//! 活动日志放在 activity/ 子目录，每个实体一个 JSON Lines 文件，只追加。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::core::activity::ActivityEntry;
use crate::core::state::{RunId, RunState};
use crate::store::{CheckpointStore, StoreError};

#[derive(Debug)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_file_stem(run_id)))
    }

    fn activity_path(&self, entity_id: &str) -> PathBuf {
        self.dir
            .join("activity")
            .join(format!("{}.jsonl", encode_file_stem(entity_id)))
    }
}

fn encode_file_stem(run_id: &str) -> String {
    let mut out = String::with_capacity(run_id.len());
    for b in run_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_file_stem(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait]
impl CheckpointStore for JsonCheckpointStore {
    async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(run_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
        let path = self.path_for(run_id);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    async fn list(&self) -> Result<Vec<RunId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(id) = decode_file_stem(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn append_activity(&self, entity_id: &str, entry: &ActivityEntry) -> Result<(), StoreError> {
        let path = self.activity_path(entity_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_activity(
        &self,
        entity_id: &str,
        limit: usize,
    ) -> Result<Vec<ActivityEntry>, StoreError> {
        let data = match tokio::fs::read_to_string(self.activity_path(entity_id)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        // 半截的末行（写入中途退出）跳过
        let entries: Vec<ActivityEntry> = data
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        Ok(entries[entries.len().saturating_sub(limit)..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{HistoryEvent, Lineage, PendingAction};
    use serde_json::{json, Map};
    use tempfile::TempDir;

    #[test]
    fn test_file_stem_encoding_roundtrip() {
        for id in ["42", "42_v1700000000", "lead/7 x"] {
            assert_eq!(decode_file_stem(&encode_file_stem(id)).as_deref(), Some(id));
        }
        assert_eq!(encode_file_stem("a/b"), "a%2Fb");
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut context = Map::new();
        context.insert("qty".into(), json!(500));
        let mut state = RunState::new(
            "42_v1",
            "42",
            "retry",
            context,
            Some(Lineage {
                parent_run_id: "42".into(),
                feedback: "too slow".into(),
                attempt: 2,
            }),
        );
        state.push(HistoryEvent::Decision {
            content: "checking stock".into(),
        });
        state
            .suspend(PendingAction::new(
                "save_plan",
                json!({"carrier": "UPS"}).as_object().cloned().unwrap(),
            ))
            .unwrap();

        JsonCheckpointStore::new(dir.path())
            .save("42_v1", &state)
            .await
            .unwrap();

        let reopened = JsonCheckpointStore::new(dir.path());
        assert_eq!(reopened.load("42_v1").await.unwrap(), state);
        assert_eq!(reopened.list().await.unwrap(), vec!["42_v1".to_string()]);
        assert!(matches!(
            reopened.load("43").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_activity_is_appended_and_tail_loaded() {
        use crate::core::activity::ActivityKind;

        let dir = TempDir::new().unwrap();
        let store = JsonCheckpointStore::new(dir.path());
        for i in 0..3 {
            let entry = ActivityEntry {
                at: chrono::Utc::now(),
                run_id: "42".into(),
                kind: ActivityKind::System,
                message: format!("entry {i}"),
            };
            store.append_activity("42", &entry).await.unwrap();
        }
        let tail = store.load_activity("42", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].message, "entry 2");
        assert!(store.load_activity("7", 10).await.unwrap().is_empty());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_on_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonCheckpointStore::new(dir.path().join("never-created"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
