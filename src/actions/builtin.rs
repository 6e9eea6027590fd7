//! 内置动作：echo（诊断用，非 gated）与 save_record（落盘记录，注册为 gated）

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use crate::actions::{Action, ActionOutput};

/// Echo 动作：回显文本
pub struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (diagnostics). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<ActionOutput, String> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("(empty)");
        Ok(text.into())
    }
}

/// 保存记录：把审批通过的参数作为一行 JSON 追加到文件
pub struct SaveRecordAction {
    path: PathBuf,
}

impl SaveRecordAction {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Action for SaveRecordAction {
    fn name(&self) -> &str {
        "save_record"
    }

    fn description(&self) -> &str {
        "Persist the final record (requires human approval). Args: {\"record\": {...}, \"summary\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "record": {"type": "object"},
                "summary": {"type": "string"}
            },
            "required": ["record"]
        })
    }

    async fn execute(&self, arguments: Map<String, Value>) -> Result<ActionOutput, String> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("create {}: {e}", parent.display()))?;
        }
        let line = serde_json::json!({
            "saved_at": chrono::Utc::now().to_rfc3339(),
            "record": arguments.get("record").cloned().unwrap_or(Value::Null),
            "summary": arguments.get("summary").cloned().unwrap_or(Value::Null),
        });
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| format!("open {}: {e}", self.path.display()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| format!("write {}: {e}", self.path.display()))?;

        let mut out = Map::new();
        out.insert("saved".into(), Value::Bool(true));
        out.insert("path".into(), Value::String(self.path.display().to_string()));
        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_echo_returns_text() {
        let out = EchoAction
            .execute(json!({"text": "hi"}).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(out, ActionOutput::Text("hi".into()));
    }

    #[tokio::test]
    async fn test_save_record_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("records.jsonl");
        let action = SaveRecordAction::new(&path);

        for qty in [1, 2] {
            let args = json!({"record": {"qty": qty}}).as_object().cloned().unwrap();
            let out = action.execute(args).await.unwrap();
            assert!(matches!(out, ActionOutput::Data(ref m) if m["saved"] == json!(true)));
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["record"]["qty"], json!(2));
    }
}
