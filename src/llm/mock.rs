//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! 无状态：根据对话里已有的 Observation 条数决定下一步，
//! 依次回复 echo 调用、save_record 调用、finish，便于本地跑通「挂起 → 审批 → 完成」流程。

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{ChatMessage, ChatRole, LlmClient};

/// Observation 消息前缀，与 LlmPlanner 的历史映射一致
pub const OBSERVATION_PREFIX: &str = "Observation";

#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, String> {
        let instruction = messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let observations: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == ChatRole::User && m.content.starts_with(OBSERVATION_PREFIX))
            .map(|m| m.content.as_str())
            .collect();

        let reply = match observations.len() {
            0 => json!({
                "tool": "echo",
                "args": {"text": format!("Echo from Mock: {}", first_line(instruction))}
            }),
            1 => json!({
                "tool": "save_record",
                "args": {
                    "record": {
                        "instruction": first_line(instruction),
                        "note": observations[0],
                    },
                    "summary": "Mock draft ready for review"
                }
            }),
            _ => json!({"type": "finish", "summary": "Record saved."}),
        };
        Ok(reply.to_string())
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_walks_echo_save_finish() {
        let llm = MockLlmClient;
        let mut messages = vec![ChatMessage::system("rules"), ChatMessage::user("plan shipment")];

        let first = llm.complete(&messages).await.unwrap();
        assert!(first.contains("\"echo\""));

        messages.push(ChatMessage::user("Observation (echo): ok"));
        let second = llm.complete(&messages).await.unwrap();
        assert!(second.contains("\"save_record\""));

        messages.push(ChatMessage::user("Observation (save_record): saved"));
        let third = llm.complete(&messages).await.unwrap();
        assert!(third.contains("finish"));
    }
}
