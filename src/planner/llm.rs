//! LLM Planner：拼 system prompt（基础提示 + 动作目录 + 回复格式 Schema），
//! 把运行历史映射为对话消息，调用 LLM 后归一化回复。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde_json::Value;

use crate::actions::ActionDescriptor;
use crate::llm::mock::OBSERVATION_PREFIX;
use crate::llm::{ChatMessage, LlmClient};
use crate::planner::{parse_decision, Decision, Planner, PlannerError, PlannerMessage, PlannerRole};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an operations agent. Work one step at a time: \
either call exactly one action or finish. Actions marked (requires approval) are reviewed by a \
human before they run, so propose them only with complete, final arguments.";

/// 回复格式（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplyFormat {
    /// 任务完成，summary 为最终说明
    Finish { summary: Option<String> },
    /// 提议下一个动作
    ProposeAction {
        /// 动作名，必须出现在动作目录中
        name: String,
        /// 动作参数，须符合该动作的参数 Schema
        arguments: HashMap<String, Value>,
        /// 提议理由
        rationale: Option<String>,
    },
}

/// 返回回复格式的 JSON Schema 字符串，可拼入 system prompt
pub fn reply_schema_json() -> String {
    let schema = schema_for!(ReplyFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 渲染动作目录
pub fn render_catalog(catalog: &[ActionDescriptor]) -> String {
    let mut out = String::new();
    for action in catalog {
        let gate = if action.gated { " (requires approval)" } else { "" };
        out.push_str(&format!(
            "- {}{}: {}\n  parameters: {}\n",
            action.name, gate, action.description, action.parameters
        ));
    }
    out
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, base_prompt: &str, catalog: &[ActionDescriptor]) -> Self {
        let system_prompt = format!(
            "{base_prompt}\n\n## Actions\n{}\n## Reply format\nReply with a single JSON object matching this schema:\n{}",
            render_catalog(catalog),
            reply_schema_json()
        );
        Self { llm, system_prompt }
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    fn to_chat(&self, history: &[PlannerMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(history.iter().map(|m| match m.role {
            PlannerRole::Instruction => ChatMessage::user(m.content.clone()),
            PlannerRole::Decision => ChatMessage::assistant(m.content.clone()),
            PlannerRole::ActionResult => {
                ChatMessage::user(format!("{OBSERVATION_PREFIX} {}", m.content))
            }
        }));
        messages
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn decide(&self, history: &[PlannerMessage]) -> Result<Decision, PlannerError> {
        let raw = self
            .llm
            .complete(&self.to_chat(history))
            .await
            .map_err(PlannerError::Llm)?;
        tracing::debug!(raw = %raw, "planner reply");
        parse_decision(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatRole, MockLlmClient};
    use serde_json::json;
    use tokio::sync::Mutex;

    struct Recording {
        reply: Result<String, String>,
        seen: Mutex<Vec<ChatMessage>>,
    }

    #[async_trait]
    impl LlmClient for Recording {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, String> {
            *self.seen.lock().await = messages.to_vec();
            self.reply.clone()
        }
    }

    fn catalog() -> Vec<ActionDescriptor> {
        vec![
            ActionDescriptor {
                name: "check_inventory".into(),
                description: "Look up stock".into(),
                gated: false,
                parameters: json!({"type": "object"}),
            },
            ActionDescriptor {
                name: "save_logistics_plan".into(),
                description: "Commit the plan".into(),
                gated: true,
                parameters: json!({"type": "object", "required": ["carrier"]}),
            },
        ]
    }

    fn history() -> Vec<PlannerMessage> {
        vec![
            PlannerMessage {
                role: PlannerRole::Instruction,
                content: "route 500 units".into(),
            },
            PlannerMessage {
                role: PlannerRole::Decision,
                content: "Call check_inventory {}".into(),
            },
            PlannerMessage {
                role: PlannerRole::ActionResult,
                content: "check_inventory: 900 in stock".into(),
            },
        ]
    }

    #[tokio::test]
    async fn test_prompt_and_history_mapping() {
        let llm = Arc::new(Recording {
            reply: Ok(r#"{"tool_calls": [{"function": {"name": "save_logistics_plan", "arguments": "{\"carrier\": \"UPS\"}"}}]}"#.into()),
            seen: Mutex::new(Vec::new()),
        });
        let planner = LlmPlanner::new(llm.clone(), DEFAULT_SYSTEM_PROMPT, &catalog());

        let decision = planner.decide(&history()).await.unwrap();
        assert_eq!(decision, Decision::propose("save_logistics_plan", json!({"carrier": "UPS"})));

        let seen = llm.seen.lock().await;
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0].role, ChatRole::System);
        assert!(seen[0].content.contains("save_logistics_plan (requires approval)"));
        assert!(seen[0].content.contains("propose_action"));
        assert_eq!(seen[2].role, ChatRole::Assistant);
        assert!(seen[3].content.starts_with("Observation"));
    }

    #[tokio::test]
    async fn test_llm_failure_is_planner_error() {
        let llm = Arc::new(Recording {
            reply: Err("connection refused".into()),
            seen: Mutex::new(Vec::new()),
        });
        let planner = LlmPlanner::new(llm, DEFAULT_SYSTEM_PROMPT, &catalog());
        assert_eq!(
            planner.decide(&history()).await,
            Err(PlannerError::Llm("connection refused".into()))
        );
    }

    #[tokio::test]
    async fn test_mock_llm_second_turn_proposes_save() {
        let planner = LlmPlanner::new(Arc::new(MockLlmClient), DEFAULT_SYSTEM_PROMPT, &catalog());
        match planner.decide(&history()).await.unwrap() {
            Decision::ProposeAction { name, .. } => assert_eq!(name, "save_record"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
