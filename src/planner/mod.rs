//! 规划层：Planner 抽象、原始回复归一化、LLM 适配与脚本化实现
//!
//! 引擎只认识 Decision 的两个变体；原始回复的各种形状在 parse 中收敛为统一格式。

pub mod llm;
pub mod parse;
pub mod scripted;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use llm::LlmPlanner;
pub use parse::parse_decision;
pub use scripted::ScriptedPlanner;

/// Planner 看到的消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannerRole {
    Instruction,
    Decision,
    ActionResult,
}

/// 历史投影后的单条消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerMessage {
    pub role: PlannerRole,
    pub content: String,
}

/// Planner 的决定：结束，或提议一个动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    Finish {
        #[serde(default)]
        summary: Option<String>,
    },
    ProposeAction {
        name: String,
        arguments: Map<String, Value>,
        #[serde(default)]
        rationale: Option<String>,
    },
}

impl Decision {
    pub fn finish() -> Self {
        Decision::Finish { summary: None }
    }

    pub fn propose(name: impl Into<String>, arguments: Value) -> Self {
        Decision::ProposeAction {
            name: name.into(),
            arguments: match arguments {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            rationale: None,
        }
    }
}

/// 规划失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Malformed planner response: {0}")]
    Malformed(String),
}

/// Planner 接口：给定完整历史，返回下一步决定
#[async_trait]
pub trait Planner: Send + Sync {
    async fn decide(&self, history: &[PlannerMessage]) -> Result<Decision, PlannerError>;
}
