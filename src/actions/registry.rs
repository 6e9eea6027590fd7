//! 动作注册表
//!
//! 所有动作实现 Action trait（name / description / parameters_schema / validate / execute），
//! 由 ActionRegistry 按名注册，并记录是否需要人工审批（gated）与可选的执行期限。
//! invoke 先校验参数形状再执行；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::timeout;

/// 动作输出：纯文本或结构化对象
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionOutput {
    Text(String),
    Data(Map<String, Value>),
}

impl fmt::Display for ActionOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionOutput::Text(s) => f.write_str(s),
            ActionOutput::Data(map) => write!(f, "{}", Value::Object(map.clone())),
        }
    }
}

impl From<String> for ActionOutput {
    fn from(s: String) -> Self {
        ActionOutput::Text(s)
    }
}

impl From<&str> for ActionOutput {
    fn from(s: &str) -> Self {
        ActionOutput::Text(s.to_string())
    }
}

impl From<Map<String, Value>> for ActionOutput {
    fn from(map: Map<String, Value>) -> Self {
        ActionOutput::Data(map)
    }
}

/// 动作调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    Unknown(String),

    #[error("Invalid arguments for {action}: {message}")]
    InvalidArguments { action: String, message: String },

    #[error("Action {action} failed: {message}")]
    Failed { action: String, message: String },

    #[error("Action {action} exceeded its {secs}s deadline")]
    DeadlineExceeded { action: String, secs: u64 },
}

/// 动作 trait：名称、描述（供 Planner 理解）、参数 schema、形状校验、异步执行
#[async_trait]
pub trait Action: Send + Sync {
    /// 动作名称（Planner 提议时使用）
    fn name(&self) -> &str;

    /// 动作描述
    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认不限参数
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行前的参数形状校验；默认按 schema 的 required 与 properties.type 检查
    fn validate(&self, arguments: &Map<String, Value>) -> Result<(), String> {
        check_against_schema(&self.parameters_schema(), arguments)
    }

    /// 执行动作；Err 表示业务失败（如上游不可用）
    async fn execute(&self, arguments: Map<String, Value>) -> Result<ActionOutput, String>;
}

/// 供 Planner 提示词使用的动作目录条目
#[derive(Debug, Clone, Serialize)]
pub struct ActionDescriptor {
    pub name: String,
    pub description: String,
    pub gated: bool,
    pub parameters: Value,
}

struct Registered {
    action: Arc<dyn Action>,
    gated: bool,
    deadline: Option<Duration>,
}

/// 动作注册表：按名称存储 Arc<dyn Action> 及其审批标记
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Registered>,
    default_deadline: Option<Duration>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为之后注册且未单独指定期限的动作设置默认执行期限
    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn register(&mut self, action: impl Action + 'static, gated: bool) {
        let deadline = self.default_deadline;
        self.insert(Arc::new(action), gated, deadline);
    }

    pub fn register_with_deadline(
        &mut self,
        action: impl Action + 'static,
        gated: bool,
        deadline: Duration,
    ) {
        self.insert(Arc::new(action), gated, Some(deadline));
    }

    fn insert(&mut self, action: Arc<dyn Action>, gated: bool, deadline: Option<Duration>) {
        let name = action.name().to_string();
        if self.actions.contains_key(&name) {
            tracing::warn!(action = %name, "Action re-registered, replacing previous handler");
        }
        self.actions.insert(
            name,
            Registered {
                action,
                gated,
                deadline,
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// 未注册的动作视为非 gated；引擎会先用 contains 拦截未知动作
    pub fn is_gated(&self, name: &str) -> bool {
        self.actions.get(name).map(|r| r.gated).unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    /// 动作目录（按名称排序，保证提示词稳定）
    pub fn catalog(&self) -> Vec<ActionDescriptor> {
        let mut catalog: Vec<ActionDescriptor> = self
            .actions
            .iter()
            .map(|(name, r)| ActionDescriptor {
                name: name.clone(),
                description: r.action.description().to_string(),
                gated: r.gated,
                parameters: r.action.parameters_schema(),
            })
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// 只校验不执行（gated 动作挂起前使用）
    pub fn validate(&self, name: &str, arguments: &Map<String, Value>) -> Result<(), ActionError> {
        let registered = self
            .actions
            .get(name)
            .ok_or_else(|| ActionError::Unknown(name.to_string()))?;
        registered
            .action
            .validate(arguments)
            .map_err(|message| ActionError::InvalidArguments {
                action: name.to_string(),
                message,
            })
    }

    /// 校验并执行；超过期限返回 DeadlineExceeded
    pub async fn invoke(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ActionOutput, ActionError> {
        let registered = self
            .actions
            .get(name)
            .ok_or_else(|| ActionError::Unknown(name.to_string()))?;
        self.validate(name, &arguments)?;

        let start = Instant::now();
        let preview = args_preview(&arguments);
        let action = Arc::clone(&registered.action);
        let result = match registered.deadline {
            Some(deadline) => match timeout(deadline, action.execute(arguments)).await {
                Ok(r) => r.map_err(|message| ActionError::Failed {
                    action: name.to_string(),
                    message,
                }),
                Err(_) => Err(ActionError::DeadlineExceeded {
                    action: name.to_string(),
                    secs: deadline.as_secs(),
                }),
            },
            None => action
                .execute(arguments)
                .await
                .map_err(|message| ActionError::Failed {
                    action: name.to_string(),
                    message,
                }),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ActionError::DeadlineExceeded { .. }) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": name,
            "gated": registered.gated,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit, "action");

        result
    }
}

fn args_preview(arguments: &Map<String, Value>) -> String {
    let s = Value::Object(arguments.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 按 JSON Schema 的 required 与 properties.*.type 做最小形状检查
pub fn check_against_schema(schema: &Value, arguments: &Map<String, Value>) -> Result<(), String> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            match arguments.get(key) {
                None | Some(Value::Null) => return Err(format!("missing required field `{key}`")),
                Some(_) => {}
            }
        }
    }
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (key, prop) in props {
            let (Some(value), Some(expected)) =
                (arguments.get(key), prop.get("type").and_then(Value::as_str))
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(format!("field `{key}` must be {expected}"));
            }
        }
    }
    Ok(())
}
