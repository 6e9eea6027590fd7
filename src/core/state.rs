//! 运行状态：RunState 检查点与状态迁移
//!
//! RunState 是持久化的完整快照（状态、历史、待审批动作、血缘、失败原因）。
//! 所有状态迁移都经过这里的方法，保证「pending_action 存在 ⇔ SUSPENDED_FOR_APPROVAL」
//! 与「failure 存在 ⇔ FAILED」两条不变式。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::actions::ActionOutput;
use crate::core::RunError;
use crate::planner::{PlannerMessage, PlannerRole};

pub type RunId = String;

/// 运行状态（序列化为 RUNNING / SUSPENDED_FOR_APPROVAL / COMPLETED / FAILED）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    SuspendedForApproval,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::SuspendedForApproval => "SUSPENDED_FOR_APPROVAL",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 等待人工审批的动作：名称与完全解析后的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub name: String,
    pub arguments: Map<String, Value>,
    pub proposed_at: DateTime<Utc>,
}

impl PendingAction {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            proposed_at: Utc::now(),
        }
    }
}

/// 分支血缘：从哪个运行分出、触发分支的人工反馈、第几次尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lineage {
    pub parent_run_id: RunId,
    pub feedback: String,
    pub attempt: u32,
}

/// 失败原因；StepBudgetExceeded 单独成类，便于区分「卡在循环里」与「出错」
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    StepBudgetExceeded { limit: u32 },
    PlannerError { message: String },
    ValidationError {
        action: String,
        arguments: Map<String, Value>,
        message: String,
    },
    UnknownAction { name: String },
    ActionFailed { action: String, message: String },
    Aborted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StepBudgetExceeded { limit } => {
                write!(f, "step budget exceeded ({limit} turns)")
            }
            FailureReason::PlannerError { message } => write!(f, "planner error: {message}"),
            FailureReason::ValidationError { action, message, .. } => {
                write!(f, "invalid arguments for {action}: {message}")
            }
            FailureReason::UnknownAction { name } => write!(f, "unknown action: {name}"),
            FailureReason::ActionFailed { action, message } => {
                write!(f, "action {action} failed: {message}")
            }
            FailureReason::Aborted => f.write_str("aborted"),
        }
    }
}

/// 动作执行结果（记录到历史）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success { output: ActionOutput },
    Failure { error: String },
}

/// 历史事件：指令、规划发言、挂起、动作调用、动作结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    Instruction { content: String },
    Decision { content: String },
    Suspended { action: PendingAction },
    ActionInvoked {
        name: String,
        arguments: Map<String, Value>,
        gated: bool,
    },
    ActionResult { name: String, outcome: ActionOutcome },
}

/// 带序号与时间戳的历史条目；序号即因果顺序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: HistoryEvent,
}

/// 一次运行的完整检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    run_id: RunId,
    entity_id: String,
    status: RunStatus,
    history: Vec<HistoryEntry>,
    pending_action: Option<PendingAction>,
    lineage: Option<Lineage>,
    #[serde(default)]
    context: Map<String, Value>,
    failure: Option<FailureReason>,
    #[serde(default)]
    steps: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RunState {
    /// 新建运行：状态 RUNNING，首条历史为初始指令
    pub fn new(
        run_id: impl Into<RunId>,
        entity_id: impl Into<String>,
        instruction: impl Into<String>,
        context: Map<String, Value>,
        lineage: Option<Lineage>,
    ) -> Self {
        let now = Utc::now();
        let mut state = Self {
            run_id: run_id.into(),
            entity_id: entity_id.into(),
            status: RunStatus::Running,
            history: Vec::new(),
            pending_action: None,
            lineage,
            context,
            failure: None,
            steps: 0,
            created_at: now,
            updated_at: now,
        };
        state.push(HistoryEvent::Instruction {
            content: instruction.into(),
        });
        state
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn pending_action(&self) -> Option<&PendingAction> {
        self.pending_action.as_ref()
    }

    pub fn lineage(&self) -> Option<&Lineage> {
        self.lineage.as_ref()
    }

    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// 初始指令文本（历史首条）
    pub fn instruction(&self) -> Option<&str> {
        self.history.iter().find_map(|e| match &e.event {
            HistoryEvent::Instruction { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// 追加历史；只增不删
    pub fn push(&mut self, event: HistoryEvent) {
        let seq = self.history.last().map(|e| e.seq + 1).unwrap_or(0);
        let at = Utc::now();
        self.history.push(HistoryEntry { seq, at, event });
        self.updated_at = at;
    }

    pub(crate) fn count_step(&mut self) {
        self.steps += 1;
    }

    /// RUNNING -> SUSPENDED_FOR_APPROVAL，同时写入 suspended 历史
    pub fn suspend(&mut self, action: PendingAction) -> Result<(), RunError> {
        self.ensure(RunStatus::Running)?;
        self.push(HistoryEvent::Suspended {
            action: action.clone(),
        });
        self.pending_action = Some(action);
        self.status = RunStatus::SuspendedForApproval;
        Ok(())
    }

    /// SUSPENDED_FOR_APPROVAL -> RUNNING，取出待执行动作
    pub fn take_pending(&mut self) -> Result<PendingAction, RunError> {
        self.ensure(RunStatus::SuspendedForApproval)?;
        let action = self.pending_action.take().ok_or_else(|| RunError::InvalidState {
            run_id: self.run_id.clone(),
            status: self.status,
        })?;
        self.status = RunStatus::Running;
        self.updated_at = Utc::now();
        Ok(action)
    }

    /// RUNNING -> COMPLETED
    pub fn complete(&mut self) -> Result<(), RunError> {
        self.ensure(RunStatus::Running)?;
        self.status = RunStatus::Completed;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// 任意非终态 -> FAILED；挂起中的动作随之作废
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), RunError> {
        if self.status.is_terminal() {
            return Err(self.invalid_state());
        }
        self.pending_action = None;
        self.failure = Some(reason);
        self.status = RunStatus::Failed;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure(&self, expected: RunStatus) -> Result<(), RunError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.invalid_state())
        }
    }

    pub(crate) fn invalid_state(&self) -> RunError {
        RunError::InvalidState {
            run_id: self.run_id.clone(),
            status: self.status,
        }
    }

    /// 投影为 Planner 可见的消息序列（suspended 条目不是发言，跳过）
    pub fn planner_view(&self) -> Vec<PlannerMessage> {
        self.history
            .iter()
            .filter_map(|entry| match &entry.event {
                HistoryEvent::Instruction { content } => Some(PlannerMessage {
                    role: PlannerRole::Instruction,
                    content: content.clone(),
                }),
                HistoryEvent::Decision { content } => Some(PlannerMessage {
                    role: PlannerRole::Decision,
                    content: content.clone(),
                }),
                HistoryEvent::Suspended { .. } => None,
                HistoryEvent::ActionInvoked {
                    name, arguments, ..
                } => Some(PlannerMessage {
                    role: PlannerRole::Decision,
                    content: format!("Call {} {}", name, Value::Object(arguments.clone())),
                }),
                HistoryEvent::ActionResult { name, outcome } => Some(PlannerMessage {
                    role: PlannerRole::ActionResult,
                    content: match outcome {
                        ActionOutcome::Success { output } => format!("{name}: {output}"),
                        ActionOutcome::Failure { error } => format!("{name} failed: {error}"),
                    },
                }),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_run_starts_running_with_instruction() {
        let state = RunState::new("42", "42", "route 500 units", Map::new(), None);
        assert_eq!(state.status(), RunStatus::Running);
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.instruction(), Some("route 500 units"));
        assert!(state.pending_action().is_none());
    }

    #[test]
    fn test_suspend_and_take_pending_keep_invariant() {
        let mut state = RunState::new("r", "e", "go", Map::new(), None);
        state
            .suspend(PendingAction::new("save", args(json!({"x": 1}))))
            .unwrap();
        assert_eq!(state.status(), RunStatus::SuspendedForApproval);
        assert_eq!(state.pending_action().unwrap().name, "save");
        assert!(matches!(
            state.history().last().unwrap().event,
            HistoryEvent::Suspended { .. }
        ));

        let pending = state.take_pending().unwrap();
        assert_eq!(pending.arguments, args(json!({"x": 1})));
        assert_eq!(state.status(), RunStatus::Running);
        assert!(state.pending_action().is_none());
    }

    #[test]
    fn test_take_pending_requires_suspension() {
        let mut state = RunState::new("r", "e", "go", Map::new(), None);
        assert!(matches!(
            state.take_pending(),
            Err(RunError::InvalidState { status: RunStatus::Running, .. })
        ));
    }

    #[test]
    fn test_fail_clears_pending_and_rejects_terminal() {
        let mut state = RunState::new("r", "e", "go", Map::new(), None);
        state.suspend(PendingAction::new("save", Map::new())).unwrap();
        state.fail(FailureReason::Aborted).unwrap();
        assert_eq!(state.status(), RunStatus::Failed);
        assert!(state.pending_action().is_none());
        assert_eq!(state.failure(), Some(&FailureReason::Aborted));
        assert!(state.fail(FailureReason::Aborted).is_err());
    }

    #[test]
    fn test_history_sequence_is_monotonic() {
        let mut state = RunState::new("r", "e", "go", Map::new(), None);
        state.push(HistoryEvent::Decision {
            content: "thinking".into(),
        });
        state.push(HistoryEvent::Decision {
            content: "more".into(),
        });
        let seqs: Vec<u64> = state.history().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_planner_view_skips_suspension_entries() {
        let mut state = RunState::new("r", "e", "go", Map::new(), None);
        state.push(HistoryEvent::ActionInvoked {
            name: "lookup".into(),
            arguments: args(json!({"q": "x"})),
            gated: false,
        });
        state.push(HistoryEvent::ActionResult {
            name: "lookup".into(),
            outcome: ActionOutcome::Failure {
                error: "upstream down".into(),
            },
        });
        state.suspend(PendingAction::new("save", Map::new())).unwrap();

        let view = state.planner_view();
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].role, PlannerRole::Instruction);
        assert_eq!(view[1].role, PlannerRole::Decision);
        assert_eq!(view[2].role, PlannerRole::ActionResult);
        assert!(view[2].content.contains("upstream down"));
    }

    #[test]
    fn test_status_serializes_screaming_snake_case() {
        let s = serde_json::to_string(&RunStatus::SuspendedForApproval).unwrap();
        assert_eq!(s, "\"SUSPENDED_FOR_APPROVAL\"");
    }
}
