//! 运行监管：启动、审批、驳回分支、中止与状态查询
//!
//! 唯一调用引擎 create / drive / resume 的组件。RunDirectory 记录每个实体当前的 run_id，
//! 只在 launch / branch 时修改。launch 与 branch 在检查点写入后立即返回，驱动循环放到后台任务。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::core::activity::ActivityEntry;
use crate::core::engine::{RunEngine, RunOutcome, RunSeed};
use crate::core::state::{
    FailureReason, HistoryEntry, Lineage, PendingAction, RunId, RunState, RunStatus,
};
use crate::core::RunError;
use crate::store::StoreError;

/// 分支 id 冲突时换 uuid 后缀重试的次数上限
const BRANCH_ID_ATTEMPTS: usize = 4;

/// 实体 → 当前 run_id
#[derive(Debug, Default)]
pub struct RunDirectory {
    current: RwLock<HashMap<String, RunId>>,
}

impl RunDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, entity_id: &str) -> Option<RunId> {
        self.current.read().await.get(entity_id).cloned()
    }

    pub async fn set(&self, entity_id: &str, run_id: &str) {
        self.current
            .write()
            .await
            .insert(entity_id.to_string(), run_id.to_string());
    }
}

/// 启动请求：实体、目标与已知的结构化上下文
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub entity_id: String,
    pub goal: String,
    pub context: Map<String, Value>,
}

/// 待审批视图
#[derive(Debug, Clone, Serialize)]
pub struct PendingView {
    pub run_id: RunId,
    pub entity_id: String,
    pub action: PendingAction,
    pub lineage: Option<Lineage>,
}

/// 状态视图
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub run_id: RunId,
    pub entity_id: String,
    pub status: RunStatus,
    pub pending_action: Option<PendingAction>,
    pub failure: Option<FailureReason>,
    pub lineage: Option<Lineage>,
    pub history_len: usize,
    pub steps: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&RunState> for StatusView {
    fn from(state: &RunState) -> Self {
        Self {
            run_id: state.run_id().to_string(),
            entity_id: state.entity_id().to_string(),
            status: state.status(),
            pending_action: state.pending_action().cloned(),
            failure: state.failure().cloned(),
            lineage: state.lineage().cloned(),
            history_len: state.history().len(),
            steps: state.steps(),
            updated_at: state.updated_at(),
        }
    }
}

pub struct RunSupervisor {
    engine: Arc<RunEngine>,
    directory: RunDirectory,
}

impl RunSupervisor {
    pub fn new(engine: Arc<RunEngine>) -> Self {
        Self {
            engine,
            directory: RunDirectory::new(),
        }
    }

    pub fn engine(&self) -> &Arc<RunEngine> {
        &self.engine
    }

    /// 新建运行（run_id 即实体 id），写入检查点后在后台驱动
    pub async fn launch(&self, request: LaunchRequest) -> Result<RunId, RunError> {
        let run_id = request.entity_id.clone();
        let instruction = render_goal(&request.goal, &request.context);
        self.engine
            .create(RunSeed {
                run_id: run_id.clone(),
                entity_id: request.entity_id.clone(),
                instruction,
                context: request.context,
                lineage: None,
            })
            .await?;
        self.directory.set(&request.entity_id, &run_id).await;
        self.spawn_drive(run_id.clone());
        Ok(run_id)
    }

    /// 从 parent 分出新运行，带上反馈、原目标、上下文与被驳回的提议；parent 不变
    pub async fn branch(&self, parent_run_id: &str, feedback: &str) -> Result<RunId, RunError> {
        let parent = self.engine.load(parent_run_id).await?;
        let entity_id = parent.entity_id().to_string();
        let attempt = parent.lineage().map(|l| l.attempt).unwrap_or(1) + 1;
        let goal = self.root_instruction(&parent).await?;
        let instruction = render_branch(&goal, &parent, feedback, attempt);

        // 同一秒内的并发驳回会撞上同一个 id；create 在运行锁内判重，冲突就换后缀
        let base = format!("{}_v{}", entity_id, Utc::now().timestamp());
        let mut run_id = base.clone();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let seed = RunSeed {
                run_id: run_id.clone(),
                entity_id: entity_id.clone(),
                instruction: instruction.clone(),
                context: parent.context().clone(),
                lineage: Some(Lineage {
                    parent_run_id: parent_run_id.to_string(),
                    feedback: feedback.to_string(),
                    attempt,
                }),
            };
            match self.engine.create(seed).await {
                Ok(_) => break,
                Err(RunError::AlreadyExists(_)) if attempts < BRANCH_ID_ATTEMPTS => {
                    run_id = format!("{base}_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
                }
                Err(e) => return Err(e),
            }
        }
        self.directory.set(&entity_id, &run_id).await;
        tracing::info!(parent = %parent_run_id, run_id = %run_id, attempt, "Branched after rejection");
        self.spawn_drive(run_id.clone());
        Ok(run_id)
    }

    /// 驳回即分支
    pub async fn reject(&self, run_id: &str, feedback: &str) -> Result<RunId, RunError> {
        self.branch(run_id, feedback).await
    }

    /// 审批通过；等待恢复后的驱动循环结束
    pub async fn approve(&self, run_id: &str) -> Result<RunOutcome, RunError> {
        self.engine.resume(run_id).await
    }

    pub async fn abort(&self, run_id: &str) -> Result<RunOutcome, RunError> {
        self.engine.abort(run_id).await
    }

    pub async fn peek_pending(&self, run_id: &str) -> Result<PendingView, RunError> {
        let state = self.engine.load(run_id).await?;
        let action = state
            .pending_action()
            .cloned()
            .ok_or_else(|| RunError::NoPendingAction(run_id.to_string()))?;
        Ok(PendingView {
            run_id: state.run_id().to_string(),
            entity_id: state.entity_id().to_string(),
            action,
            lineage: state.lineage().cloned(),
        })
    }

    pub async fn status(&self, run_id: &str) -> Result<StatusView, RunError> {
        Ok(StatusView::from(&self.engine.load(run_id).await?))
    }

    pub async fn current_run(&self, entity_id: &str) -> Option<RunId> {
        self.directory.get(entity_id).await
    }

    pub async fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>, RunError> {
        Ok(self.engine.load(run_id).await?.history().to_vec())
    }

    pub async fn activity(&self, entity_id: &str) -> Vec<ActivityEntry> {
        self.engine.activity().entries(entity_id).await
    }

    /// 进程重启后从存储重建 RunDirectory：每个实体取最新创建的运行。返回实体数
    pub async fn restore(&self) -> Result<usize, RunError> {
        let mut latest: HashMap<String, (DateTime<Utc>, RunId)> = HashMap::new();
        for run_id in self.engine.store().list().await? {
            let state = match self.engine.store().load(&run_id).await {
                Ok(state) => state,
                Err(StoreError::Serde(e)) => {
                    tracing::warn!(run_id = %run_id, error = %e, "Skipping unreadable checkpoint");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if state.status() == RunStatus::Running {
                tracing::warn!(
                    run_id = %run_id,
                    "Run was RUNNING when the previous process stopped; abort it or branch a new attempt"
                );
            }
            let newer = latest
                .get(state.entity_id())
                .map(|(created, _)| state.created_at() > *created)
                .unwrap_or(true);
            if newer {
                latest.insert(
                    state.entity_id().to_string(),
                    (state.created_at(), run_id.clone()),
                );
            }
        }
        for (entity_id, (_, run_id)) in &latest {
            self.directory.set(entity_id, run_id).await;
        }
        tracing::info!(entities = latest.len(), "Run directory restored");
        Ok(latest.len())
    }

    fn spawn_drive(&self, run_id: RunId) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.drive(&run_id).await {
                Ok(outcome) => {
                    tracing::debug!(run_id = %run_id, status = %outcome.status, "Drive loop returned")
                }
                // abort 抢在后台任务拿锁之前完成
                Err(RunError::InvalidState { status, .. }) if status.is_terminal() => {
                    tracing::info!(run_id = %run_id, status = %status, "Run settled before its drive loop started")
                }
                Err(e) => tracing::error!(run_id = %run_id, error = %e, "Drive loop error"),
            }
        });
    }

    /// 沿血缘找到最初的指令
    async fn root_instruction(&self, state: &RunState) -> Result<String, RunError> {
        let mut current = state.clone();
        while let Some(lineage) = current.lineage() {
            let parent_id = lineage.parent_run_id.clone();
            current = self.engine.load(&parent_id).await?;
        }
        Ok(current.instruction().unwrap_or_default().to_string())
    }
}

fn render_goal(goal: &str, context: &Map<String, Value>) -> String {
    if context.is_empty() {
        goal.to_string()
    } else {
        format!("{goal}\n\nKnown context: {}", Value::Object(context.clone()))
    }
}

fn render_branch(goal: &str, parent: &RunState, feedback: &str, attempt: u32) -> String {
    let mut out = format!(
        "{goal}\n\nAttempt {attempt}. The previous attempt ({}) was rejected by a reviewer.\nFeedback: {feedback}",
        parent.run_id()
    );
    if let Some(pending) = parent.pending_action() {
        out.push_str(&format!(
            "\nRejected proposal: {} {}",
            pending.name,
            Value::Object(pending.arguments.clone())
        ));
    }
    out.push_str("\nStart over and address the feedback.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionRegistry, EchoAction};
    use crate::planner::{Decision, Planner, PlannerError, PlannerMessage, ScriptedPlanner};
    use crate::store::{CheckpointStore, MemoryCheckpointStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// 读写都带延迟的存储，放大并发窗口
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryCheckpointStore,
    }

    #[async_trait]
    impl CheckpointStore for SlowStore {
        async fn save(&self, run_id: &str, state: &RunState) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.save(run_id, state).await
        }

        async fn load(&self, run_id: &str) -> Result<RunState, StoreError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.inner.load(run_id).await
        }

        async fn list(&self) -> Result<Vec<RunId>, StoreError> {
            self.inner.list().await
        }
    }

    /// 永远等不到回复的 Planner
    struct Stalled;

    #[async_trait]
    impl Planner for Stalled {
        async fn decide(&self, _history: &[PlannerMessage]) -> Result<Decision, PlannerError> {
            std::future::pending().await
        }
    }

    fn supervisor_with(store: Arc<dyn CheckpointStore>, planner: Arc<dyn Planner>) -> RunSupervisor {
        let mut registry = ActionRegistry::new();
        registry.register(EchoAction, false);
        RunSupervisor::new(Arc::new(RunEngine::new(store, Arc::new(registry), planner)))
    }

    fn supervisor_over(store: Arc<dyn CheckpointStore>, decisions: Vec<Decision>) -> RunSupervisor {
        supervisor_with(store, Arc::new(ScriptedPlanner::new(decisions)))
    }

    #[test]
    fn test_render_goal_includes_context() {
        let mut context = Map::new();
        context.insert("quantity".into(), json!(500));
        let text = render_goal("route the order", &context);
        assert!(text.starts_with("route the order"));
        assert!(text.contains("\"quantity\":500"));
        assert_eq!(render_goal("plain", &Map::new()), "plain");
    }

    #[test]
    fn test_render_branch_names_feedback_and_proposal() {
        let mut parent = RunState::new("42", "42", "goal", Map::new(), None);
        parent
            .suspend(PendingAction::new(
                "save_plan",
                json!({"carrier": "FedEx"}).as_object().cloned().unwrap(),
            ))
            .unwrap();
        let text = render_branch("goal", &parent, "Too expensive, use ground", 2);
        assert!(text.contains("Attempt 2"));
        assert!(text.contains("Too expensive, use ground"));
        assert!(text.contains("save_plan"));
        assert!(text.contains("FedEx"));
    }

    #[tokio::test]
    async fn test_restore_picks_latest_run_per_entity() {
        let store = Arc::new(MemoryCheckpointStore::new());
        let first = RunState::new("42", "42", "goal", Map::new(), None);
        store.save("42", &first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = RunState::new(
            "42_v1",
            "42",
            "goal again",
            Map::new(),
            Some(Lineage {
                parent_run_id: "42".into(),
                feedback: "no".into(),
                attempt: 2,
            }),
        );
        store.save("42_v1", &second).await.unwrap();

        let supervisor = supervisor_over(store, vec![Decision::finish()]);
        assert_eq!(supervisor.restore().await.unwrap(), 1);
        assert_eq!(supervisor.current_run("42").await.as_deref(), Some("42_v1"));
    }

    #[tokio::test]
    async fn test_concurrent_rejects_get_distinct_branches() {
        let store = Arc::new(SlowStore::default());
        let mut parent = RunState::new("42", "42", "design a poster", Map::new(), None);
        parent
            .suspend(PendingAction::new("save", Map::new()))
            .unwrap();
        store.save("42", &parent).await.unwrap();
        let supervisor = supervisor_over(store.clone(), vec![Decision::finish(), Decision::finish()]);

        let (a, b) = tokio::join!(
            supervisor.reject("42", "too dark"),
            supervisor.reject("42", "too bright")
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);
        for id in [&a, &b] {
            let branch = store.load(id).await.unwrap();
            assert_eq!(branch.lineage().unwrap().parent_run_id, "42");
            assert_eq!(branch.lineage().unwrap().attempt, 2);
        }
        assert_eq!(store.load("42").await.unwrap(), parent);
    }

    #[tokio::test]
    async fn test_abort_right_after_launch_settles_as_aborted() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        let supervisor = supervisor_with(store, Arc::new(Stalled));
        let run_id = supervisor
            .launch(LaunchRequest {
                entity_id: "42".into(),
                goal: "say hi".into(),
                context: Map::new(),
            })
            .await
            .unwrap();
        let outcome = supervisor.abort(&run_id).await.unwrap();
        assert_eq!(outcome.failure, Some(FailureReason::Aborted));

        match supervisor.engine().drive(&run_id).await {
            Err(RunError::InvalidState { status, .. }) => assert!(status.is_terminal()),
            other => panic!("unexpected {other:?}"),
        }
    }
}
