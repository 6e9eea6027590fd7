//! 运行引擎：驱动循环、gated 动作挂起、审批恢复、中止
//!
//! 状态机：RUNNING → SUSPENDED_FOR_APPROVAL → RUNNING → … → COMPLETED | FAILED。
//! 每次状态迁移都先写检查点再返回；恢复时先持久化 action_invoked 再执行，
//! 进程在执行中途崩溃也不会导致同一审批被执行两次。
//! 审批后的动作失败只写入历史，Planner 在新一轮里决定怎么办。

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use serde_json::{Map, Value};

use crate::actions::ActionRegistry;
use crate::config::DEFAULT_MAX_STEPS;
use crate::core::activity::{ActivityKind, ActivityLog};
use crate::core::locks::RunLocks;
use crate::core::recovery::{Disposition, RecoveryPolicy};
use crate::core::state::{
    ActionOutcome, FailureReason, HistoryEvent, Lineage, PendingAction, RunId, RunState, RunStatus,
};
use crate::core::RunError;
use crate::planner::{Decision, Planner};
use crate::store::CheckpointStore;

/// 新运行的初始参数
#[derive(Debug, Clone)]
pub struct RunSeed {
    pub run_id: RunId,
    pub entity_id: String,
    pub instruction: String,
    pub context: Map<String, Value>,
    pub lineage: Option<Lineage>,
}

/// start / resume / abort 返回时的运行概况
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub pending_action: Option<PendingAction>,
    pub failure: Option<FailureReason>,
}

impl From<&RunState> for RunOutcome {
    fn from(state: &RunState) -> Self {
        Self {
            run_id: state.run_id().to_string(),
            status: state.status(),
            pending_action: state.pending_action().cloned(),
            failure: state.failure().cloned(),
        }
    }
}

pub struct RunEngine {
    store: Arc<dyn CheckpointStore>,
    registry: Arc<ActionRegistry>,
    planner: Arc<dyn Planner>,
    locks: RunLocks,
    activity: Arc<ActivityLog>,
    recovery: RecoveryPolicy,
    max_steps: u32,
}

impl RunEngine {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        registry: Arc<ActionRegistry>,
        planner: Arc<dyn Planner>,
    ) -> Self {
        Self {
            store,
            registry,
            planner,
            locks: RunLocks::new(),
            activity: Arc::new(ActivityLog::new()),
            recovery: RecoveryPolicy::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// 每次进入驱动循环（启动或恢复）允许的规划轮数
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_activity(mut self, activity: Arc<ActivityLog>) -> Self {
        self.activity = activity;
        self
    }

    pub fn activity(&self) -> &Arc<ActivityLog> {
        &self.activity
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn max_steps(&self) -> u32 {
        self.max_steps
    }

    /// 只读取检查点
    pub async fn load(&self, run_id: &str) -> Result<RunState, RunError> {
        Ok(self.store.load(run_id).await?)
    }

    /// 创建并持久化 RUNNING 状态的新运行，不进入驱动循环
    pub async fn create(&self, seed: RunSeed) -> Result<RunState, RunError> {
        let _guard = self.locks.lock(&seed.run_id).await;
        if self.store.exists(&seed.run_id).await? {
            return Err(RunError::AlreadyExists(seed.run_id));
        }
        let state = RunState::new(
            seed.run_id,
            seed.entity_id,
            seed.instruction,
            seed.context,
            seed.lineage,
        );
        self.store.save(state.run_id(), &state).await?;

        let message = match state.lineage() {
            Some(lineage) => format!(
                "Run {} started (attempt {}, branched from {})",
                state.run_id(),
                lineage.attempt,
                lineage.parent_run_id
            ),
            None => format!("Run {} started", state.run_id()),
        };
        tracing::info!(run_id = %state.run_id(), entity_id = %state.entity_id(), "Run created");
        self.log(&state, ActivityKind::System, message).await;
        Ok(state)
    }

    /// create + drive
    pub async fn start(&self, seed: RunSeed) -> Result<RunOutcome, RunError> {
        let run_id = seed.run_id.clone();
        self.create(seed).await?;
        self.drive(&run_id).await
    }

    /// 对 RUNNING 状态的运行进入驱动循环
    pub async fn drive(&self, run_id: &str) -> Result<RunOutcome, RunError> {
        let guard = self.locks.lock(run_id).await;
        let mut state = self.store.load(run_id).await?;
        if state.status() != RunStatus::Running {
            return Err(state.invalid_state());
        }
        self.drive_locked(&mut state, guard.cancel_token()).await
    }

    /// 审批通过：执行挂起的动作，然后继续驱动循环
    ///
    /// 动作失败时错误进入历史，驱动循环照常继续；只有在没有规划轮次可用时运行才以 action_failed 结束。
    pub async fn resume(&self, run_id: &str) -> Result<RunOutcome, RunError> {
        let guard = self.locks.lock(run_id).await;
        let mut state = self.store.load(run_id).await?;
        let pending = state.take_pending()?;

        state.push(HistoryEvent::ActionInvoked {
            name: pending.name.clone(),
            arguments: pending.arguments.clone(),
            gated: true,
        });
        self.store.save(run_id, &state).await?;
        tracing::info!(run_id = %run_id, action = %pending.name, "Approved, executing gated action");
        self.log(
            &state,
            ActivityKind::Action,
            format!("Approved: executing {}", pending.name),
        )
        .await;

        match self
            .run_action(&mut state, &pending.name, pending.arguments, true)
            .await
        {
            Disposition::Fail(reason) => return self.fail_run(&mut state, reason).await,
            Disposition::FailIfFinal(reason) if self.max_steps == 0 => {
                return self.fail_run(&mut state, reason).await
            }
            _ => {}
        }
        self.store.save(run_id, &state).await?;
        self.drive_locked(&mut state, guard.cancel_token()).await
    }

    /// 中止：已中止的再次中止视为成功；已完成或因其他原因失败的运行返回 InvalidState
    pub async fn abort(&self, run_id: &str) -> Result<RunOutcome, RunError> {
        let state = self.store.load(run_id).await?;
        if let Some(outcome) = Self::abort_settled(&state)? {
            return Ok(outcome);
        }

        let _guard = self.locks.cancel_and_lock(run_id).await;
        let mut state = self.store.load(run_id).await?;
        if let Some(outcome) = Self::abort_settled(&state)? {
            return Ok(outcome);
        }
        self.fail_run(&mut state, FailureReason::Aborted).await
    }

    fn abort_settled(state: &RunState) -> Result<Option<RunOutcome>, RunError> {
        match (state.status(), state.failure()) {
            (RunStatus::Failed, Some(FailureReason::Aborted)) => Ok(Some(RunOutcome::from(state))),
            (status, _) if status.is_terminal() => Err(state.invalid_state()),
            _ => Ok(None),
        }
    }

    async fn drive_locked(
        &self,
        state: &mut RunState,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let mut turns = 0u32;

        loop {
            if cancel.is_cancelled() {
                return self.fail_run(state, FailureReason::Aborted).await;
            }
            if turns >= self.max_steps {
                let limit = self.max_steps;
                return self
                    .fail_run(state, FailureReason::StepBudgetExceeded { limit })
                    .await;
            }
            turns += 1;
            state.count_step();

            let view = state.planner_view();
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                decision = self.planner.decide(&view) => Some(decision),
            };
            let Some(decision) = decision else {
                return self.fail_run(state, FailureReason::Aborted).await;
            };

            let (name, arguments) = match decision {
                Err(e) => {
                    return self
                        .fail_run(
                            state,
                            FailureReason::PlannerError {
                                message: e.to_string(),
                            },
                        )
                        .await;
                }
                Ok(Decision::Finish { summary }) => {
                    if let Some(summary) = summary {
                        self.log(state, ActivityKind::Thought, summary.clone()).await;
                        state.push(HistoryEvent::Decision { content: summary });
                    }
                    state.complete()?;
                    self.store.save(state.run_id(), state).await?;
                    tracing::info!(run_id = %state.run_id(), steps = state.steps(), "Run completed");
                    self.log(state, ActivityKind::System, "Run completed").await;
                    return Ok(RunOutcome::from(&*state));
                }
                Ok(Decision::ProposeAction {
                    name,
                    arguments,
                    rationale,
                }) => {
                    if let Some(rationale) = rationale {
                        self.log(state, ActivityKind::Thought, rationale.clone()).await;
                        state.push(HistoryEvent::Decision { content: rationale });
                    }
                    (name, arguments)
                }
            };

            let gated = self.registry.is_gated(&name);
            if let Err(err) = self.registry.validate(&name, &arguments) {
                tracing::warn!(run_id = %state.run_id(), action = %name, error = %err, "Proposal rejected");
                match self.recovery.on_action_error(&err, gated, &arguments) {
                    Disposition::Fail(reason) => return self.fail_run(state, reason).await,
                    Disposition::Continue | Disposition::FailIfFinal(_) => continue,
                }
            }

            if gated {
                state.suspend(PendingAction::new(name.clone(), arguments))?;
                self.store.save(state.run_id(), state).await?;
                tracing::info!(run_id = %state.run_id(), action = %name, "Run suspended for approval");
                self.log(
                    state,
                    ActivityKind::Action,
                    format!("Awaiting approval: {name}"),
                )
                .await;
                return Ok(RunOutcome::from(&*state));
            }

            state.push(HistoryEvent::ActionInvoked {
                name: name.clone(),
                arguments: arguments.clone(),
                gated: false,
            });
            self.log(
                state,
                ActivityKind::Action,
                format!("Calling {name} {}", Value::Object(arguments.clone())),
            )
            .await;
            match self.run_action(state, &name, arguments, false).await {
                Disposition::Fail(reason) => return self.fail_run(state, reason).await,
                Disposition::Continue | Disposition::FailIfFinal(_) => {}
            }
            self.store.save(state.run_id(), state).await?;
        }
    }

    /// 执行动作并把结果写入历史，返回对失败的处置（成功为 Continue）
    async fn run_action(
        &self,
        state: &mut RunState,
        name: &str,
        arguments: Map<String, Value>,
        gated: bool,
    ) -> Disposition {
        match self.registry.invoke(name, arguments.clone()).await {
            Ok(output) => {
                self.log(state, ActivityKind::ActionResult, format!("{name}: {output}"))
                    .await;
                state.push(HistoryEvent::ActionResult {
                    name: name.to_string(),
                    outcome: ActionOutcome::Success { output },
                });
                Disposition::Continue
            }
            Err(err) => {
                tracing::warn!(run_id = %state.run_id(), action = %name, error = %err, "Action failed");
                self.log(state, ActivityKind::ActionResult, err.to_string()).await;
                state.push(HistoryEvent::ActionResult {
                    name: name.to_string(),
                    outcome: ActionOutcome::Failure {
                        error: err.to_string(),
                    },
                });
                self.recovery.on_action_error(&err, gated, &arguments)
            }
        }
    }

    async fn fail_run(
        &self,
        state: &mut RunState,
        reason: FailureReason,
    ) -> Result<RunOutcome, RunError> {
        state.fail(reason.clone())?;
        self.store.save(state.run_id(), state).await?;
        tracing::warn!(run_id = %state.run_id(), reason = %reason, "Run failed");
        self.log(state, ActivityKind::System, format!("Run failed: {reason}"))
            .await;
        Ok(RunOutcome::from(&*state))
    }

    async fn log(&self, state: &RunState, kind: ActivityKind, message: impl Into<String>) {
        self.activity
            .record(state.entity_id(), state.run_id(), kind, message)
            .await;
    }
}
