//! 核心层：运行状态、错误、引擎、监管器、恢复策略、每 run 锁与活动日志

pub mod activity;
pub mod builder;
pub mod engine;
pub mod error;
pub mod locks;
pub mod recovery;
pub mod state;
pub mod supervisor;

pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use builder::SupervisorBuilder;
pub use engine::{RunEngine, RunOutcome, RunSeed};
pub use error::RunError;
pub use locks::{RunGuard, RunLocks};
pub use recovery::{Disposition, RecoveryPolicy};
pub use state::{
    ActionOutcome, FailureReason, HistoryEntry, HistoryEvent, Lineage, PendingAction, RunId,
    RunState, RunStatus,
};
pub use supervisor::{LaunchRequest, PendingView, RunDirectory, RunSupervisor, StatusView};
