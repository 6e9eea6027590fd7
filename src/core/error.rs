//! 错误类型
//!
//! RunError 是调用方（Supervisor / 外部 API）直接看到的同步错误，出现时不修改任何状态；
//! 规划、动作、存储各自的错误在对应模块定义，由引擎转换为 FailureReason 或 RunError。

use thiserror::Error;

use crate::core::state::{RunId, RunStatus};
use crate::store::StoreError;

/// 调用方误用或存储失败
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Run not found: {0}")]
    NotFound(RunId),

    #[error("Run {run_id} is {status}, operation not allowed")]
    InvalidState { run_id: RunId, status: RunStatus },

    #[error("Run already exists: {0}")]
    AlreadyExists(RunId),

    #[error("No pending action for run {0}")]
    NoPendingAction(RunId),

    #[error("Checkpoint store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(run_id) => RunError::NotFound(run_id),
            other => RunError::Store(other),
        }
    }
}
