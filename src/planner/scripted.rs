//! 脚本化 Planner：按顺序回放预设决定，用尽后返回 Finish

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::planner::{Decision, Planner, PlannerError, PlannerMessage};

#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    script: Mutex<VecDeque<Result<Decision, PlannerError>>>,
    seen: Mutex<Vec<Vec<PlannerMessage>>>,
}

impl ScriptedPlanner {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self::with_results(decisions.into_iter().map(Ok).collect())
    }

    /// 允许在脚本中插入规划错误
    pub fn with_results(results: Vec<Result<Decision, PlannerError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 已被询问的次数
    pub async fn calls(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// 每次询问时看到的历史
    pub async fn seen(&self) -> Vec<Vec<PlannerMessage>> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn decide(&self, history: &[PlannerMessage]) -> Result<Decision, PlannerError> {
        self.seen.lock().await.push(history.to_vec());
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(Decision::finish()))
    }
}
