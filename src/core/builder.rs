//! 监管器构建：按配置组装存储、动作注册表、Planner 与引擎
//!
//! 控制台与测试共用同一套组装逻辑。

use std::path::PathBuf;
use std::sync::Arc;

use crate::actions::{ActionRegistry, EchoAction, SaveRecordAction};
use crate::config::AppConfig;
use crate::core::activity::ActivityLog;
use crate::core::engine::RunEngine;
use crate::core::supervisor::RunSupervisor;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::planner::llm::DEFAULT_SYSTEM_PROMPT;
use crate::planner::{LlmPlanner, Planner};
use crate::store::{open_store, StoreError};

pub struct SupervisorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    planner: Option<Arc<dyn Planner>>,
    registry: Option<ActionRegistry>,
}

impl SupervisorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            planner: None,
            registry: None,
        }
    }

    /// 覆盖配置中的 LLM 后端
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 直接指定 Planner（优先于 LLM）
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn records_file(&self) -> PathBuf {
        self.config
            .actions
            .records_file
            .clone()
            .unwrap_or_else(|| self.config.app.data_dir.join("records.jsonl"))
    }

    /// 默认动作：echo（非 gated）与 save_record（gated）
    pub fn default_registry(&self) -> ActionRegistry {
        let mut registry =
            ActionRegistry::new().with_default_deadline(self.config.actions.deadline());
        registry.register(EchoAction, false);
        registry.register(SaveRecordAction::new(self.records_file()), true);
        registry
    }

    pub fn build(self) -> Result<RunSupervisor, StoreError> {
        let store = open_store(&self.config.store, &self.config.app.data_dir)?;
        let registry = match self.registry {
            Some(registry) => registry,
            None => self.default_registry(),
        };
        let planner: Arc<dyn Planner> = match self.planner {
            Some(planner) => planner,
            None => {
                let llm = self
                    .llm
                    .unwrap_or_else(|| create_llm_from_config(&self.config.llm));
                let prompt = self
                    .config
                    .llm
                    .system_prompt
                    .as_deref()
                    .unwrap_or(DEFAULT_SYSTEM_PROMPT);
                Arc::new(LlmPlanner::new(llm, prompt, &registry.catalog()))
            }
        };

        tracing::info!(
            actions = ?registry.names(),
            max_steps = self.config.engine.max_steps,
            "Supervisor assembled"
        );
        let activity = ActivityLog::new().with_store(Arc::clone(&store));
        let engine = RunEngine::new(store, Arc::new(registry), planner)
            .with_max_steps(self.config.engine.max_steps)
            .with_activity(Arc::new(activity));
        Ok(RunSupervisor::new(Arc::new(engine)))
    }
}
