//! Gatehouse - 可中断的任务执行核心
//!
//! 模块划分：
//! - **actions**: 动作注册表、参数校验、内置动作
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 运行状态、引擎（驱动循环 / 挂起 / 恢复）、监管器（启动 / 审批 / 驳回分支）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **planner**: Planner 抽象与回复归一化
//! - **store**: 检查点存储（内存 / JSON 目录 / SQLite）

pub mod actions;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod planner;
pub mod store;
