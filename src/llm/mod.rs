//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatMessage, ChatRole, LlmClient};

use crate::config::{LlmProvider, LlmSection};

/// 按配置创建 LLM 客户端；openai / deepseek 缺少 API Key 时退回 Mock
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let timeout = cfg.timeouts.request_timeout();
    match cfg.provider {
        LlmProvider::Mock => Arc::new(MockLlmClient),
        LlmProvider::Deepseek => {
            if std::env::var("DEEPSEEK_API_KEY").is_err()
                && std::env::var("OPENAI_API_KEY").is_err()
            {
                tracing::warn!("DEEPSEEK_API_KEY not set, falling back to mock LLM");
                return Arc::new(MockLlmClient);
            }
            let client = create_deepseek_client(cfg.model.as_deref()).with_timeout(timeout);
            tracing::info!("Using DeepSeek LLM ({})", client.model());
            Arc::new(client)
        }
        LlmProvider::Openai => {
            let Ok(key) = std::env::var("OPENAI_API_KEY") else {
                tracing::warn!("OPENAI_API_KEY not set, falling back to mock LLM");
                return Arc::new(MockLlmClient);
            };
            let model = cfg.model.as_deref().unwrap_or("gpt-4o-mini");
            tracing::info!("Using OpenAI LLM ({})", model);
            Arc::new(
                OpenAiClient::new(cfg.base_url.as_deref(), model, Some(key.as_str()))
                    .with_timeout(timeout),
            )
        }
    }
}
