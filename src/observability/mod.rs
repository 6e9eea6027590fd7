//! 可观测性：tracing 日志初始化
//!
//! 默认 info 级别，RUST_LOG 可覆盖（如 `RUST_LOG=gatehouse=debug`）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 测试中可能被重复调用，忽略已初始化的错误
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
