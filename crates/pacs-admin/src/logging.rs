//! 日志初始化
//!
//! `RUST_LOG` 存在时优先于配置中的级别。

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

/// 构造过滤器
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).context("RUST_LOG 格式无效")
        }
        _ => EnvFilter::try_new(config.level.to_lowercase())
            .with_context(|| format!("日志级别无效: {}", config.level)),
    }
}

/// 初始化全局 tracing 订阅者
///
/// 重复初始化返回错误，调用方可以忽略。
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = match config.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        "full" => builder.try_init(),
        _ => builder.compact().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("日志系统初始化失败: {}", e))
}
