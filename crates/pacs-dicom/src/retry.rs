//! 重试策略
//!
//! 指数退避，每次尝试都重新建立关联。所有重试及其结果同时写入任务日志。

use pacs_core::{PacsError, ProgressReporter};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// 错误是否值得重试
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for PacsError {
    fn is_retryable(&self) -> bool {
        match self {
            PacsError::Network(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::TimedOut
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ),
            PacsError::Timeout(_) => true,
            // result=2 为暂时拒绝；source=3 为表示层 (服务繁忙等)
            PacsError::AssociationRejected { result, source_code, .. } => *result == 2 || *source_code == 3,
            // 0xA7xx: 资源不足
            PacsError::DimseFailure { status, .. } => status & 0xFF00 == 0xA700,
            _ => false,
        }
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32, // 总尝试次数，含首次
    #[serde(with = "secs_f64")]
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "secs_f64")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!("非法的秒数: {}", secs)));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// 带指数退避地执行异步操作
///
/// 取消令牌在每次等待期间生效，被取消时返回 `PacsError::Cancelled`。
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancellationToken,
    label: &str,
    mut operation: F,
) -> Result<T, PacsError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, PacsError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    reporter.info(&format!("{} 第 {} 次尝试成功", label, attempt));
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "{} 失败，准备重试", label
                );
                reporter.warning(&format!(
                    "{} 第 {}/{} 次尝试失败: {}，{:.1} 秒后重试",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    delay.as_secs_f64()
                ));

                tokio::select! {
                    _ = cancel.cancelled() => return Err(PacsError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }

                attempt += 1;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    reporter.error(&format!("{} 在 {} 次尝试后仍然失败: {}", label, attempt, e));
                } else {
                    reporter.error(&format!("{} 失败 (不可重试): {}", label, e));
                }
                return Err(e);
            }
        }
    }
}
