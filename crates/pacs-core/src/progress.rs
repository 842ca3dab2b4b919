//! 阶段进度上报接口
//!
//! 各处理阶段通过该接口写任务日志、汇报阶段内进度，
//! 不直接依赖任务注册表。

use crate::models::LogLevel;

/// 阶段进度上报
pub trait ProgressReporter: Send + Sync {
    /// 追加一条任务日志
    fn log(&self, level: LogLevel, message: &str);

    /// 阶段内完成比例 (done / total)
    fn advance(&self, done: usize, total: usize);

    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// 只转发到 tracing 的上报器，用于不挂靠任务的独立调用
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!("{}", message),
            LogLevel::Info | LogLevel::Success => tracing::info!("{}", message),
            LogLevel::Warning => tracing::warn!("{}", message),
            LogLevel::Error => tracing::error!("{}", message),
        }
    }

    fn advance(&self, _done: usize, _total: usize) {}
}
