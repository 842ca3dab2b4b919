//! # 任务编排模块
//!
//! 提供检索任务的完整生命周期管理：
//! - 任务状态机：pending -> running -> completed / failed / cancelled
//! - 任务注册表：并发安全的创建、查找、取消与过期回收
//! - 进度订阅：先推送快照，再推送增量事件
//! - 编排器：检索、元数据提取、分类、格式转换四个阶段顺序执行

pub mod engine;
pub mod registry;
pub mod request;
pub mod result;
pub mod stages;
pub mod state_machine;
pub mod task;

// 重新导出主要类型
pub use engine::Orchestrator;
pub use registry::TaskRegistry;
pub use request::{JobKind, JobOptions, JobRequest, OutputFormat};
pub use result::{SeriesOutcome, StudyFailure, StudyResult, TaskResult};
pub use stages::Pipeline;
pub use state_machine::{TaskEvent, TaskState, TaskStateMachine};
pub use task::{LogEntry, ProgressEvent, TaskHandle, TaskSnapshot, TaskSubscription};
