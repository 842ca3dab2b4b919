//! # PACS Core
//!
//! 检索与分类流水线的核心模块，提供错误定义、共享数据结构、端点配置和通用工具。

pub mod endpoint;
pub mod error;
pub mod models;
pub mod progress;
pub mod utils;

pub use endpoint::{EndpointStore, PacsEndpoint, VersionedEndpoint};
pub use error::{PacsError, Result};
pub use models::*;
pub use progress::{ProgressReporter, TracingReporter};
