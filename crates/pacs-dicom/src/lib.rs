//! # DICOM 网络与检索模块
//!
//! 提供关联建立、C-ECHO/C-FIND/C-MOVE 客户端、按序列路由的 C-STORE 接收端，
//! 以及检索流水线、上传文件集整理、元数据提取和体数据转换。

pub mod association;
pub mod client;
pub mod convert;
pub mod dimse;
pub mod extractor;
pub mod organize;
pub mod pdu;
pub mod retrieval;
pub mod retry;
pub mod server;
pub mod transfer_syntax;

pub use client::{MoveOutcome, NetworkOptions, PacsClient, QueryLevel};
pub use convert::{ExternalCommand, ExternalConverter, NpyConverter, VolumeConverter};
pub use extractor::{extract_series, TagTemplate, TemplateSet};
pub use organize::{import_file_set, validate_archive};
pub use retrieval::{PacsRetriever, RetrievalOutcome, RetrievalShortfall, RetrievedSeries, StudyRetriever};
pub use retry::{with_retry, IsRetryable, RetryConfig};
pub use server::{ReceiverRegistry, SeriesReceiver, StoreScp, StoreScpConfig};
