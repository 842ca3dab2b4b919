//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    /// 对端拒绝关联 (A-ASSOCIATE-RJ)
    #[error("关联被拒绝: result={result}, source={source_code}, reason={reason}")]
    AssociationRejected {
        result: u8,
        source_code: u8,
        reason: u8,
    },

    /// 协议层错误，例如非法PDU或意外的响应
    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("操作超时: {0}")]
    Timeout(String),

    /// DIMSE响应携带失败状态
    #[error("DIMSE失败状态: 0x{status:04X} {message}")]
    DimseFailure { status: u16, message: String },

    /// 套接字或PDU传输层的IO错误
    #[error("网络错误: {0}")]
    Network(std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 单个序列的元数据提取失败
    #[error("元数据提取失败 [{series}]: {message}")]
    Extraction { series: String, message: String },

    #[error("格式转换失败: {0}")]
    Conversion(String),

    #[error("任务已取消")]
    Cancelled,

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 本地文件系统错误
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("工作流错误: {0}")]
    Workflow(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl PacsError {
    /// 把传输通道上的IO错误归为网络错误，其余原样返回
    pub fn into_network(self) -> Self {
        match self {
            PacsError::Io(e) => PacsError::Network(e),
            other => other,
        }
    }

    /// 是否为协议族错误（关联、PDU、超时、网络、DIMSE状态）
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            PacsError::AssociationRejected { .. }
                | PacsError::Protocol(_)
                | PacsError::Timeout(_)
                | PacsError::DimseFailure { .. }
                | PacsError::Network(_)
        )
    }
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn test_io_error_defaults_to_filesystem() {
        // `?` 转换得到本地IO错误，不属于协议族
        let err: PacsError = std::io::Error::from(ErrorKind::PermissionDenied).into();
        assert!(matches!(err, PacsError::Io(_)));
        assert!(!err.is_protocol_error());
        assert!(err.to_string().starts_with("IO错误"));

        let net = err.into_network();
        assert!(matches!(net, PacsError::Network(_)));
        assert!(net.is_protocol_error());

        // 非IO错误保持不变
        assert!(matches!(PacsError::Cancelled.into_network(), PacsError::Cancelled));
    }
}
