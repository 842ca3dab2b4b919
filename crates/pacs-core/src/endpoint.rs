//! PACS 端点配置
//!
//! 端点配置是进程级共享状态。每次更新都会生成一个新版本，
//! 关联在协商时捕获当时的快照，之后的更新不会影响已建立的关联。

use crate::error::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::info;

/// PACS 连接参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PacsEndpoint {
    #[serde(rename = "PACS_IP", alias = "pacs_ip")]
    pub pacs_ip: String,
    #[serde(rename = "PACS_PORT", alias = "pacs_port")]
    pub pacs_port: u16,
    #[serde(rename = "CALLING_AET", alias = "calling_aet")]
    pub calling_aet: String,
    #[serde(rename = "CALLED_AET", alias = "called_aet")]
    pub called_aet: String,
    /// 本地 C-STORE 监听端口，C-MOVE 的目的地
    #[serde(rename = "CALLING_PORT", alias = "calling_port")]
    pub calling_port: u16,
}

impl Default for PacsEndpoint {
    fn default() -> Self {
        Self {
            pacs_ip: "172.17.250.192".to_string(),
            pacs_port: 2104,
            calling_aet: "WMX01".to_string(),
            called_aet: "pacsFIR".to_string(),
            calling_port: 1103,
        }
    }
}

impl PacsEndpoint {
    /// 校验端点参数
    pub fn validate(&self) -> Result<()> {
        if self.pacs_ip.trim().is_empty() || self.pacs_ip.len() > 255 {
            return Err(PacsError::Validation("PACS_IP 不能为空".to_string()));
        }
        if self.pacs_port == 0 {
            return Err(PacsError::Validation("PACS_PORT 必须在 1-65535 之间".to_string()));
        }
        if self.calling_port == 0 {
            return Err(PacsError::Validation("CALLING_PORT 必须在 1-65535 之间".to_string()));
        }
        validate_ae_title("CALLING_AET", &self.calling_aet, true)?;
        // 被叫方AE由PACS厂商分配，常含小写字母，不强制大写
        validate_ae_title("CALLED_AET", &self.called_aet, false)?;
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.pacs_ip, self.pacs_port)
    }
}

/// 校验 AE Title: 1-16个可打印ASCII字符，不含反斜杠
pub fn validate_ae_title(field: &str, ae: &str, require_uppercase: bool) -> Result<()> {
    let trimmed = ae.trim();
    if trimmed.is_empty() {
        return Err(PacsError::Validation(format!("{} 不能为空", field)));
    }
    if trimmed.len() > 16 {
        return Err(PacsError::Validation(format!(
            "{} 长度不能超过16个字符: {}",
            field, trimmed
        )));
    }
    if !trimmed.chars().all(|c| c.is_ascii_graphic() || c == ' ') || trimmed.contains('\\') {
        return Err(PacsError::Validation(format!(
            "{} 只能包含可打印ASCII字符: {}",
            field, trimmed
        )));
    }
    if require_uppercase && trimmed.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PacsError::Validation(format!("{} 必须为大写: {}", field, trimmed)));
    }
    Ok(())
}

/// 带版本号的端点快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedEndpoint {
    pub version: u64,
    pub endpoint: PacsEndpoint,
}

/// 端点配置存储
#[derive(Debug, Clone)]
pub struct EndpointStore {
    current: Arc<RwLock<Arc<VersionedEndpoint>>>,
}

impl EndpointStore {
    pub fn new(endpoint: PacsEndpoint) -> Result<Self> {
        endpoint.validate()?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(VersionedEndpoint { version: 1, endpoint }))),
        })
    }

    /// 获取当前版本的快照
    pub fn snapshot(&self) -> Arc<VersionedEndpoint> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// 发布新版本，返回新版本号
    pub fn update(&self, endpoint: PacsEndpoint) -> Result<u64> {
        endpoint.validate()?;
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = guard.version + 1;
        *guard = Arc::new(VersionedEndpoint { version, endpoint });
        info!("PACS端点配置已更新到版本 {}", version);
        Ok(version)
    }
}
