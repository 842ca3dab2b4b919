//! 任务提交请求
//!
//! 提交时只校验请求形状，校验失败不会创建任务。

use pacs_core::{PacsError, Result};
use pacs_dicom::validate_archive;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Single,
    Batch,
    Upload,
}

/// 体数据输出格式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 原生 `.npy`
    #[default]
    Npy,
    /// 外部转换器生成的 NIfTI
    Nifti,
}

/// 处理选项
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct JobOptions {
    pub convert: bool,
    pub classify: bool,
    pub output_format: OutputFormat,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            convert: true,
            classify: true,
            output_format: OutputFormat::Npy,
        }
    }
}

/// 提交的任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobRequest {
    Single { accession_number: String },
    Batch { accession_numbers: Vec<String> },
    /// ZIP 文件或已解开的目录
    Upload { path: PathBuf },
}

/// 校验后的处理单元
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobItem {
    Accession(String),
    FileSet(PathBuf),
}

impl JobItem {
    pub(crate) fn label(&self) -> String {
        match self {
            JobItem::Accession(accession) => accession.clone(),
            JobItem::FileSet(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload".to_string()),
        }
    }
}

impl JobRequest {
    /// 由换行分隔的文本构造批量请求
    pub fn batch_from_text(text: &str) -> Self {
        JobRequest::Batch {
            accession_numbers: text.lines().map(|l| l.to_string()).collect(),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobRequest::Single { .. } => JobKind::Single,
            JobRequest::Batch { .. } => JobKind::Batch,
            JobRequest::Upload { .. } => JobKind::Upload,
        }
    }

    /// 校验并展开为处理单元
    ///
    /// 批量列表中的每一项还会按行拆分，空行忽略，重复的检查号只保留第一次出现。
    pub(crate) fn validate(&self) -> Result<Vec<JobItem>> {
        match self {
            JobRequest::Single { accession_number } => {
                let accession = accession_number.trim();
                if accession.is_empty() {
                    return Err(PacsError::Validation("请提供检查号 (AccessionNumber)".to_string()));
                }
                Ok(vec![JobItem::Accession(accession.to_string())])
            }
            JobRequest::Batch { accession_numbers } => {
                let mut seen = HashSet::new();
                let items: Vec<JobItem> = accession_numbers
                    .iter()
                    .flat_map(|entry| entry.lines())
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .filter(|line| seen.insert(line.to_string()))
                    .map(|line| JobItem::Accession(line.to_string()))
                    .collect();
                if items.is_empty() {
                    return Err(PacsError::Validation("检查号列表为空".to_string()));
                }
                Ok(items)
            }
            JobRequest::Upload { path } => {
                if path.is_dir() {
                    return Ok(vec![JobItem::FileSet(path.clone())]);
                }
                if !path.is_file() {
                    return Err(PacsError::Validation(format!("上传文件不存在: {}", path.display())));
                }
                validate_archive(path)?;
                Ok(vec![JobItem::FileSet(path.clone())])
            }
        }
    }
}
