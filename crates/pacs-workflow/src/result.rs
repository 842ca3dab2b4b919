//! 任务结果

use pacs_classify::ClassificationResult;
use pacs_dicom::RetrievalShortfall;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 单个序列的处理结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesOutcome {
    pub series_uid: String,
    pub folder: String,
    pub modality: Option<String>,
    pub instance_count: usize,
    pub extraction_error: Option<String>,
    pub classification: Option<ClassificationResult>,
    pub volume: Option<PathBuf>,
}

/// 一个检查 (检查号或上传文件集) 的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyResult {
    pub accession_number: String,
    pub output_dir: PathBuf,
    pub series_count: usize,
    pub file_count: usize,
    pub shortfall: Option<RetrievalShortfall>,
    pub metadata_path: Option<PathBuf>,
    pub series: Vec<SeriesOutcome>,
}

impl StudyResult {
    pub fn classified_count(&self) -> usize {
        self.series.iter().filter(|s| s.classification.is_some()).count()
    }

    pub fn volume_count(&self) -> usize {
        self.series.iter().filter(|s| s.volume.is_some()).count()
    }
}

/// 批量任务中失败的检查号
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StudyFailure {
    pub accession_number: String,
    pub error: String,
}

/// 完成任务的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub output_dir: PathBuf,
    pub series_count: usize,
    pub file_count: usize,
    pub studies: Vec<StudyResult>,
    pub failures: Vec<StudyFailure>,
}

impl TaskResult {
    pub fn new(output_dir: PathBuf, studies: Vec<StudyResult>, failures: Vec<StudyFailure>) -> Self {
        Self {
            output_dir,
            series_count: studies.iter().map(|s| s.series_count).sum(),
            file_count: studies.iter().map(|s| s.file_count).sum(),
            studies,
            failures,
        }
    }

    /// 所有检查缺失的序列数之和
    pub fn missing_series(&self) -> usize {
        self.studies
            .iter()
            .filter_map(|s| s.shortfall.as_ref())
            .map(|s| s.missing_count())
            .sum()
    }
}
