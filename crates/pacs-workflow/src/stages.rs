//! 单个检查的处理阶段
//!
//! 检索 (或导入) -> 元数据提取 -> 序列分类 -> 格式转换，严格按顺序执行。
//! 每个阶段占本检查进度区间的四分之一。

use crate::request::{JobItem, JobOptions, OutputFormat};
use crate::result::{SeriesOutcome, StudyResult};
use crate::task::TaskHandle;
use chrono::{DateTime, Utc};
use pacs_classify::{ClassificationResult, RuleSetHandle, UNCLASSIFIED};
use pacs_core::{LogLevel, PacsError, ProgressReporter, Result, SeriesRecord};
use pacs_dicom::convert::NpyConverter;
use pacs_dicom::{
    extract_series, import_file_set, RetrievalOutcome, RetrievalShortfall, StudyRetriever, TemplateSet, VolumeConverter,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STAGE_COUNT: f64 = 4.0;

/// 元数据文件名，与序列目录放在一起
pub const METADATA_FILE: &str = "metadata.json";

/// 体数据输出子目录
pub const VOLUME_DIR: &str = "volumes";

/// 取消检查点
pub(crate) fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PacsError::Cancelled)
    } else {
        Ok(())
    }
}

/// 把阶段内进度映射到任务进度
pub(crate) struct StageReporter<'a> {
    task: &'a TaskHandle,
    start: f64,
    width: f64,
}

impl<'a> StageReporter<'a> {
    fn new(task: &'a TaskHandle, span: (f64, f64), stage: usize) -> Self {
        let width = span.1 / STAGE_COUNT;
        Self {
            task,
            start: span.0 + width * stage as f64,
            width,
        }
    }

    fn finish(&self) {
        self.task.set_progress(self.start + self.width);
    }
}

impl ProgressReporter for StageReporter<'_> {
    fn log(&self, level: LogLevel, message: &str) {
        self.task.log(level, message);
    }

    fn advance(&self, done: usize, total: usize) {
        if total > 0 {
            let fraction = done.min(total) as f64 / total as f64;
            self.task.set_progress(self.start + self.width * fraction);
        }
    }
}

#[derive(Serialize)]
struct SeriesMetadata<'a> {
    folder: &'a str,
    record: Option<&'a SeriesRecord>,
    classification: Option<&'a ClassificationResult>,
    extraction_error: Option<&'a str>,
}

#[derive(Serialize)]
struct StudyMetadata<'a> {
    accession_number: &'a str,
    generated_at: DateTime<Utc>,
    shortfall: Option<&'a RetrievalShortfall>,
    series: Vec<SeriesMetadata<'a>>,
}

/// 阶段依赖
pub struct Pipeline {
    retriever: Arc<dyn StudyRetriever>,
    templates: Arc<TemplateSet>,
    rules: RuleSetHandle,
    native: Arc<dyn VolumeConverter>,
    external: Option<Arc<dyn VolumeConverter>>,
    output_root: PathBuf,
}

impl Pipeline {
    pub fn new(
        retriever: Arc<dyn StudyRetriever>,
        templates: Arc<TemplateSet>,
        rules: RuleSetHandle,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            retriever,
            templates,
            rules,
            native: Arc::new(NpyConverter),
            external: None,
            output_root: output_root.into(),
        }
    }

    /// 配置外部转换器 (NIfTI 输出)
    pub fn with_external_converter(mut self, converter: Arc<dyn VolumeConverter>) -> Self {
        self.external = Some(converter);
        self
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn has_external_converter(&self) -> bool {
        self.external.is_some()
    }

    pub fn rules(&self) -> &RuleSetHandle {
        &self.rules
    }

    fn converter(&self, format: OutputFormat) -> Result<&Arc<dyn VolumeConverter>> {
        match format {
            OutputFormat::Npy => Ok(&self.native),
            OutputFormat::Nifti => self
                .external
                .as_ref()
                .ok_or_else(|| PacsError::Validation("未配置外部转换器，无法输出 NIfTI".to_string())),
        }
    }

    /// 处理一个检查，`span` 为 (起点, 宽度) 的进度区间
    pub(crate) async fn run_study(
        &self,
        task: &TaskHandle,
        item: &JobItem,
        out_dir: &Path,
        options: &JobOptions,
        span: (f64, f64),
    ) -> Result<StudyResult> {
        let cancel = task.cancel_token();
        let outcome = self.acquire(task, item, out_dir, span, &cancel).await?;

        checkpoint(&cancel)?;
        let (records, mut series) = self.extract(task, &outcome, span).await?;

        checkpoint(&cancel)?;
        let stage = StageReporter::new(task, span, 2);
        if options.classify {
            task.set_step("序列分类");
            self.classify(task, &records, &mut series);
        }
        let metadata_path = write_metadata(&outcome, &records, &series, out_dir).await?;
        task.log(LogLevel::Info, &format!("元数据已写入 {}", metadata_path.display()));
        stage.finish();

        checkpoint(&cancel)?;
        if options.convert {
            self.convert(task, options.output_format, &outcome, &records, &mut series, out_dir, span, &cancel)
                .await?;
        }
        StageReporter::new(task, span, 3).finish();

        Ok(StudyResult {
            accession_number: outcome.accession_number.clone(),
            output_dir: out_dir.to_path_buf(),
            series_count: outcome.series_count(),
            file_count: outcome.file_count(),
            shortfall: outcome.shortfall.clone(),
            metadata_path: Some(metadata_path),
            series,
        })
    }

    async fn acquire(
        &self,
        task: &TaskHandle,
        item: &JobItem,
        out_dir: &Path,
        span: (f64, f64),
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome> {
        checkpoint(cancel)?;
        let stage = StageReporter::new(task, span, 0);
        let outcome = match item {
            JobItem::Accession(accession) => {
                task.set_step("从PACS检索");
                task.log(LogLevel::Info, &format!("开始处理检查号 {}", accession));
                self.retriever.retrieve(accession, out_dir, &stage, cancel).await?
            }
            JobItem::FileSet(path) => {
                task.set_step("导入上传文件");
                task.log(LogLevel::Info, &format!("开始处理上传文件 {}", item.label()));
                let work_dir = out_dir.join(".work");
                let imported = import_file_set(path, &work_dir, out_dir, &stage, cancel).await;
                if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
                    debug!("清理临时目录 {:?} 失败: {}", work_dir, e);
                }
                imported?
            }
        };

        task.log(
            LogLevel::Info,
            &format!("获取 {} 个序列，共 {} 个文件", outcome.series_count(), outcome.file_count()),
        );
        if let Some(shortfall) = &outcome.shortfall {
            task.log(
                LogLevel::Warning,
                &format!(
                    "检索不完整: 预期 {} 个序列，实际 {} 个，缺少 {}",
                    shortfall.expected_series,
                    shortfall.received_series,
                    shortfall.missing_series.join(", ")
                ),
            );
        }
        stage.finish();
        Ok(outcome)
    }

    async fn extract(
        &self,
        task: &TaskHandle,
        outcome: &RetrievalOutcome,
        span: (f64, f64),
    ) -> Result<(Vec<Option<SeriesRecord>>, Vec<SeriesOutcome>)> {
        task.set_step("提取元数据");
        let stage = StageReporter::new(task, span, 1);
        let total = outcome.series.len();
        let mut records = Vec::with_capacity(total);
        let mut series = Vec::with_capacity(total);

        for (i, retrieved) in outcome.series.iter().enumerate() {
            let folder = folder_of(&retrieved.directory);
            let mut entry = SeriesOutcome {
                series_uid: retrieved.identity.series_uid.clone(),
                folder: folder.clone(),
                modality: retrieved.identity.modality.clone(),
                instance_count: retrieved.received,
                extraction_error: None,
                classification: None,
                volume: None,
            };
            match extract_series(retrieved.directory.clone(), self.templates.clone()).await {
                Ok(record) => {
                    entry.modality = Some(record.modality.clone());
                    records.push(Some(record));
                }
                Err(e) => {
                    task.log(LogLevel::Error, &format!("序列 {} 元数据提取失败: {}", folder, e));
                    entry.extraction_error = Some(e.to_string());
                    records.push(None);
                }
            }
            series.push(entry);
            stage.advance(i + 1, total);
        }

        let extracted = records.iter().flatten().count();
        if extracted == 0 {
            return Err(PacsError::Extraction {
                series: outcome.accession_number.clone(),
                message: "所有序列的元数据提取均失败".to_string(),
            });
        }
        task.log(LogLevel::Info, &format!("元数据提取完成: {}/{} 个序列", extracted, total));
        stage.finish();
        Ok((records, series))
    }

    fn classify(&self, task: &TaskHandle, records: &[Option<SeriesRecord>], series: &mut [SeriesOutcome]) {
        let valid: Vec<SeriesRecord> = records.iter().flatten().cloned().collect();
        let classification = self.rules.current().classify_study(&valid);
        for warning in &classification.warnings {
            task.log(LogLevel::Warning, warning);
        }

        let unclassified = classification
            .results
            .iter()
            .filter(|r| r.sequence_class == UNCLASSIFIED)
            .count();
        let mut by_uid: HashMap<String, ClassificationResult> = classification
            .results
            .into_iter()
            .map(|r| (r.series_uid.clone(), r))
            .collect();
        let classified = by_uid.len();
        for entry in series.iter_mut() {
            entry.classification = by_uid.remove(&entry.series_uid);
        }

        if classified == 0 {
            task.log(LogLevel::Info, "没有 MR 序列，跳过分类");
        } else {
            task.log(
                LogLevel::Info,
                &format!("分类完成: {} 个 MR 序列，{} 个未分类", classified, unclassified),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn convert(
        &self,
        task: &TaskHandle,
        format: OutputFormat,
        outcome: &RetrievalOutcome,
        records: &[Option<SeriesRecord>],
        series: &mut [SeriesOutcome],
        out_dir: &Path,
        span: (f64, f64),
        cancel: &CancellationToken,
    ) -> Result<()> {
        let converter = self.converter(format)?;
        task.set_step("格式转换");
        let stage = StageReporter::new(task, span, 3);
        let volume_dir = out_dir.join(VOLUME_DIR);
        let total = series.len();

        for (i, ((retrieved, record), entry)) in outcome.series.iter().zip(records).zip(series.iter_mut()).enumerate() {
            checkpoint(cancel)?;
            if record.is_none() {
                continue;
            }
            let path = converter
                .convert(&retrieved.directory, &volume_dir, &entry.folder)
                .await
                .map_err(|e| match e {
                    PacsError::Conversion(message) => {
                        PacsError::Conversion(format!("序列 {} ({}): {}", entry.folder, converter.name(), message))
                    }
                    other => other,
                })?;
            entry.volume = Some(path);
            stage.advance(i + 1, total);
        }
        task.log(
            LogLevel::Info,
            &format!(
                "转换完成: {} 个 .{} 文件",
                series.iter().filter(|s| s.volume.is_some()).count(),
                converter.extension()
            ),
        );
        Ok(())
    }
}

fn folder_of(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

async fn write_metadata(
    outcome: &RetrievalOutcome,
    records: &[Option<SeriesRecord>],
    series: &[SeriesOutcome],
    out_dir: &Path,
) -> Result<PathBuf> {
    let metadata = StudyMetadata {
        accession_number: &outcome.accession_number,
        generated_at: Utc::now(),
        shortfall: outcome.shortfall.as_ref(),
        series: records
            .iter()
            .zip(series)
            .map(|(record, entry)| SeriesMetadata {
                folder: &entry.folder,
                record: record.as_ref(),
                classification: entry.classification.as_ref(),
                extraction_error: entry.extraction_error.as_deref(),
            })
            .collect(),
    };
    let bytes = serde_json::to_vec_pretty(&metadata)?;
    tokio::fs::create_dir_all(out_dir).await?;
    let path = out_dir.join(METADATA_FILE);
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}
