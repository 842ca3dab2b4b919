//! 任务编排器
//!
//! 对外提供提交、查询、取消和订阅；每个任务在独立的 tokio 任务中顺序执行各阶段。

use crate::registry::TaskRegistry;
use crate::request::{JobItem, JobKind, JobOptions, JobRequest, OutputFormat};
use crate::result::{StudyFailure, TaskResult};
use crate::stages::{checkpoint, Pipeline};
use crate::state_machine::TaskStateMachine;
use crate::task::{TaskHandle, TaskSnapshot, TaskSubscription};
use chrono::Utc;
use pacs_core::utils::sanitize_folder_name;
use pacs_core::{LogLevel, PacsError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// 任务编排器
pub struct Orchestrator {
    registry: Arc<TaskRegistry>,
    pipeline: Arc<Pipeline>,
    state_machine: Arc<TaskStateMachine>,
}

impl Orchestrator {
    pub fn new(pipeline: Pipeline, retention: Duration) -> Self {
        Self {
            registry: Arc::new(TaskRegistry::new(retention)),
            pipeline: Arc::new(pipeline),
            state_machine: Arc::new(TaskStateMachine::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// 提交任务，立即返回任务ID
    ///
    /// 请求形状不合法时直接返回错误，不创建任务。
    pub fn submit(&self, request: JobRequest, options: JobOptions) -> Result<Uuid> {
        let items = request.validate()?;
        if options.convert && options.output_format == OutputFormat::Nifti && !self.pipeline.has_external_converter() {
            return Err(PacsError::Validation("未配置外部转换器，无法输出 NIfTI".to_string()));
        }

        let kind = request.kind();
        let task = TaskHandle::new(kind, self.state_machine.clone());
        let id = task.id();
        self.registry.insert(task.clone());
        match kind {
            JobKind::Batch => task.log(LogLevel::Info, &format!("开始批量处理 {} 个检查", items.len())),
            _ => task.log(LogLevel::Info, &format!("任务已创建: {}", items[0].label())),
        }
        info!(task_id = %id, "提交 {:?} 任务", kind);

        tokio::spawn(run_task(self.pipeline.clone(), task, kind, items, options));
        Ok(id)
    }

    fn handle(&self, id: &Uuid) -> Result<Arc<TaskHandle>> {
        self.registry
            .get(id)
            .ok_or_else(|| PacsError::NotFound(format!("任务 {} 不存在", id)))
    }

    pub fn get_status(&self, id: &Uuid) -> Result<TaskSnapshot> {
        Ok(self.handle(id)?.snapshot())
    }

    /// 请求取消，只确认请求已记录
    pub fn cancel(&self, id: &Uuid) -> Result<bool> {
        Ok(self.handle(id)?.request_cancel())
    }

    pub fn subscribe(&self, id: &Uuid) -> Result<TaskSubscription> {
        Ok(self.handle(id)?.subscribe())
    }

    pub fn take_result(&self, id: &Uuid) -> Result<Option<TaskResult>> {
        Ok(self.handle(id)?.take_result())
    }

    pub fn history(&self) -> Vec<TaskSnapshot> {
        self.registry.history()
    }

    /// 等待任务进入终止状态
    pub async fn wait(&self, id: &Uuid) -> Result<TaskSnapshot> {
        let task = self.handle(id)?;
        let mut subscription = task.subscribe();
        while subscription.next().await.is_some() {}
        Ok(task.snapshot())
    }

    /// 周期性回收过期任务
    pub fn spawn_eviction(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_expired(Utc::now());
                    }
                }
            }
            debug!("任务回收已停止");
        })
    }
}

async fn run_task(pipeline: Arc<Pipeline>, task: Arc<TaskHandle>, kind: JobKind, items: Vec<JobItem>, options: JobOptions) {
    if let Err(e) = task.start() {
        error!(task_id = %task.id(), "任务无法启动: {}", e);
        return;
    }
    let root = pipeline.output_root().join(task.id().to_string());

    let finished = match execute(&pipeline, &task, kind, &items, &options, &root).await {
        Ok(result) => {
            let mut message = format!("处理完成: {} 个序列，{} 个文件", result.series_count, result.file_count);
            if !result.failures.is_empty() {
                message.push_str(&format!("，{} 个检查失败", result.failures.len()));
            }
            task.log(LogLevel::Success, &message);
            task.complete(result)
        }
        Err(PacsError::Cancelled) => {
            discard_output(&root).await;
            task.log(LogLevel::Warning, "任务已取消，未完成的输出已删除");
            task.mark_cancelled()
        }
        Err(e) => task.fail(&format!("处理失败: {}", e)),
    };
    if let Err(e) = finished {
        error!(task_id = %task.id(), "任务状态更新失败: {}", e);
    }
}

async fn execute(
    pipeline: &Pipeline,
    task: &TaskHandle,
    kind: JobKind,
    items: &[JobItem],
    options: &JobOptions,
    root: &Path,
) -> Result<TaskResult> {
    let cancel = task.cancel_token();
    let total = items.len();
    let width = 100.0 / total as f64;
    let mut studies = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (i, item) in items.iter().enumerate() {
        checkpoint(&cancel)?;
        let label = item.label();
        let out_dir = match kind {
            JobKind::Batch => {
                task.log(LogLevel::Info, &format!("处理第 {}/{} 个检查: {}", i + 1, total, label));
                root.join(sanitize_folder_name(&label))
            }
            _ => root.to_path_buf(),
        };

        match pipeline.run_study(task, item, &out_dir, options, (i as f64 * width, width)).await {
            Ok(study) => {
                if kind == JobKind::Batch {
                    task.log(LogLevel::Success, &format!("{} 处理完成", label));
                }
                studies.push(study);
            }
            Err(PacsError::Cancelled) => return Err(PacsError::Cancelled),
            Err(e) if kind == JobKind::Batch => {
                task.log(LogLevel::Error, &format!("{} 处理失败: {}", label, e));
                failures.push(StudyFailure {
                    accession_number: label,
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
        task.set_progress((i + 1) as f64 * width);
    }

    if studies.is_empty() {
        return Err(PacsError::Workflow(format!("全部 {} 个检查处理失败", total)));
    }
    Ok(TaskResult::new(root.to_path_buf(), studies, failures))
}

async fn discard_output(root: &Path) {
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => debug!("已删除 {:?}", root),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("删除 {:?} 失败: {}", root, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::TaskState;
    use async_trait::async_trait;
    use dicom_core::{DataElement, PrimitiveValue, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::{FileMetaTableBuilder, InMemDicomObject};
    use pacs_classify::{Classifier, RuleConfig, RuleSetHandle};
    use pacs_core::utils::series_folder_name;
    use pacs_core::{ProgressReporter, SeriesIdentity};
    use pacs_dicom::{RetrievalOutcome, RetrievalShortfall, RetrievedSeries, StudyRetriever, TemplateSet};
    use std::collections::HashMap;
    use std::path::PathBuf;

    const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

    #[derive(Clone)]
    struct FixtureSeries {
        series_uid: String,
        number: i32,
        description: &'static str,
        modality: &'static str,
        image_type: Option<&'static [&'static str]>,
        tr_te: Option<(f64, f64)>,
        instances: usize,
    }

    fn mr(number: i32, description: &'static str, tr: f64, te: f64) -> FixtureSeries {
        FixtureSeries {
            series_uid: format!("1.2.826.0.1.{}", number),
            number,
            description,
            modality: "MR",
            image_type: Some(&["ORIGINAL", "PRIMARY", "M", "ND"]),
            tr_te: Some((tr, te)),
            instances: 2,
        }
    }

    fn ct(number: i32) -> FixtureSeries {
        FixtureSeries {
            series_uid: format!("1.2.826.0.1.{}", number),
            number,
            description: "head",
            modality: "CT",
            image_type: Some(&["ORIGINAL", "PRIMARY", "AXIAL"]),
            tr_te: None,
            instances: 1,
        }
    }

    fn write_instance(dir: &Path, series: &FixtureSeries, index: usize) {
        let sop = format!("{}.{}", series.series_uid, index + 1);
        let sop_class = if series.modality == "MR" {
            "1.2.840.10008.5.1.4.1.1.4"
        } else {
            "1.2.840.10008.5.1.4.1.1.2"
        };
        let mut obj = InMemDicomObject::new_empty();
        let number = series.number.to_string();
        let instance = (index + 1).to_string();
        for (tag, vr, value) in [
            (tags::SOP_CLASS_UID, VR::UI, sop_class),
            (tags::SOP_INSTANCE_UID, VR::UI, sop.as_str()),
            (tags::STUDY_INSTANCE_UID, VR::UI, "1.2.826.0.1"),
            (tags::SERIES_INSTANCE_UID, VR::UI, series.series_uid.as_str()),
            (tags::SERIES_NUMBER, VR::IS, number.as_str()),
            (tags::INSTANCE_NUMBER, VR::IS, instance.as_str()),
            (tags::SERIES_DESCRIPTION, VR::LO, series.description),
            (tags::PROTOCOL_NAME, VR::LO, series.description),
            (tags::MODALITY, VR::CS, series.modality),
            (tags::PHOTOMETRIC_INTERPRETATION, VR::CS, "MONOCHROME2"),
        ] {
            obj.put(DataElement::new(tag, vr, PrimitiveValue::from(value)));
        }
        if let Some(image_type) = series.image_type {
            let values: Vec<String> = image_type.iter().map(|s| s.to_string()).collect();
            obj.put(DataElement::new(tags::IMAGE_TYPE, VR::CS, PrimitiveValue::Strs(values.into())));
        }
        if let Some((tr, te)) = series.tr_te {
            obj.put(DataElement::new(tags::REPETITION_TIME, VR::DS, PrimitiveValue::from(tr.to_string())));
            obj.put(DataElement::new(tags::ECHO_TIME, VR::DS, PrimitiveValue::from(te.to_string())));
            obj.put(DataElement::new(tags::MAGNETIC_FIELD_STRENGTH, VR::DS, PrimitiveValue::from("3")));
            obj.put(DataElement::new(tags::SCANNING_SEQUENCE, VR::CS, PrimitiveValue::from("SE")));
        }
        for (tag, value) in [
            (tags::ROWS, 2u16),
            (tags::COLUMNS, 2),
            (tags::BITS_ALLOCATED, 16),
            (tags::BITS_STORED, 16),
            (tags::SAMPLES_PER_PIXEL, 1),
            (tags::PIXEL_REPRESENTATION, 0),
        ] {
            obj.put(DataElement::new(tag, VR::US, PrimitiveValue::from(value)));
        }
        let pixels: Vec<u16> = vec![1, 2, 3, 4];
        obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(pixels.into())));

        let file = obj
            .with_meta(
                FileMetaTableBuilder::new()
                    .transfer_syntax(EXPLICIT_VR_LE)
                    .media_storage_sop_class_uid(sop_class)
                    .media_storage_sop_instance_uid(sop.as_str()),
            )
            .unwrap();
        std::fs::create_dir_all(dir).unwrap();
        file.write_to_file(dir.join(format!("{}.dcm", sop))).unwrap();
    }

    /// 把预置的序列写入目标目录的检索器
    #[derive(Default)]
    struct FixtureRetriever {
        studies: HashMap<String, Vec<FixtureSeries>>,
        missing: Vec<String>,      // 模拟 C-FIND 报告但未到达的序列
        cancel_after_retrieve: bool, // 检索结束后请求取消
    }

    #[async_trait]
    impl StudyRetriever for FixtureRetriever {
        async fn retrieve(
            &self,
            accession_number: &str,
            destination: &Path,
            reporter: &dyn ProgressReporter,
            cancel: &CancellationToken,
        ) -> pacs_core::Result<RetrievalOutcome> {
            let series = self
                .studies
                .get(accession_number)
                .ok_or_else(|| PacsError::NotFound(format!("检查号 {} 没有匹配的检查", accession_number)))?;
            let mut retrieved = Vec::new();
            for (i, fixture) in series.iter().enumerate() {
                let folder = series_folder_name(Some(fixture.number), i, Some(fixture.description));
                let dir = destination.join(folder);
                for n in 0..fixture.instances {
                    write_instance(&dir, fixture, n);
                }
                retrieved.push(RetrievedSeries {
                    identity: SeriesIdentity {
                        study_uid: "1.2.826.0.1".to_string(),
                        series_uid: fixture.series_uid.clone(),
                        series_number: Some(fixture.number),
                        series_description: Some(fixture.description.to_string()),
                        modality: Some(fixture.modality.to_string()),
                        instance_count: Some(fixture.instances as u32),
                    },
                    directory: dir,
                    received: fixture.instances,
                    reported_completed: fixture.instances as u32,
                    reported_failed: 0,
                });
                reporter.advance(i + 1, series.len());
            }
            let shortfall = (!self.missing.is_empty()).then(|| RetrievalShortfall {
                expected_series: series.len() + self.missing.len(),
                received_series: series.len(),
                missing_series: self.missing.clone(),
            });
            if self.cancel_after_retrieve {
                cancel.cancel();
            }
            Ok(RetrievalOutcome {
                accession_number: accession_number.to_string(),
                series: retrieved,
                shortfall,
            })
        }
    }

    fn orchestrator(retriever: FixtureRetriever, root: &Path) -> Orchestrator {
        let rules = RuleSetHandle::new(Classifier::new(RuleConfig::default()).unwrap());
        let pipeline = Pipeline::new(Arc::new(retriever), Arc::new(TemplateSet::builtin()), rules, root);
        Orchestrator::new(pipeline, Duration::from_secs(3600))
    }

    fn standard_study() -> Vec<FixtureSeries> {
        vec![mr(1, "t1_tse_tra", 500.0, 10.0), mr(2, "t2_tse_tra", 4000.0, 100.0), ct(3)]
    }

    #[tokio::test]
    async fn test_single_accession_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut retriever = FixtureRetriever::default();
        retriever.studies.insert("M25053000056".to_string(), standard_study());
        let orchestrator = orchestrator(retriever, dir.path());

        let id = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "M25053000056".to_string(),
                },
                JobOptions::default(),
            )
            .unwrap();
        let mut subscription = orchestrator.subscribe(&id).unwrap();
        let mut progress = Vec::new();
        while let Some(event) = subscription.next().await {
            progress.push(event.progress);
        }
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));

        let snapshot = orchestrator.get_status(&id).unwrap();
        assert_eq!(snapshot.state, TaskState::Completed, "{:?}", snapshot.logs);
        assert_eq!(snapshot.progress, 100);

        let result = snapshot.result.unwrap();
        assert_eq!(result.series_count, 3);
        let study = &result.studies[0];
        assert_eq!(study.classified_count(), 2);
        assert!(study
            .series
            .iter()
            .filter_map(|s| s.classification.as_ref())
            .all(|c| !c.sequence_class.is_empty()));
        assert_eq!(study.volume_count(), 3);
        assert!(study.metadata_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_cancel_between_stages_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut retriever = FixtureRetriever {
            cancel_after_retrieve: true,
            ..FixtureRetriever::default()
        };
        retriever.studies.insert("A1".to_string(), standard_study());
        let orchestrator = orchestrator(retriever, dir.path());

        let id = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "A1".to_string(),
                },
                JobOptions::default(),
            )
            .unwrap();
        let snapshot = orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Cancelled);
        assert!(snapshot.result.is_none());
        assert!(!dir.path().join(id.to_string()).join(crate::stages::METADATA_FILE).exists());
        assert!(!dir.path().join(id.to_string()).exists());
    }

    /// 对 T2 序列报告转换失败的转换器
    struct RejectingConverter;

    #[async_trait]
    impl pacs_dicom::VolumeConverter for RejectingConverter {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn extension(&self) -> &str {
            "nii.gz"
        }

        async fn convert(&self, series_dir: &Path, output_dir: &Path, name: &str) -> pacs_core::Result<PathBuf> {
            if name.contains("t2") {
                return Err(PacsError::Conversion(format!("{:?} 像素数据无法解码", series_dir)));
            }
            let path = output_dir.join(format!("{}.nii.gz", name));
            tokio::fs::create_dir_all(output_dir).await?;
            tokio::fs::write(&path, b"nii").await?;
            Ok(path)
        }
    }

    #[tokio::test]
    async fn test_conversion_failure_fails_task_and_keeps_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut retriever = FixtureRetriever::default();
        retriever.studies.insert("A1".to_string(), standard_study());
        let rules = RuleSetHandle::new(Classifier::new(RuleConfig::default()).unwrap());
        let pipeline = Pipeline::new(Arc::new(retriever), Arc::new(TemplateSet::builtin()), rules, dir.path())
            .with_external_converter(Arc::new(RejectingConverter));
        let orchestrator = Orchestrator::new(pipeline, Duration::from_secs(3600));

        let options = JobOptions {
            output_format: OutputFormat::Nifti,
            ..JobOptions::default()
        };
        let id = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "A1".to_string(),
                },
                options,
            )
            .unwrap();
        let snapshot = orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed, "{:?}", snapshot.logs);
        assert!(snapshot.result.is_none());
        assert!(orchestrator.take_result(&id).unwrap().is_none());

        let last = snapshot.logs.last().unwrap();
        assert_eq!(last.level, LogLevel::Error);
        assert!(last.message.contains("格式转换失败"), "{}", last.message);
        assert!(last.message.contains("rejecting"), "{}", last.message);

        // 失败时保留已检索的原始文件和元数据
        let root = dir.path().join(id.to_string());
        assert!(root.join(crate::stages::METADATA_FILE).exists());
        let raw_files: usize = std::fs::read_dir(&root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .map(|p| {
                std::fs::read_dir(p)
                    .unwrap()
                    .filter(|e| e.as_ref().unwrap().path().extension().map_or(false, |ext| ext == "dcm"))
                    .count()
            })
            .sum();
        assert_eq!(raw_files, 5);
        // 失败前已转换的序列仍在
        assert!(root.join(crate::stages::VOLUME_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_partial_retrieval_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut retriever = FixtureRetriever {
            missing: vec!["1.2.826.0.1.9".to_string()],
            ..FixtureRetriever::default()
        };
        retriever.studies.insert(
            "A1".to_string(),
            vec![mr(1, "a", 500.0, 10.0), mr(2, "b", 500.0, 10.0), mr(3, "c", 500.0, 10.0), ct(4)],
        );
        let orchestrator = orchestrator(retriever, dir.path());

        let options = JobOptions {
            convert: false,
            ..JobOptions::default()
        };
        let id = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "A1".to_string(),
                },
                options,
            )
            .unwrap();
        let snapshot = orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.result.unwrap().missing_series(), 1);
        assert!(snapshot.logs.iter().any(|l| l.level == LogLevel::Warning));
    }

    #[tokio::test]
    async fn test_missing_image_type_fails_only_that_series() {
        let dir = tempfile::tempdir().unwrap();
        let mut broken = mr(2, "no_image_type", 500.0, 10.0);
        broken.image_type = None;
        let mut retriever = FixtureRetriever::default();
        retriever
            .studies
            .insert("A1".to_string(), vec![mr(1, "t1", 500.0, 10.0), broken, mr(3, "t2", 4000.0, 100.0)]);
        let orchestrator = orchestrator(retriever, dir.path());

        let id = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "A1".to_string(),
                },
                JobOptions::default(),
            )
            .unwrap();
        let snapshot = orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed, "{:?}", snapshot.logs);
        let result = snapshot.result.unwrap();
        let study = &result.studies[0];
        assert!(study.series[1].extraction_error.is_some());
        assert!(study.series[1].volume.is_none());
        assert_eq!(study.classified_count(), 2);
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut retriever = FixtureRetriever::default();
        retriever.studies.insert("A1".to_string(), vec![mr(1, "t1", 500.0, 10.0)]);
        let orchestrator = orchestrator(retriever, dir.path());

        let id = orchestrator
            .submit(JobRequest::batch_from_text("A1\n\nMISSING\n"), JobOptions::default())
            .unwrap();
        let snapshot = orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Completed);
        let result = snapshot.result.unwrap();
        assert_eq!(result.studies.len(), 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].accession_number, "MISSING");
        assert!(result.studies[0].output_dir.ends_with("A1"));

        let id = orchestrator
            .submit(JobRequest::batch_from_text("X1\nX2"), JobOptions::default())
            .unwrap();
        let snapshot = orchestrator.wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
        assert_eq!(snapshot.logs.last().unwrap().level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_invalid_submissions_create_no_task() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(FixtureRetriever::default(), dir.path());

        let err = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: String::new(),
                },
                JobOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));

        let nifti = JobOptions {
            output_format: OutputFormat::Nifti,
            ..JobOptions::default()
        };
        let err = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "A1".to_string(),
                },
                nifti,
            )
            .unwrap_err();
        assert!(matches!(err, PacsError::Validation(_)));
        assert!(orchestrator.registry().is_empty());
        assert!(matches!(
            orchestrator.get_status(&Uuid::new_v4()),
            Err(PacsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_after_completion_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut retriever = FixtureRetriever::default();
        retriever.studies.insert("A1".to_string(), vec![ct(1)]);
        let orchestrator = orchestrator(retriever, dir.path());

        let id = orchestrator
            .submit(
                JobRequest::Single {
                    accession_number: "A1".to_string(),
                },
                JobOptions::default(),
            )
            .unwrap();
        orchestrator.wait(&id).await.unwrap();
        assert!(!orchestrator.cancel(&id).unwrap());
        assert_eq!(orchestrator.get_status(&id).unwrap().state, TaskState::Completed);
        assert!(orchestrator.take_result(&id).unwrap().is_some());
        assert!(orchestrator.get_status(&id).unwrap().result.is_none());
    }
}
