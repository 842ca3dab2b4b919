//! 分类入口
//!
//! `Classifier` 是纯函数式的：同一规则、同一输入集合总得到同样的结果。
//! `RuleSetHandle` 支持在运行中整体替换规则，进行中的分类继续使用旧规则。

use crate::config::{CompiledPatterns, RuleConfig};
use crate::dynamic::{assign_dynamics, DynamicInput};
use crate::features::{extract_features, SeriesFeatures};
use crate::sequence::classify_sequence;
use crate::ClassificationResult;
use pacs_core::{PacsError, Result, SeriesRecord};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// 一次分类调用的输出
#[derive(Debug, Clone, Default)]
pub struct StudyClassification {
    pub results: Vec<ClassificationResult>,
    pub warnings: Vec<String>,
}

/// 已校验的规则集
#[derive(Debug, Clone)]
pub struct Classifier {
    config: RuleConfig,
    patterns: CompiledPatterns,
}

impl Classifier {
    pub fn new(config: RuleConfig) -> Result<Self> {
        config.validate()?;
        let patterns = CompiledPatterns::compile(&config)?;
        Ok(Self { config, patterns })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RuleConfig::from_path(path)?)
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    fn features(&self, record: &SeriesRecord) -> SeriesFeatures {
        extract_features(record, &self.config, &self.patterns)
    }

    /// 对一组序列分类
    ///
    /// 非MR序列被忽略；结果按输入顺序排列。
    /// 动态分组按检查分别进行，因此调用方应一次传入检查的全部 MR 序列。
    pub fn classify_study(&self, records: &[SeriesRecord]) -> StudyClassification {
        let mr: Vec<&SeriesRecord> = records.iter().filter(|r| r.is_mr()).collect();
        if mr.len() < records.len() {
            debug!("跳过 {} 个非MR序列", records.len() - mr.len());
        }

        let features: Vec<SeriesFeatures> = mr.iter().map(|r| self.features(r)).collect();
        let classes: Vec<String> = mr
            .iter()
            .zip(&features)
            .map(|(record, f)| classify_sequence(record, f, &self.config))
            .collect();

        let inputs: Vec<DynamicInput<'_>> = mr
            .iter()
            .zip(&features)
            .zip(&classes)
            .map(|((record, f), class)| DynamicInput {
                record,
                sequence_class: class,
                protocol_name: &f.protocol_name,
            })
            .collect();
        let (dynamics, warnings) = assign_dynamics(&inputs, &self.config.dynamic, &self.patterns.agent_exclude);

        let results = mr
            .iter()
            .zip(features)
            .zip(classes)
            .zip(dynamics)
            .map(|(((record, f), class), dynamic)| ClassificationResult {
                series_uid: record.series_uid.clone(),
                sequence_class: class,
                standard_orientation: f.orientation,
                standard_dimension: f.dimension,
                is_fat_suppressed: f.is_fat_suppressed,
                is_contrast_enhanced: dynamic.contrast_enhanced,
                has_motion_correction: f.has_motion_correction,
                refined_image_type: f.refined_image_type,
                field_strength: f.field_strength,
                manufacturer: f.manufacturer,
                dynamic_group: dynamic.group,
                dynamic_phase: dynamic.phase,
                phase_label: dynamic.label,
            })
            .collect();

        StudyClassification { results, warnings }
    }
}

/// 可热替换的规则集句柄
#[derive(Clone)]
pub struct RuleSetHandle {
    source: Option<PathBuf>,
    current: Arc<RwLock<Arc<Classifier>>>,
}

impl RuleSetHandle {
    pub fn new(classifier: Classifier) -> Self {
        Self {
            source: None,
            current: Arc::new(RwLock::new(Arc::new(classifier))),
        }
    }

    /// 从文件加载，之后可通过 `reload` 重新读取
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let classifier = Classifier::from_path(&path)?;
        Ok(Self {
            source: Some(path),
            current: Arc::new(RwLock::new(Arc::new(classifier))),
        })
    }

    /// 当前规则快照
    pub fn current(&self) -> Arc<Classifier> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// 整体替换规则集
    pub fn replace(&self, classifier: Classifier) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(classifier);
    }

    /// 从原文件重新加载；新规则非法时保留旧规则并返回错误
    pub fn reload(&self) -> Result<()> {
        let path = self
            .source
            .as_ref()
            .ok_or_else(|| PacsError::Config("规则集不是从文件加载的，无法重新加载".to_string()))?;
        let classifier = Classifier::from_path(path)?;
        self.replace(classifier);
        info!("分类规则已重新加载: {}", path.display());
        Ok(())
    }
}
