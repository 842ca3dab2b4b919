//! MR_clean 序列分类
//!
//! 对单个检查的 MR 序列元数据进行规则驱动的分类：
//! 单序列的序列类型、方位、维度等特征，以及跨序列的动态增强分组与时相。

pub mod classifier;
pub mod config;
mod dynamic;
pub mod features;
mod sequence;

pub use classifier::{Classifier, RuleSetHandle, StudyClassification};
pub use config::RuleConfig;
pub use features::{field_strength_band, orientation_from_iop, RefinedImageType};

use serde::{Deserialize, Serialize};

/// 没有任何规则命中时的标签
pub const UNCLASSIFIED: &str = "UNCLASSIFIED";

/// 单个序列的分类结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassificationResult {
    pub series_uid: String,
    pub sequence_class: String,
    pub standard_orientation: String,
    pub standard_dimension: String,
    pub is_fat_suppressed: bool,
    pub is_contrast_enhanced: bool,
    pub has_motion_correction: bool,
    pub refined_image_type: RefinedImageType,
    pub field_strength: String,
    pub manufacturer: String,
    pub dynamic_group: Option<u32>, // 动态组编号，从1开始
    pub dynamic_phase: Option<u32>, // 组内时相，0 为平扫
    pub phase_label: Option<String>,
}
