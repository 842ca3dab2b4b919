//! 分类规则配置
//!
//! 规则以强类型结构描述，加载时完成校验与正则编译。
//! 所有有序列表都按声明顺序求值，首个命中即返回。

use pacs_core::{PacsError, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// 场强分档的默认键
pub const DEFAULT_BAND: &str = "default";

/// 完整规则配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RuleConfig {
    pub thresholds: Thresholds,
    pub classification: ClassificationRules,
    pub orientation: OrientationRules,
    pub fat_suppression: FatSuppressionRules,
    pub atomic_features: AtomicFeatureRules,
    pub subtype_suffix: SubtypeSuffixRules,
    pub dynamic: DynamicRules,
}

/// 按场强分档的 TR/TE/TI 阈值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub field_strength: BTreeMap<String, BandThresholds>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BandThresholds {
    pub t1_tr_max: f64,
    pub t1_te_max: f64,
    pub t2_tr_min: f64,
    pub t2_te_min: f64,
    pub pd_te_max: f64,
    pub flair_ti_min: f64,
    pub stir_ti_max: f64,
}

impl BandThresholds {
    fn values(&self) -> [f64; 7] {
        [
            self.t1_tr_max,
            self.t1_te_max,
            self.t2_tr_min,
            self.t2_te_min,
            self.pd_te_max,
            self.flair_ti_min,
            self.stir_ti_max,
        ]
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        let standard = BandThresholds {
            t1_tr_max: 800.0,
            t1_te_max: 30.0,
            t2_tr_min: 2000.0,
            t2_te_min: 80.0,
            pd_te_max: 40.0,
            flair_ti_min: 1500.0,
            stir_ti_max: 250.0,
        };
        let mut field_strength = BTreeMap::new();
        field_strength.insert(DEFAULT_BAND.to_string(), standard);
        field_strength.insert("1.5T".to_string(), standard);
        field_strength.insert(
            "3.0T".to_string(),
            BandThresholds {
                t1_tr_max: 1000.0,
                flair_ti_min: 1800.0,
                ..standard
            },
        );
        field_strength.insert(
            "Low-Field".to_string(),
            BandThresholds {
                t1_tr_max: 700.0,
                flair_ti_min: 1200.0,
                stir_ti_max: 200.0,
                ..standard
            },
        );
        field_strength.insert(
            "High-Field".to_string(),
            BandThresholds {
                t1_tr_max: 1200.0,
                flair_ti_min: 2000.0,
                ..standard
            },
        );
        Self { field_strength }
    }
}

/// 名称优先覆盖规则 (ruleA)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NameOverride {
    pub label: String,
    #[serde(default)]
    pub protocol_keywords: Vec<String>,
    #[serde(default)]
    pub series_description_keywords: Vec<String>,
    /// 命中指定的精细图像类型时也视为匹配
    #[serde(default, rename = "refinedImageType", alias = "refined_image_type")]
    pub refined_image_type: Option<String>,
}

impl NameOverride {
    fn protocol(label: &str, keywords: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            protocol_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            series_description_keywords: Vec::new(),
            refined_image_type: None,
        }
    }

    fn description(label: &str, keywords: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            protocol_keywords: Vec::new(),
            series_description_keywords: keywords.iter().map(|s| s.to_string()).collect(),
            refined_image_type: None,
        }
    }
}

/// 序列家族判定规则
///
/// 已设置的条件必须全部满足；`protocol_keywords` 命中任意一个即可。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FamilyRule {
    pub family: String,
    #[serde(default)]
    pub scanning_sequence: Option<String>,   // ScanningSequence 包含
    #[serde(default)]
    pub sequence_variant: Option<String>,    // SequenceVariant 包含
    #[serde(default)]
    pub protocol_keywords: Vec<String>,      // 协议名关键词
    #[serde(default)]
    pub echo_train_length_above: Option<f64>, // EchoTrainLength 严格大于
    /// 固定对比度标签，命中后不再按 TR/TE 判断加权
    #[serde(default)]
    pub contrast: Option<String>,
}

impl FamilyRule {
    fn new(family: &str, scanning_sequence: &str) -> Self {
        Self {
            family: family.to_string(),
            scanning_sequence: Some(scanning_sequence.to_string()),
            sequence_variant: None,
            protocol_keywords: Vec::new(),
            echo_train_length_above: None,
            contrast: None,
        }
    }

    fn has_condition(&self) -> bool {
        self.scanning_sequence.is_some()
            || self.sequence_variant.is_some()
            || !self.protocol_keywords.is_empty()
            || self.echo_train_length_above.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FmriRule {
    pub scan_seq_token: String,
    pub protocol_keywords: Vec<String>,
    pub class: String,
}

impl Default for FmriRule {
    fn default() -> Self {
        Self {
            scan_seq_token: "ep".to_string(),
            protocol_keywords: vec!["fmri".to_string(), "bold".to_string()],
            class: "fMRI_BOLD".to_string(),
        }
    }
}

/// 物理参数无法判定时的名称兜底
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FallbackRules {
    pub tse_tokens: Vec<String>,
    pub se_token: String,
    pub tse_dark_fluid_to_flair: String,
    pub mpr_iso_tokens: Vec<String>,
    pub requires_dimension_for_flash3d: String,
}

impl Default for FallbackRules {
    fn default() -> Self {
        Self {
            tse_tokens: vec!["tse".to_string(), "fse".to_string()],
            se_token: "se".to_string(),
            tse_dark_fluid_to_flair: "tse_dark_fluid".to_string(),
            mpr_iso_tokens: vec!["mpr".to_string(), "iso".to_string()],
            requires_dimension_for_flash3d: "3D".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotionCorrectionRule {
    pub protocol_keywords: Vec<String>,
    pub suffix: String,
}

impl Default for MotionCorrectionRule {
    fn default() -> Self {
        Self {
            protocol_keywords: vec!["blade".to_string(), "propeller".to_string()],
            suffix: "_MC".to_string(),
        }
    }
}

/// 分类规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationRules {
    #[serde(rename = "ruleA", alias = "rule_a")]
    pub rule_a: Vec<NameOverride>,
    pub dwi_b_value_min: f64,
    pub dti_keyword: String,
    pub fmri: FmriRule,
    /// 分类用的 STIR 最小 TI，上限取自场强阈值
    pub stir_ti_min: f64,
    pub sequence_family: Vec<FamilyRule>,
    pub fallback: FallbackRules,
    pub motion_correction: MotionCorrectionRule,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        let mut localizer = NameOverride::protocol("LOCALIZER", &["localizer", "survey", "scout"]);
        localizer.refined_image_type = Some("LOCALIZER".to_string());

        let single_shot_by_name = FamilyRule {
            protocol_keywords: vec!["haste".to_string(), "ssfse".to_string()],
            contrast: Some("T2_SE_SingleShot".to_string()),
            ..FamilyRule::new("SE_SingleShot", "se")
        };
        let single_shot_by_etl = FamilyRule {
            echo_train_length_above: Some(128.0),
            contrast: Some("T2_SE_SingleShot".to_string()),
            ..FamilyRule::new("SE_SingleShot", "se")
        };

        Self {
            rule_a: vec![
                localizer,
                NameOverride::protocol("T1_MAP", &["t1_map", "t1map"]),
                NameOverride::protocol("T2_MAP", &["t2_map", "t2map"]),
                NameOverride::protocol("ADC", &["adc"]),
                NameOverride::protocol("FA_MAP", &["fa_map"]),
                NameOverride::protocol("SUBTRACTION", &["sub", "subtract"]),
                NameOverride::protocol("MRA", &["mra", "mrv", "tof"]),
                NameOverride::protocol("SWI", &["swi", "swan"]),
                NameOverride::protocol("PWI", &["pwi", "perf", "dsc"]),
                NameOverride::protocol("MRS", &["mrs", "svs", "csi", "spectro"]),
                NameOverride::description("BREATH MOVEMENT", &["resp"]),
                NameOverride::description("MIP", &["mip"]),
            ],
            dwi_b_value_min: 50.0,
            dti_keyword: "dti".to_string(),
            fmri: FmriRule::default(),
            stir_ti_min: 90.0,
            sequence_family: vec![
                FamilyRule {
                    sequence_variant: Some("ss".to_string()),
                    ..FamilyRule::new("GRE_STEADY_STATE", "gr")
                },
                FamilyRule {
                    sequence_variant: Some("sp".to_string()),
                    ..FamilyRule::new("GRE_SPOILED", "gr")
                },
                FamilyRule::new("GRE", "gr"),
                single_shot_by_name,
                single_shot_by_etl,
                FamilyRule {
                    echo_train_length_above: Some(1.0),
                    ..FamilyRule::new("TSE", "se")
                },
                FamilyRule::new("SE", "se"),
            ],
            fallback: FallbackRules::default(),
            motion_correction: MotionCorrectionRule::default(),
        }
    }
}

/// 方位关键词回退
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrientationKeywords {
    pub label: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrientationRules {
    /// 主轴分量平方低于法向量模长平方的该比例时判为斜位
    pub oblique_dominance_ratio: f64,
    pub fallback_keywords: Vec<OrientationKeywords>,
}

impl Default for OrientationRules {
    fn default() -> Self {
        let entry = |label: &str, keywords: &[&str]| OrientationKeywords {
            label: label.to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
        };
        Self {
            oblique_dominance_ratio: 0.9,
            fallback_keywords: vec![
                entry("AX", &["tra", "ax"]),
                entry("SAG", &["sag"]),
                entry("COR", &["cor"]),
            ],
        }
    }
}

/// 脂肪抑制判定，优先级: STIR -> Dixon水像 -> ScanOptions -> 协议名
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FatSuppressionRules {
    pub ir_token: String,
    pub stir_ti_min: f64,
    pub stir_ti_max: f64,
    pub dixon_water_tokens: Vec<String>,
    pub scan_options_fs_token: String,
    pub protocol_keywords: Vec<String>,
}

impl Default for FatSuppressionRules {
    fn default() -> Self {
        Self {
            ir_token: "IR".to_string(),
            stir_ti_min: 100.0,
            stir_ti_max: 250.0,
            dixon_water_tokens: vec!["W".to_string(), "WATER".to_string()],
            scan_options_fs_token: "FS".to_string(),
            protocol_keywords: ["fs", "fatsat", "spair", "stir", "fat sep", "dixon"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManufacturerPattern {
    pub pattern: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AtomicFeatureRules {
    pub motion_correction_protocol_regex: String,
    pub localizer_protocol_keywords: Vec<String>,
    pub manufacturers: Vec<ManufacturerPattern>,
}

impl Default for AtomicFeatureRules {
    fn default() -> Self {
        let m = |pattern: &str, label: &str| ManufacturerPattern {
            pattern: pattern.to_string(),
            label: label.to_string(),
        };
        Self {
            motion_correction_protocol_regex: "propeller|blade|radial|star".to_string(),
            localizer_protocol_keywords: vec![
                "localizer".to_string(),
                "survey".to_string(),
                "scout".to_string(),
            ],
            manufacturers: vec![
                m("siemens", "Siemens"),
                m("philips", "Philips"),
                m("ge medical|ge healthcare", "GE"),
                m("uih|united imaging", "UIH"),
                m("anke", "Anke"),
                m("canon", "Canon"),
                m("fujifilm", "Fujifilm"),
                m("hitachi", "Hitachi"),
                m("mindray", "Mindray"),
                m("shimadzu", "Shimadzu"),
            ],
        }
    }
}

/// Dixon 等多输出序列的亚型后缀
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubtypeSuffixRules {
    pub water_tokens: Vec<String>,
    pub fat_tokens: Vec<String>,
    pub inphase_tokens: Vec<String>,
    pub outphase_tokens: Vec<String>,
    pub t2_star_echo_marker: String,
    pub t2_star_echo_split_token: String,
}

impl Default for SubtypeSuffixRules {
    fn default() -> Self {
        let v = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            water_tokens: v(&["water"]),
            fat_tokens: v(&["fat"]),
            inphase_tokens: v(&["inphase", "in_phase"]),
            outphase_tokens: v(&["outphase", "out_phase"]),
            t2_star_echo_marker: "t2_star_echo".to_string(),
            t2_star_echo_split_token: "echo".to_string(),
        }
    }
}

/// 增强判定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ContrastRule {
    pub protocol_prefix: String,
    pub agent_field: String,
    pub agent_exclude_regex: String,
}

impl Default for ContrastRule {
    fn default() -> Self {
        Self {
            protocol_prefix: "t1".to_string(),
            agent_field: "ContrastBolusAgent".to_string(),
            agent_exclude_regex: "no".to_string(),
        }
    }
}

/// 延迟期增强传播
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PropagateRule {
    pub t1_contains: String,
    pub propagated_phase: String,
}

impl Default for PropagateRule {
    fn default() -> Self {
        Self {
            t1_contains: "T1".to_string(),
            propagated_phase: "POST_PROPAGATED".to_string(),
        }
    }
}

/// 动态分组规则
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DynamicRules {
    pub exclude_sequence_classes: Vec<String>,
    /// 指纹字段，`sequenceClass` 表示分类结果，其余为标签名
    pub fingerprint_fields: Vec<String>,
    /// 按列表格式化的空间字段
    pub spatial_fields: Vec<String>,
    pub list_round_decimals: u32,
    pub numeric_round_decimals: u32,
    /// 时相排序字段 (DICOM TM)
    pub ordering_field: String,
    pub pre_label: String,
    pub post_prefix: String,
    pub contrast: ContrastRule,
    pub propagate: PropagateRule,
}

impl Default for DynamicRules {
    fn default() -> Self {
        let v = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            exclude_sequence_classes: v(&["DWI", "DTI", "ADC", "FA_MAP", "MRS", "PWI", "LOCALIZER"]),
            fingerprint_fields: v(&[
                "ImagePositionPatient",
                "ImageOrientationPatient",
                "sequenceClass",
                "SliceThickness",
                "RepetitionTime",
                "EchoTime",
                "FlipAngle",
            ]),
            spatial_fields: v(&["ImagePositionPatient", "ImageOrientationPatient"]),
            list_round_decimals: 2,
            numeric_round_decimals: 1,
            ordering_field: "SeriesTime".to_string(),
            pre_label: "PRE".to_string(),
            post_prefix: "POST_".to_string(),
            contrast: ContrastRule::default(),
            propagate: PropagateRule::default(),
        }
    }
}

impl RuleConfig {
    /// 从JSON文件加载并校验
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| PacsError::Config(format!("无法读取规则配置 {}: {}", path.display(), e)))?;
        let config = Self::from_json_str(&text)?;
        info!("已加载分类规则配置: {}", path.display());
        Ok(config)
    }

    /// 从JSON文本加载并校验
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: RuleConfig = serde_json::from_str(text)
            .map_err(|e| PacsError::Config(format!("规则配置格式错误: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置，非法配置在加载时即失败
    pub fn validate(&self) -> Result<()> {
        if !self.thresholds.field_strength.contains_key(DEFAULT_BAND) {
            return Err(PacsError::Config(
                "thresholds.field_strength 缺少 default 分档".to_string(),
            ));
        }
        for (band, values) in &self.thresholds.field_strength {
            if values.values().iter().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(PacsError::Config(format!("场强分档 {} 含非法阈值", band)));
            }
        }

        for (index, rule) in self.classification.rule_a.iter().enumerate() {
            if rule.label.trim().is_empty() {
                return Err(PacsError::Config(format!("ruleA[{}] 缺少 label", index)));
            }
            if rule.protocol_keywords.is_empty()
                && rule.series_description_keywords.is_empty()
                && rule.refined_image_type.is_none()
            {
                return Err(PacsError::Config(format!(
                    "ruleA[{}] ({}) 没有任何匹配条件",
                    index, rule.label
                )));
            }
        }

        for (index, rule) in self.classification.sequence_family.iter().enumerate() {
            if rule.family.trim().is_empty() {
                return Err(PacsError::Config(format!("sequence_family[{}] 缺少 family", index)));
            }
            if !rule.has_condition() {
                return Err(PacsError::Config(format!(
                    "sequence_family[{}] ({}) 没有任何判定条件",
                    index, rule.family
                )));
            }
        }

        let ratio = self.orientation.oblique_dominance_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(PacsError::Config(format!(
                "orientation.oblique_dominance_ratio 必须在 (0, 1] 之间: {}",
                ratio
            )));
        }

        if self.dynamic.fingerprint_fields.is_empty() {
            return Err(PacsError::Config("dynamic.fingerprint_fields 不能为空".to_string()));
        }

        // 正则在校验阶段即编译一次
        CompiledPatterns::compile(self)?;
        Ok(())
    }
}

/// 编译后的正则
#[derive(Debug, Clone)]
pub(crate) struct CompiledPatterns {
    pub motion_correction: Regex,
    pub agent_exclude: Regex,
    pub manufacturers: Vec<(Regex, String)>,
}

impl CompiledPatterns {
    pub(crate) fn compile(config: &RuleConfig) -> Result<Self> {
        let build = |field: &str, pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| PacsError::Config(format!("{} 正则无效: {}", field, e)))
        };

        let manufacturers = config
            .atomic_features
            .manufacturers
            .iter()
            .map(|m| build("atomic_features.manufacturers", &m.pattern).map(|re| (re, m.label.clone())))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            motion_correction: build(
                "atomic_features.motion_correction_protocol_regex",
                &config.atomic_features.motion_correction_protocol_regex,
            )?,
            agent_exclude: build(
                "dynamic.contrast.agent_exclude_regex",
                &config.dynamic.contrast.agent_exclude_regex,
            )?,
            manufacturers,
        })
    }
}
