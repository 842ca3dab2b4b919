//! 序列分类
//!
//! 层级规则: 名称覆盖(ruleA) -> 物理参数 (弥散/fMRI/反转恢复/家族+加权) -> 名称兜底。
//! 各层内部按声明顺序求值，首个命中即返回。

use crate::config::{BandThresholds, FamilyRule, RuleConfig, DEFAULT_BAND};
use crate::features::SeriesFeatures;
use crate::UNCLASSIFIED;
use pacs_core::SeriesRecord;

/// 分类所需的采集参数
struct Acquisition {
    scanning_sequence: String,
    sequence_variant: String,
    tr: Option<f64>,
    te: Option<f64>,
    ti: Option<f64>,
    b_value: Option<f64>,
    echo_train_length: Option<f64>,
}

impl Acquisition {
    fn from_record(record: &SeriesRecord) -> Self {
        let lower = |name: &str| record.text(name).unwrap_or_default().to_lowercase();
        Self {
            scanning_sequence: lower("ScanningSequence"),
            sequence_variant: lower("SequenceVariant"),
            tr: record.number("RepetitionTime"),
            te: record.number("EchoTime"),
            ti: record.number("InversionTime"),
            b_value: record.number("DiffusionBValue").or_else(|| record.number("b_value")),
            echo_train_length: record.number("EchoTrainLength"),
        }
    }
}

fn above(value: Option<f64>, limit: f64) -> bool {
    value.map(|v| v > limit).unwrap_or(false)
}

fn below(value: Option<f64>, limit: f64) -> bool {
    value.map(|v| v < limit).unwrap_or(false)
}

fn contains_any(text: &str, keywords: &[String]) -> bool {
    keywords.iter().any(|k| text.contains(&k.to_lowercase()))
}

/// 对单个序列求分类标签
pub(crate) fn classify_sequence(record: &SeriesRecord, features: &SeriesFeatures, config: &RuleConfig) -> String {
    let acquisition = Acquisition::from_record(record);
    let band = band_thresholds(config, &features.field_strength);

    let mut family = None;
    let base = name_override(features, config)
        .or_else(|| physics_class(features, &acquisition, &band, config, &mut family))
        .or_else(|| name_fallback(features, family.map(|f: &FamilyRule| f.family.as_str()), config));

    match base {
        Some(base) => {
            let mut label = base;
            label.push_str(&subtype_suffix(record, features, config));
            let mc = &config.classification.motion_correction;
            if features.has_motion_correction || contains_any(&features.protocol_name, &mc.protocol_keywords) {
                label.push_str(&mc.suffix);
            }
            label
        }
        None => UNCLASSIFIED.to_string(),
    }
}

fn band_thresholds(config: &RuleConfig, band: &str) -> BandThresholds {
    let bands = &config.thresholds.field_strength;
    match bands.get(band).or_else(|| bands.get(DEFAULT_BAND)) {
        Some(values) => *values,
        // 加载时已保证 default 存在；未加载校验的配置退化为不可判定
        None => BandThresholds {
            t1_tr_max: f64::NAN,
            t1_te_max: f64::NAN,
            t2_tr_min: f64::NAN,
            t2_te_min: f64::NAN,
            pd_te_max: f64::NAN,
            flair_ti_min: f64::NAN,
            stir_ti_max: f64::NAN,
        },
    }
}

/// ruleA: 名称优先覆盖
fn name_override(features: &SeriesFeatures, config: &RuleConfig) -> Option<String> {
    config
        .classification
        .rule_a
        .iter()
        .find(|rule| {
            rule.refined_image_type
                .as_deref()
                .map(|t| t.eq_ignore_ascii_case(features.refined_image_type.as_str()))
                .unwrap_or(false)
                || contains_any(&features.protocol_name, &rule.protocol_keywords)
                || contains_any(&features.series_description, &rule.series_description_keywords)
        })
        .map(|rule| rule.label.clone())
}

/// 物理参数规则，命中家族规则时写回 `family`
fn physics_class<'a>(
    features: &SeriesFeatures,
    acq: &Acquisition,
    band: &BandThresholds,
    config: &'a RuleConfig,
    family: &mut Option<&'a FamilyRule>,
) -> Option<String> {
    let rules = &config.classification;
    let name = features.protocol_name.as_str();

    // 功能成像
    if above(acq.b_value, rules.dwi_b_value_min) {
        let label = if name.contains(&rules.dti_keyword.to_lowercase()) { "DTI" } else { "DWI" };
        return Some(label.to_string());
    }
    if acq.scanning_sequence.contains(&rules.fmri.scan_seq_token.to_lowercase())
        && contains_any(name, &rules.fmri.protocol_keywords)
    {
        return Some(rules.fmri.class.clone());
    }

    // 反转恢复
    if let Some(ti) = acq.ti {
        if ti >= band.flair_ti_min {
            return Some("T2_FLAIR".to_string());
        }
        if ti >= rules.stir_ti_min && ti <= band.stir_ti_max {
            return Some("T2_STIR".to_string());
        }
    }

    // 家族 + 加权
    let matched = rules
        .sequence_family
        .iter()
        .find(|rule| family_matches(rule, features, acq))?;
    *family = Some(matched);

    if let Some(contrast) = &matched.contrast {
        return Some(contrast.clone());
    }
    let family_name = &matched.family;
    if above(acq.te, band.t2_te_min) {
        Some(format!("T2_{}", family_name))
    } else if below(acq.tr, band.t1_tr_max) && below(acq.te, band.t1_te_max) {
        Some(format!("T1_{}", family_name))
    } else if above(acq.tr, band.t2_tr_min) && below(acq.te, band.pd_te_max) && name.contains("pd") {
        Some(format!("PD_{}", family_name))
    } else {
        None
    }
}

fn family_matches(rule: &FamilyRule, features: &SeriesFeatures, acq: &Acquisition) -> bool {
    let token_in = |token: &Option<String>, text: &str| {
        token.as_ref().map(|t| text.contains(&t.to_lowercase())).unwrap_or(true)
    };
    token_in(&rule.scanning_sequence, &acq.scanning_sequence)
        && token_in(&rule.sequence_variant, &acq.sequence_variant)
        && (rule.protocol_keywords.is_empty() || contains_any(&features.protocol_name, &rule.protocol_keywords))
        && rule
            .echo_train_length_above
            .map(|min| above(acq.echo_train_length, min))
            .unwrap_or(true)
}

/// 名称兜底
fn name_fallback(features: &SeriesFeatures, family: Option<&str>, config: &RuleConfig) -> Option<String> {
    let fallback = &config.classification.fallback;
    let name = features.protocol_name.as_str();
    let by_name = |prefix: &str| {
        if contains_any(name, &fallback.tse_tokens) {
            format!("{}_TSE", prefix)
        } else if name.contains(&fallback.se_token.to_lowercase()) {
            format!("{}_SE", prefix)
        } else {
            format!("{}_NAME_BASED", prefix)
        }
    };

    let mut base = None;
    if name.contains("t2") {
        base = Some(match family {
            Some(f) => format!("T2_{}", f),
            None => by_name("T2"),
        });
    }

    if name.contains(&fallback.tse_dark_fluid_to_flair.to_lowercase()) {
        base = Some("T2_FLAIR".to_string());
    } else if name.contains("t1") {
        base = Some(match family {
            Some(f) => format!("T1_{}", f),
            None => {
                let is_flash3d = !fallback.mpr_iso_tokens.is_empty()
                    && fallback.mpr_iso_tokens.iter().all(|t| name.contains(&t.to_lowercase()))
                    && features.dimension == fallback.requires_dimension_for_flash3d;
                if is_flash3d && !contains_any(name, &fallback.tse_tokens) && !name.contains(&fallback.se_token.to_lowercase()) {
                    "T1_GRE_FLASH3D".to_string()
                } else {
                    by_name("T1")
                }
            }
        });
    } else if name.contains("pd") {
        base = Some(format!("PD_{}", family.unwrap_or("UNKNOWN")));
    } else if name.contains("flair") {
        base = Some("T2_FLAIR".to_string());
    } else if name.contains("stir") {
        base = Some("T2_STIR".to_string());
    } else if name.contains("dwi") || name.contains("diff") {
        base = Some("DWI".to_string());
    }

    base
}

/// Dixon 亚型与多回波后缀
fn subtype_suffix(record: &SeriesRecord, features: &SeriesFeatures, config: &RuleConfig) -> String {
    let rules = &config.subtype_suffix;
    let raw_description = record
        .series_description
        .clone()
        .or_else(|| record.text("SeriesDescription"))
        .unwrap_or_default();
    let text = format!("{} {}", features.protocol_name, raw_description).to_lowercase();
    let has_part = |part: &str| features.image_type.iter().any(|p| p == part);

    if has_part("WATER") || contains_any(&text, &rules.water_tokens) {
        return "_WATER".to_string();
    }
    if has_part("FAT") || contains_any(&text, &rules.fat_tokens) {
        return "_FAT".to_string();
    }
    if has_part("INPHASE") || contains_any(&text, &rules.inphase_tokens) {
        return "_INPHASE".to_string();
    }
    if has_part("OUTPHASE") || contains_any(&text, &rules.outphase_tokens) {
        return "_OUTPHASE".to_string();
    }

    if !rules.t2_star_echo_marker.is_empty() && text.contains(&rules.t2_star_echo_marker.to_lowercase()) {
        let split = rules.t2_star_echo_split_token.to_lowercase();
        let tail = if split.is_empty() { text.as_str() } else { text.rsplit(split.as_str()).next().unwrap_or("") };
        let digits: String = tail.chars().filter(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            return format!("_ECHO{}", digits);
        }
    }

    String::new()
}
