//! 原子特征提取
//!
//! 从单个序列的标签派生方位、维度、脂肪抑制、图像类型、场强分档等标准化特征。

use crate::config::{CompiledPatterns, FatSuppressionRules, OrientationRules, RuleConfig};
use pacs_core::SeriesRecord;
use serde::{Deserialize, Serialize};

/// 精细图像类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefinedImageType {
    Derived,
    Localizer,
    Original,
    Other,
}

impl RefinedImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefinedImageType::Derived => "DERIVED",
            RefinedImageType::Localizer => "LOCALIZER",
            RefinedImageType::Original => "ORIGINAL",
            RefinedImageType::Other => "OTHER",
        }
    }
}

/// 单个序列的原子特征
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFeatures {
    pub protocol_name: String,      // 小写协议名
    pub series_description: String, // 小写序列描述
    pub image_type: Vec<String>,    // 大写 ImageType 各分量
    pub orientation: String,
    pub dimension: String,
    pub is_fat_suppressed: bool,
    pub has_motion_correction: bool,
    pub refined_image_type: RefinedImageType,
    pub field_strength: String,
    pub manufacturer: String,
}

pub(crate) fn extract_features(
    record: &SeriesRecord,
    config: &RuleConfig,
    patterns: &CompiledPatterns,
) -> SeriesFeatures {
    let series_description = record
        .series_description
        .clone()
        .or_else(|| record.text("SeriesDescription"))
        .unwrap_or_default()
        .to_lowercase();
    // 缺少 ProtocolName 时以序列描述代替
    let protocol_name = record
        .text("ProtocolName")
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| series_description.clone());

    let image_type = image_type_parts(record);

    let orientation = record
        .numbers("ImageOrientationPatient")
        .and_then(|iop| orientation_from_iop(&iop, config.orientation.oblique_dominance_ratio))
        .map(str::to_string)
        .unwrap_or_else(|| orientation_from_keywords(&protocol_name, &config.orientation));

    let dimension = record
        .text("MRAcquisitionType")
        .map(|s| s.trim().to_uppercase())
        .unwrap_or_else(|| "UNKNOWN".to_string());

    let refined_image_type = refine_image_type(
        &image_type,
        &protocol_name,
        &config.atomic_features.localizer_protocol_keywords,
    );

    let manufacturer = record
        .text("Manufacturer")
        .and_then(|m| {
            patterns
                .manufacturers
                .iter()
                .find(|(re, _)| re.is_match(&m))
                .map(|(_, label)| label.clone())
        })
        .unwrap_or_else(|| "Other".to_string());

    SeriesFeatures {
        is_fat_suppressed: detect_fat_suppression(record, &image_type, &protocol_name, &config.fat_suppression),
        has_motion_correction: patterns.motion_correction.is_match(&protocol_name),
        field_strength: field_strength_band(record.number("MagneticFieldStrength")).to_string(),
        protocol_name,
        series_description,
        image_type,
        orientation,
        dimension,
        refined_image_type,
        manufacturer,
    }
}

/// ImageType 分量，优先使用原始多值
fn image_type_parts(record: &SeriesRecord) -> Vec<String> {
    match &record.image_type_raw {
        Some(parts) => parts.iter().map(|p| p.trim().to_uppercase()).collect(),
        None => record
            .text("ImageType")
            .map(|s| s.split('\\').map(|p| p.trim().to_uppercase()).collect())
            .unwrap_or_default(),
    }
}

/// 由 ImageOrientationPatient 计算法向量判断方位
///
/// 主轴分量平方小于 `ratio * |n|^2` 时为斜位。
pub fn orientation_from_iop(iop: &[f64], oblique_ratio: f64) -> Option<&'static str> {
    if iop.len() != 6 || iop.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let normal = [
        iop[1] * iop[5] - iop[2] * iop[4],
        iop[2] * iop[3] - iop[0] * iop[5],
        iop[0] * iop[4] - iop[1] * iop[3],
    ];
    let norm_sq: f64 = normal.iter().map(|v| v * v).sum();
    if norm_sq == 0.0 {
        return None;
    }

    let mut main_axis = 0;
    for axis in 1..3 {
        if normal[axis].abs() > normal[main_axis].abs() {
            main_axis = axis;
        }
    }
    if normal[main_axis].powi(2) < oblique_ratio * norm_sq {
        return Some("OBL");
    }

    Some(match main_axis {
        0 => "SAG",
        1 => "COR",
        _ => "AX",
    })
}

fn orientation_from_keywords(protocol_name: &str, rules: &OrientationRules) -> String {
    rules
        .fallback_keywords
        .iter()
        .find(|entry| entry.keywords.iter().any(|k| protocol_name.contains(&k.to_lowercase())))
        .map(|entry| entry.label.clone())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

fn refine_image_type(image_type: &[String], protocol_name: &str, localizer_keywords: &[String]) -> RefinedImageType {
    let joined = image_type.join("\\").to_lowercase();
    if joined.contains("derived") || joined.contains("secondary") {
        return RefinedImageType::Derived;
    }
    if joined.contains("localizer")
        || localizer_keywords.iter().any(|k| protocol_name.contains(&k.to_lowercase()))
    {
        return RefinedImageType::Localizer;
    }
    if joined.contains("original") && joined.contains("primary") {
        return RefinedImageType::Original;
    }
    RefinedImageType::Other
}

/// 脂肪抑制检测
fn detect_fat_suppression(
    record: &SeriesRecord,
    image_type: &[String],
    protocol_name: &str,
    rules: &FatSuppressionRules,
) -> bool {
    let scanning_sequence = record.text("ScanningSequence").unwrap_or_default();
    if scanning_sequence.contains(&rules.ir_token) {
        if let Some(ti) = record.number("InversionTime") {
            if ti >= rules.stir_ti_min && ti <= rules.stir_ti_max {
                return true;
            }
        }
    }

    if rules
        .dixon_water_tokens
        .iter()
        .any(|t| image_type.iter().any(|p| p == &t.to_uppercase()))
    {
        return true;
    }

    let fs_token = rules.scan_options_fs_token.to_uppercase();
    if !fs_token.is_empty()
        && record
            .text("ScanOptions")
            .map(|s| s.to_uppercase().contains(&fs_token))
            .unwrap_or(false)
    {
        return true;
    }

    rules
        .protocol_keywords
        .iter()
        .any(|k| protocol_name.contains(&k.to_lowercase()))
}

/// 场强分档，左闭右开: <1.0, <2.0, <4.0
pub fn field_strength_band(tesla: Option<f64>) -> &'static str {
    match tesla {
        None => "UNKNOWN",
        Some(v) if v < 1.0 => "Low-Field",
        Some(v) if v < 2.0 => "1.5T",
        Some(v) if v < 4.0 => "3.0T",
        Some(_) => "High-Field",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_core::TagValue;

    fn record() -> SeriesRecord {
        let mut r = SeriesRecord::new("1.2.3", "1.2.3.1", "MR");
        r.image_type_raw = Some(vec!["ORIGINAL".into(), "PRIMARY".into(), "M".into()]);
        r
    }

    fn features(r: &SeriesRecord) -> SeriesFeatures {
        let config = RuleConfig::default();
        let patterns = CompiledPatterns::compile(&config).unwrap();
        extract_features(r, &config, &patterns)
    }

    #[test]
    fn test_orientation_from_iop() {
        assert_eq!(orientation_from_iop(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], 0.9), Some("AX"));
        assert_eq!(orientation_from_iop(&[0.0, 1.0, 0.0, 0.0, 0.0, -1.0], 0.9), Some("SAG"));
        assert_eq!(orientation_from_iop(&[1.0, 0.0, 0.0, 0.0, 0.0, -1.0], 0.9), Some("COR"));
        // 法向量在 y/z 间约45度
        let c = std::f64::consts::FRAC_1_SQRT_2;
        assert_eq!(orientation_from_iop(&[1.0, 0.0, 0.0, 0.0, c, c], 0.9), Some("OBL"));
        assert_eq!(orientation_from_iop(&[1.0, 0.0, 0.0], 0.9), None);
    }

    #[test]
    fn test_orientation_ignores_sign_convention() {
        assert_eq!(orientation_from_iop(&[-1.0, 0.0, 0.0, 0.0, -1.0, 0.0], 0.9), Some("AX"));
    }

    #[test]
    fn test_orientation_keyword_fallback() {
        let r = record().with_tag("ProtocolName", TagValue::Text("t2_tse_sag".into()));
        assert_eq!(features(&r).orientation, "SAG");

        let r = record().with_tag("ProtocolName", TagValue::Text("t2_tse".into()));
        assert_eq!(features(&r).orientation, "UNKNOWN");
    }

    #[test]
    fn test_fat_suppression_priority() {
        let stir = record()
            .with_tag("ScanningSequence", TagValue::Text("SE\\IR".into()))
            .with_tag("InversionTime", TagValue::Number(160.0));
        assert!(features(&stir).is_fat_suppressed);

        let mut dixon = record();
        dixon.image_type_raw = Some(vec!["DERIVED".into(), "PRIMARY".into(), "DIXON".into(), "W".into()]);
        assert!(features(&dixon).is_fat_suppressed);

        let options = record().with_tag("ScanOptions", TagValue::Text("PFP\\FS".into()));
        assert!(features(&options).is_fat_suppressed);

        let plain = record().with_tag("ProtocolName", TagValue::Text("t1_se_tra".into()));
        assert!(!features(&plain).is_fat_suppressed);
    }

    #[test]
    fn test_refined_image_type() {
        let mut r = record();
        assert_eq!(features(&r).refined_image_type, RefinedImageType::Original);

        r.image_type_raw = Some(vec!["DERIVED".into(), "SECONDARY".into()]);
        assert_eq!(features(&r).refined_image_type, RefinedImageType::Derived);

        let scout = record().with_tag("ProtocolName", TagValue::Text("AAHead_Scout".into()));
        assert_eq!(features(&scout).refined_image_type, RefinedImageType::Localizer);
    }

    #[test]
    fn test_field_strength_band_edges() {
        assert_eq!(field_strength_band(Some(0.5)), "Low-Field");
        assert_eq!(field_strength_band(Some(1.0)), "1.5T");
        assert_eq!(field_strength_band(Some(1.4999)), "1.5T");
        assert_eq!(field_strength_band(Some(3.0)), "3.0T");
        assert_eq!(field_strength_band(Some(7.0)), "High-Field");
        assert_eq!(field_strength_band(None), "UNKNOWN");
    }

    #[test]
    fn test_manufacturer_standardization() {
        let r = record().with_tag("Manufacturer", TagValue::Text("GE MEDICAL SYSTEMS".into()));
        assert_eq!(features(&r).manufacturer, "GE");
        let r = record().with_tag("Manufacturer", TagValue::Text("Acme".into()));
        assert_eq!(features(&r).manufacturer, "Other");
    }
}
