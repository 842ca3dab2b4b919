//! 核心数据模型定义

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 任务日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Success => "success",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        };
        f.write_str(s)
    }
}

/// 模板字段的提取值
///
/// 缺失或为空的标签统一为 `Null`，不会产生错误。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(untagged)]
pub enum TagValue {
    #[default]
    Null,
    Number(f64),
    Numbers(Vec<f64>),
    Date(NaiveDate),
    Text(String),
    Texts(Vec<String>),
}

impl TagValue {
    pub fn is_null(&self) -> bool {
        matches!(self, TagValue::Null)
    }

    /// 取单个数值，文本值会尝试解析
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Number(v) => Some(*v),
            TagValue::Numbers(v) => v.first().copied(),
            TagValue::Text(s) => s.trim().parse().ok(),
            TagValue::Texts(v) => v.first().and_then(|s| s.trim().parse().ok()),
            _ => None,
        }
    }

    /// 取数值列表（如 ImageOrientationPatient）
    pub fn as_f64_list(&self) -> Option<Vec<f64>> {
        match self {
            TagValue::Number(v) => Some(vec![*v]),
            TagValue::Numbers(v) => Some(v.clone()),
            TagValue::Text(s) => s
                .split('\\')
                .map(|p| p.trim().parse().ok())
                .collect::<Option<Vec<f64>>>(),
            TagValue::Texts(v) => v
                .iter()
                .map(|p| p.trim().parse().ok())
                .collect::<Option<Vec<f64>>>(),
            _ => None,
        }
    }

    /// 转为文本，多值以反斜杠连接（与DICOM多值编码一致）
    pub fn as_text(&self) -> Option<String> {
        match self {
            TagValue::Null => None,
            TagValue::Number(v) => Some(format_number(*v)),
            TagValue::Numbers(v) => Some(
                v.iter()
                    .map(|x| format_number(*x))
                    .collect::<Vec<_>>()
                    .join("\\"),
            ),
            TagValue::Date(d) => Some(d.format("%Y%m%d").to_string()),
            TagValue::Text(s) => Some(s.clone()),
            TagValue::Texts(v) => Some(v.join("\\")),
        }
    }
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// C-FIND 返回的序列标识
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesIdentity {
    pub study_uid: String,
    pub series_uid: String,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    pub modality: Option<String>,
    /// PACS 声明的实例数量 (NumberOfSeriesRelatedInstances)
    pub instance_count: Option<u32>,
}

/// 单个序列的元数据记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesRecord {
    pub study_uid: String,
    pub series_uid: String,
    pub modality: String,
    pub series_number: Option<i32>,
    pub series_description: Option<String>,
    /// 目录中的实例文件数
    pub instance_count: usize,
    /// 模板字段名 -> 提取值
    pub tags: BTreeMap<String, TagValue>,
    /// 原始 ImageType 多值
    pub image_type_raw: Option<Vec<String>>,
}

impl SeriesRecord {
    pub fn new(study_uid: impl Into<String>, series_uid: impl Into<String>, modality: impl Into<String>) -> Self {
        Self {
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            modality: modality.into(),
            series_number: None,
            series_description: None,
            instance_count: 0,
            tags: BTreeMap::new(),
            image_type_raw: None,
        }
    }

    pub fn is_mr(&self) -> bool {
        self.modality.to_uppercase().contains("MR")
    }

    /// 获取非空标签值
    pub fn tag(&self, name: &str) -> Option<&TagValue> {
        self.tags.get(name).filter(|v| !v.is_null())
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.tag(name)
            .and_then(TagValue::as_text)
            .filter(|s| !s.trim().is_empty())
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.tag(name).and_then(TagValue::as_f64).filter(|v| v.is_finite())
    }

    pub fn numbers(&self, name: &str) -> Option<Vec<f64>> {
        self.tag(name).and_then(TagValue::as_f64_list)
    }

    pub fn with_tag(mut self, name: &str, value: TagValue) -> Self {
        self.tags.insert(name.to_string(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_value_serde_shape() {
        let mut record = SeriesRecord::new("1.2.3", "1.2.3.4", "MR")
            .with_tag("EchoTime", TagValue::Number(90.0))
            .with_tag("StudyDate", TagValue::Date(NaiveDate::from_ymd_opt(2025, 5, 30).unwrap()))
            .with_tag("ContrastBolusAgent", TagValue::Null);
        record.image_type_raw = Some(vec!["ORIGINAL".into(), "PRIMARY".into()]);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tags"]["EchoTime"], 90.0);
        assert_eq!(json["tags"]["StudyDate"], "2025-05-30");
        assert!(json["tags"]["ContrastBolusAgent"].is_null());
    }

    #[test]
    fn test_missing_and_null_tags() {
        let record = SeriesRecord::new("1", "2", "MR").with_tag("RepetitionTime", TagValue::Null);
        assert!(record.tag("RepetitionTime").is_none());
        assert!(record.number("EchoTime").is_none());
    }

    #[test]
    fn test_numeric_views() {
        let record = SeriesRecord::new("1", "2", "MR")
            .with_tag("ImageOrientationPatient", TagValue::Text("1\\0\\0\\0\\1\\0".into()))
            .with_tag("FlipAngle", TagValue::Text(" 15 ".into()));
        assert_eq!(
            record.numbers("ImageOrientationPatient"),
            Some(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
        );
        assert_eq!(record.number("FlipAngle"), Some(15.0));
        assert_eq!(TagValue::Numbers(vec![1.0, 2.5]).as_text().as_deref(), Some("1\\2.5"));
    }
}
