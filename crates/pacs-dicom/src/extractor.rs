//! 元数据提取
//!
//! 按模态选择标签模板，从序列目录中的样本文件读取字段，生成 `SeriesRecord`。
//! 只读取已落盘的文件，不做任何写入。

use crate::dimse::element_str;
use dicom_core::dictionary::DataDictionary;
use dicom_core::{Tag, VR};
use dicom_dictionary_std::{tags, StandardDataDictionary};
use dicom_object::mem::InMemElement;
use dicom_object::{InMemDicomObject, OpenFileOptions};
use pacs_core::utils::parse_dicom_date;
use pacs_core::{PacsError, Result, SeriesRecord, TagValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// MR 分类必需的字段
pub const IMAGE_TYPE: &str = "ImageType";

/// 单个模态的标签模板
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagTemplate {
    pub modality: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// 模板文件既可以是完整对象，也可以只是字段名数组
#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateFile {
    Fields(Vec<String>),
    Full(TagTemplate),
}

const DEFAULT_FIELDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "BodyPartExamined",
    "Manufacturer",
    "ManufacturerModelName",
];

const MR_FIELDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "ProtocolName",
    "SequenceName",
    "BodyPartExamined",
    "Manufacturer",
    "ManufacturerModelName",
    "MagneticFieldStrength",
    "ImageType",
    "ScanningSequence",
    "SequenceVariant",
    "ScanOptions",
    "MRAcquisitionType",
    "RepetitionTime",
    "EchoTime",
    "InversionTime",
    "EchoTrainLength",
    "EchoNumbers",
    "FlipAngle",
    "SliceThickness",
    "SpacingBetweenSlices",
    "PixelSpacing",
    "Rows",
    "Columns",
    "ImageOrientationPatient",
    "ImagePositionPatient",
    "SeriesTime",
    "AcquisitionTime",
    "ContrastBolusAgent",
    "DiffusionBValue",
];

const CT_FIELDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "BodyPartExamined",
    "Manufacturer",
    "ManufacturerModelName",
    "KVP",
    "XRayTubeCurrent",
    "ConvolutionKernel",
    "SliceThickness",
    "PixelSpacing",
    "ContrastBolusAgent",
];

const DX_FIELDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "BodyPartExamined",
    "ViewPosition",
    "Manufacturer",
    "ImagerPixelSpacing",
    "PhotometricInterpretation",
];

const MG_FIELDS: &[&str] = &[
    "Modality",
    "StudyDate",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "PatientID",
    "AccessionNumber",
    "SeriesNumber",
    "SeriesDescription",
    "Laterality",
    "ImageLaterality",
    "ViewPosition",
    "Manufacturer",
    "ImagerPixelSpacing",
];

impl TagTemplate {
    fn from_fields(modality: &str, fields: &[&str]) -> Self {
        Self {
            modality: modality.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            required: Vec::new(),
        }
        .normalized()
    }

    fn is_mr(&self) -> bool {
        self.modality.to_uppercase().contains("MR")
    }

    /// MR 模板总是把 ImageType 视为必需字段
    fn normalized(mut self) -> Self {
        self.modality = self.modality.trim().to_uppercase();
        if self.is_mr() && !self.required.iter().any(|r| r == IMAGE_TYPE) {
            self.required.push(IMAGE_TYPE.to_string());
        }
        self
    }

    /// 所有字段名都必须能解析成标签，MR 模板必须列出 ImageType
    pub fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(PacsError::Config(format!("模板 {} 没有字段", self.modality)));
        }
        for field in self.fields.iter().chain(self.required.iter()) {
            resolve_tag(field)?;
        }
        if self.is_mr() && !self.fields.iter().any(|f| f == IMAGE_TYPE) {
            return Err(PacsError::Config(format!(
                "模板 {} 必须包含 {} 字段",
                self.modality, IMAGE_TYPE
            )));
        }
        Ok(())
    }
}

/// 全部模态的模板
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, TagTemplate>,
    default: TagTemplate,
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateSet {
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        for (modality, fields) in [("MR", MR_FIELDS), ("CT", CT_FIELDS), ("DX", DX_FIELDS), ("MG", MG_FIELDS)] {
            templates.insert(modality.to_string(), TagTemplate::from_fields(modality, fields));
        }
        Self {
            templates,
            default: TagTemplate::from_fields("DEFAULT", DEFAULT_FIELDS),
        }
    }

    /// 从目录加载 `<modality>.json`，覆盖内置模板
    ///
    /// 目录不存在时使用内置模板；任何文件格式错误都直接失败。
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut set = Self::builtin();
        if !dir.is_dir() {
            warn!("模板目录 {:?} 不存在，使用内置模板", dir);
            return Ok(set);
        }

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().map(|x| x == "json").unwrap_or(false))
            .collect();
        paths.sort();

        for path in paths {
            let modality = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_uppercase())
                .unwrap_or_default();
            let content = std::fs::read_to_string(&path)?;
            let template = match serde_json::from_str::<TemplateFile>(&content)
                .map_err(|e| PacsError::Config(format!("模板 {:?} 解析失败: {}", path, e)))?
            {
                TemplateFile::Full(t) => t,
                TemplateFile::Fields(fields) => TagTemplate {
                    modality: modality.clone(),
                    fields,
                    required: Vec::new(),
                },
            }
            .normalized();
            template.validate()?;
            info!("加载 {} 模板 ({} 个字段)", modality, template.fields.len());
            if modality == "DEFAULT" {
                set.default = template;
            } else {
                set.templates.insert(modality, template);
            }
        }
        Ok(set)
    }

    /// 按模态选择模板: DR/DX/CR 共用 DX，含 MR 的都用 MR
    pub fn for_modality(&self, modality: &str) -> &TagTemplate {
        let modality = modality.trim().to_uppercase();
        let key = if matches!(modality.as_str(), "DR" | "DX" | "CR") {
            "DX".to_string()
        } else if modality.contains("MR") {
            "MR".to_string()
        } else {
            modality
        };
        self.templates.get(&key).unwrap_or(&self.default)
    }
}

/// 解析字段名为标签，支持 `(gggg,eeee)`、`gggg,eeee` 和标准字典关键字
pub fn resolve_tag(name: &str) -> Result<Tag> {
    let trimmed = name.trim();
    let hex = trimmed.trim_start_matches('(').trim_end_matches(')');
    if let Some((group, element)) = hex.split_once(',') {
        if let (Ok(g), Ok(e)) = (
            u16::from_str_radix(group.trim(), 16),
            u16::from_str_radix(element.trim(), 16),
        ) {
            return Ok(Tag(g, e));
        }
    }
    StandardDataDictionary
        .parse_tag(trimmed)
        .ok_or_else(|| PacsError::Config(format!("未知的DICOM标签: {}", name)))
}

fn is_numeric_vr(vr: VR) -> bool {
    matches!(
        vr,
        VR::DS | VR::IS | VR::FL | VR::FD | VR::SL | VR::SS | VR::UL | VR::US | VR::SV | VR::UV
    )
}

/// 元素值到 `TagValue` 的映射，缺失或为空时为 `Null`
pub fn tag_value(element: Option<&InMemElement>) -> TagValue {
    let Some(element) = element else {
        return TagValue::Null;
    };
    let vr = element.vr();
    if vr == VR::SQ {
        return TagValue::Null;
    }

    if is_numeric_vr(vr) {
        if let Ok(values) = element.to_multi_float64() {
            return match values.len() {
                0 => TagValue::Null,
                1 => TagValue::Number(values[0]),
                _ => TagValue::Numbers(values),
            };
        }
    }

    let texts: Vec<String> = match element.to_multi_str() {
        Ok(values) => values
            .iter()
            .map(|s| pacs_core::utils::trim_dicom_str(s).to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => return TagValue::Null,
    };

    if vr == VR::DA && texts.len() == 1 {
        if let Some(date) = parse_dicom_date(&texts[0]) {
            return TagValue::Date(date);
        }
    }

    match texts.len() {
        0 => TagValue::Null,
        1 => TagValue::Text(texts.into_iter().next().unwrap_or_default()),
        _ => TagValue::Texts(texts),
    }
}

fn open_header(path: &Path) -> Option<InMemDicomObject> {
    OpenFileOptions::new()
        .read_until(tags::PIXEL_DATA)
        .open_file(path)
        .ok()
        .map(|file| file.into_inner())
}

/// 目录中的文件，按文件名排序
pub(crate) fn series_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && !p.extension().map(|x| x == "part").unwrap_or(false))
        .collect();
    files.sort();
    Ok(files)
}

/// 同步提取一个序列
///
/// 样本取第一个可读文件，实例数为目录中全部可读文件数。
pub fn extract_series_blocking(dir: &Path, templates: &TemplateSet) -> Result<SeriesRecord> {
    let label = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let extraction_error = |message: String| PacsError::Extraction {
        series: label.clone(),
        message,
    };

    let mut sample: Option<InMemDicomObject> = None;
    let mut readable = 0usize;
    for path in series_files(dir)? {
        match open_header(&path) {
            Some(obj) => {
                readable += 1;
                if sample.is_none() {
                    sample = Some(obj);
                }
            }
            None => debug!("跳过不可读文件 {:?}", path),
        }
    }
    let sample = sample.ok_or_else(|| extraction_error("目录中没有可读的DICOM文件".to_string()))?;

    let modality = element_str(&sample, tags::MODALITY).unwrap_or_else(|| "UNKNOWN".to_string());
    let template = templates.for_modality(&modality);
    let mut record = SeriesRecord::new(
        element_str(&sample, tags::STUDY_INSTANCE_UID).unwrap_or_default(),
        element_str(&sample, tags::SERIES_INSTANCE_UID).unwrap_or_default(),
        modality.clone(),
    );
    record.series_number = element_str(&sample, tags::SERIES_NUMBER).and_then(|s| s.parse().ok());
    record.series_description = element_str(&sample, tags::SERIES_DESCRIPTION);
    record.instance_count = readable;

    for field in &template.fields {
        let tag = resolve_tag(field)?;
        record.tags.insert(field.clone(), tag_value(sample.get(tag)));
    }

    let image_type = match tag_value(sample.get(tags::IMAGE_TYPE)) {
        TagValue::Texts(parts) => Some(parts),
        TagValue::Text(part) => Some(vec![part]),
        _ => None,
    };
    record.image_type_raw = image_type;

    for required in &template.required {
        let value = match record.tags.get(required) {
            Some(value) => value.clone(),
            None => tag_value(sample.get(resolve_tag(required)?)),
        };
        if value.is_null() {
            return Err(extraction_error(format!("缺少必需字段 {}", required)));
        }
    }
    if record.is_mr() && record.image_type_raw.is_none() {
        return Err(extraction_error(format!("MR 序列缺少 {}", IMAGE_TYPE)));
    }

    Ok(record)
}

/// 在阻塞线程池中提取一个序列
pub async fn extract_series(dir: PathBuf, templates: std::sync::Arc<TemplateSet>) -> Result<SeriesRecord> {
    tokio::task::spawn_blocking(move || extract_series_blocking(&dir, &templates))
        .await
        .map_err(|e| PacsError::Internal(format!("提取任务异常: {}", e)))?
}
