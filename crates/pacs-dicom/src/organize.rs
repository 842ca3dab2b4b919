//! 本地文件集导入
//!
//! 上传的 ZIP 或本地目录被整理成与 PACS 检索相同的 "每序列一个目录" 结构，
//! 后续阶段不区分数据来源。

use crate::dimse::element_str;
use crate::retrieval::{RetrievalOutcome, RetrievedSeries};
use dicom_dictionary_std::tags;
use dicom_object::OpenFileOptions;
use pacs_core::utils::series_folder_name;
use pacs_core::{PacsError, ProgressReporter, Result, SeriesIdentity};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 这些扩展名直接跳过，不尝试按DICOM解析
const SKIPPED_EXTENSIONS: &[&str] = &["json", "csv", "txt", "xlsx", "npy", "nii", "gz"];

/// 校验上传文件是格式正确且非空的 ZIP 压缩包
pub fn validate_archive(path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|e| PacsError::Validation(format!("无法打开上传文件 {:?}: {}", path, e)))?;
    let archive = zip::ZipArchive::new(file)
        .map_err(|e| PacsError::Validation(format!("上传文件不是有效的ZIP压缩包: {}", e)))?;
    if archive.len() == 0 {
        return Err(PacsError::Validation("ZIP压缩包为空".to_string()));
    }
    Ok(())
}

/// 解压到目标目录，返回写出的文件数
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<usize> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| PacsError::Validation(format!("ZIP压缩包无法读取: {}", e)))?;

    let mut extracted = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("读取ZIP条目 {} 失败: {}", i, e)))?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("跳过路径不安全的ZIP条目: {}", entry.name());
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
        extracted += 1;
    }
    debug!("从 {:?} 解压 {} 个文件", archive_path, extracted);
    Ok(extracted)
}

/// 扫描到的一个DICOM文件
#[derive(Debug, Clone)]
struct ScannedFile {
    path: PathBuf,
    study_uid: String,
    sop_instance_uid: Option<String>,
    series_number: Option<i32>,
    series_description: Option<String>,
    modality: Option<String>,
}

#[derive(Debug, Default)]
struct ScanResult {
    by_series: BTreeMap<String, Vec<ScannedFile>>,
    skipped: usize,
}

fn scan_dicom_files(root: &Path, cancel: &CancellationToken) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    for entry in WalkDir::new(root).sort_by_file_name() {
        if cancel.is_cancelled() {
            return Err(PacsError::Cancelled);
        }
        let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, format!("遍历 {:?} 失败: {}", root, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let skipped_ext = path
            .extension()
            .map(|ext| SKIPPED_EXTENSIONS.contains(&ext.to_string_lossy().to_lowercase().as_str()))
            .unwrap_or(false);
        if skipped_ext {
            result.skipped += 1;
            continue;
        }

        let obj = match OpenFileOptions::new().read_until(tags::PIXEL_DATA).open_file(path) {
            Ok(obj) => obj,
            Err(e) => {
                debug!("跳过非DICOM文件 {:?}: {}", path, e);
                result.skipped += 1;
                continue;
            }
        };
        let Some(series_uid) = element_str(&obj, tags::SERIES_INSTANCE_UID) else {
            debug!("跳过缺少 SeriesInstanceUID 的文件 {:?}", path);
            result.skipped += 1;
            continue;
        };
        result.by_series.entry(series_uid).or_default().push(ScannedFile {
            path: path.to_path_buf(),
            study_uid: element_str(&obj, tags::STUDY_INSTANCE_UID).unwrap_or_default(),
            sop_instance_uid: element_str(&obj, tags::SOP_INSTANCE_UID),
            series_number: element_str(&obj, tags::SERIES_NUMBER).and_then(|s| s.parse().ok()),
            series_description: element_str(&obj, tags::SERIES_DESCRIPTION),
            modality: element_str(&obj, tags::MODALITY),
        });
    }
    Ok(result)
}

fn unique_name(used: &mut HashSet<String>, base: String) -> String {
    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{}_{}", base, n);
        n += 1;
    }
    name
}

/// 导入本地文件集
///
/// `source` 为 ZIP 文件时先解压到 `work_dir`；为目录时直接扫描。
/// DICOM 文件按序列复制到 `destination` 下的序列目录，非DICOM文件跳过。
pub async fn import_file_set(
    source: &Path,
    work_dir: &Path,
    destination: &Path,
    reporter: &dyn ProgressReporter,
    cancel: &CancellationToken,
) -> Result<RetrievalOutcome> {
    let label = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());

    let scan_root = if source.is_dir() {
        source.to_path_buf()
    } else {
        let extract_dir = work_dir.join("_extracted");
        let (archive, target) = (source.to_path_buf(), extract_dir.clone());
        reporter.info(&format!("解压上传文件 {}", label));
        let count = tokio::task::spawn_blocking(move || extract_zip(&archive, &target))
            .await
            .map_err(|e| PacsError::Internal(format!("解压任务异常: {}", e)))??;
        reporter.info(&format!("解压完成，共 {} 个文件", count));
        extract_dir
    };

    let token = cancel.clone();
    let root = scan_root.clone();
    let scan = tokio::task::spawn_blocking(move || scan_dicom_files(&root, &token))
        .await
        .map_err(|e| PacsError::Internal(format!("扫描任务异常: {}", e)))??;

    if scan.skipped > 0 {
        reporter.info(&format!("跳过 {} 个非DICOM文件", scan.skipped));
    }
    if scan.by_series.is_empty() {
        return Err(PacsError::NotFound(format!("{:?} 中没有DICOM文件", source)));
    }

    let total = scan.by_series.len();
    let mut used = HashSet::new();
    let mut series = Vec::with_capacity(total);
    reporter.advance(0, total);

    // 按序列号排序后再分配目录名
    let mut groups: Vec<(String, Vec<ScannedFile>)> = scan.by_series.into_iter().collect();
    groups.sort_by_key(|(uid, files)| (files.first().and_then(|f| f.series_number).unwrap_or(i32::MAX), uid.clone()));

    for (index, (series_uid, files)) in groups.into_iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(PacsError::Cancelled);
        }
        let first = &files[0];
        let folder = unique_name(
            &mut used,
            series_folder_name(first.series_number, index, first.series_description.as_deref()),
        );
        let directory = destination.join(&folder);
        tokio::fs::create_dir_all(&directory).await?;

        for (i, file) in files.iter().enumerate() {
            let name = match &file.sop_instance_uid {
                Some(uid) => format!("{}.dcm", uid),
                None => format!("IM{:05}.dcm", i + 1),
            };
            tokio::fs::copy(&file.path, directory.join(name)).await?;
        }

        reporter.info(&format!("整理序列 {}: {} 个文件", folder, files.len()));
        series.push(RetrievedSeries {
            identity: SeriesIdentity {
                study_uid: first.study_uid.clone(),
                series_uid,
                series_number: first.series_number,
                series_description: first.series_description.clone(),
                modality: first.modality.clone(),
                instance_count: Some(files.len() as u32),
            },
            directory,
            received: files.len(),
            reported_completed: files.len() as u32,
            reported_failed: 0,
        });
        reporter.advance(index + 1, total);
    }

    info!("导入 {:?} 完成: {} 个序列", source, series.len());
    Ok(RetrievalOutcome {
        accession_number: label,
        series,
        shortfall: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::instance;
    use crate::dimse::encode_dataset;
    use crate::server::part10_bytes;
    use crate::transfer_syntax::uids;
    use pacs_core::TracingReporter;
    use std::io::Write;

    fn write_instance(dir: &Path, name: &str, series: &str, sop: &str, number: i32, description: &str) {
        let obj = instance("1.2.3", series, sop, number, description);
        let data = encode_dataset(&obj, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let bytes =
            part10_bytes("1.2.840.10008.5.1.4.1.1.4", sop, uids::EXPLICIT_VR_LITTLE_ENDIAN, "TEST", &data).unwrap();
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_validate_archive_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.zip");
        std::fs::write(&path, b"not a zip").unwrap();
        assert!(matches!(validate_archive(&path), Err(PacsError::Validation(_))));
        assert!(validate_archive(&dir.path().join("missing.zip")).is_err());
    }

    #[test]
    fn test_extract_into_file_path_is_local_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("upload.zip");
        {
            let mut writer = zip::ZipWriter::new(std::fs::File::create(&archive).unwrap());
            writer.start_file("a/x1.dcm", zip::write::FileOptions::default()).unwrap();
            writer.write_all(b"DICM").unwrap();
            writer.finish().unwrap();
        }
        // 目标路径被普通文件占用，无法创建目录
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();

        let err = extract_zip(&archive, &blocked.join("dest")).unwrap_err();
        assert!(matches!(err, PacsError::Io(_)), "{:?}", err);
        assert!(!err.is_protocol_error());
    }

    #[tokio::test]
    async fn test_import_directory_groups_by_series() {
        let src = tempfile::tempdir().unwrap();
        write_instance(&src.path().join("a"), "x1", "1.2.3.2", "1.2.3.2.1", 2, "t1 se");
        write_instance(&src.path().join("a"), "x2", "1.2.3.1", "1.2.3.1.1", 1, "t2 tse");
        write_instance(&src.path().join("b"), "x3", "1.2.3.1", "1.2.3.1.2", 1, "t2 tse");
        std::fs::write(src.path().join("notes.txt"), b"hello").unwrap();
        std::fs::write(src.path().join("junk.bin"), b"not dicom").unwrap();

        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let outcome = import_file_set(src.path(), work.path(), dest.path(), &TracingReporter, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.series_count(), 2);
        assert_eq!(outcome.series[0].identity.series_uid, "1.2.3.1");
        assert_eq!(outcome.series[0].received, 2);
        assert!(dest.path().join("001_t2_tse").join("1.2.3.1.2.dcm").exists());
        assert!(dest.path().join("002_t1_se").join("1.2.3.2.1.dcm").exists());
    }

    #[tokio::test]
    async fn test_import_zip_archive() {
        let src = tempfile::tempdir().unwrap();
        write_instance(src.path(), "img.dcm", "1.2.3.1", "1.2.3.1.1", 1, "dwi");

        let zip_path = src.path().join("upload.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&zip_path).unwrap());
            writer
                .start_file("study/img.dcm", zip::write::FileOptions::default())
                .unwrap();
            writer.write_all(&std::fs::read(src.path().join("img.dcm")).unwrap()).unwrap();
            writer.finish().unwrap();
        }
        validate_archive(&zip_path).unwrap();

        let work = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let outcome = import_file_set(&zip_path, work.path(), dest.path(), &TracingReporter, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.accession_number, "upload");
        assert_eq!(outcome.file_count(), 1);
        assert!(dest.path().join("001_dwi").join("1.2.3.1.1.dcm").exists());
    }

    #[tokio::test]
    async fn test_import_without_dicom_is_not_found() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("readme.txt"), b"x").unwrap();
        let dest = tempfile::tempdir().unwrap();
        let err = import_file_set(src.path(), src.path(), dest.path(), &TracingReporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PacsError::NotFound(_)));
    }
}
