//! DICOM传输语法支持模块
//!
//! 协商、编解码以及体数据转换共用的传输语法查询。

use dicom_encoding::transfer_syntax::{TransferSyntax, TransferSyntaxIndex};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use pacs_core::{PacsError, Result};

/// 常用的传输语法UID常量
pub mod uids {
    /// 隐式VR Little Endian (默认传输语法)
    pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

    /// 显式VR Little Endian
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

    /// 显式VR Big Endian
    pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

    /// Deflated Explicit VR Little Endian
    pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";

    pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
    pub const JPEG_EXTENDED: &str = "1.2.840.10008.1.2.4.51";
    pub const JPEG_LOSSLESS: &str = "1.2.840.10008.1.2.4.57";
    pub const JPEG_LOSSLESS_SV1: &str = "1.2.840.10008.1.2.4.70";
    pub const JPEG_LS_LOSSLESS: &str = "1.2.840.10008.1.2.4.80";
    pub const JPEG_LS_NEAR_LOSSLESS: &str = "1.2.840.10008.1.2.4.81";
    pub const JPEG_2000_LOSSLESS: &str = "1.2.840.10008.1.2.4.90";
    pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
    pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
}

/// 查询/检索关联提议的传输语法，按优先级排列
pub const QUERY_TRANSFER_SYNTAXES: &[&str] = &[uids::EXPLICIT_VR_LITTLE_ENDIAN, uids::IMPLICIT_VR_LITTLE_ENDIAN];

/// 接收存储时可接受的传输语法，按优先级排列
pub const STORAGE_TRANSFER_SYNTAXES: &[&str] = &[
    uids::EXPLICIT_VR_LITTLE_ENDIAN,
    uids::IMPLICIT_VR_LITTLE_ENDIAN,
    uids::EXPLICIT_VR_BIG_ENDIAN,
    uids::JPEG_BASELINE,
    uids::JPEG_EXTENDED,
    uids::JPEG_LOSSLESS,
    uids::JPEG_LOSSLESS_SV1,
    uids::JPEG_LS_LOSSLESS,
    uids::JPEG_LS_NEAR_LOSSLESS,
    uids::JPEG_2000_LOSSLESS,
    uids::JPEG_2000,
    uids::RLE_LOSSLESS,
];

/// 根据UID获取传输语法
pub fn lookup(uid: &str) -> Result<&'static TransferSyntax> {
    let uid = uid.trim_end_matches(|c: char| c == '\0' || c == ' ');
    let registry: &'static TransferSyntaxRegistry = &TransferSyntaxRegistry;
    registry
        .get(uid)
        .ok_or_else(|| PacsError::DicomParseError(format!("不支持的传输语法: {}", uid)))
}

/// 是否为非压缩（原生像素）传输语法
pub fn is_native(uid: &str) -> bool {
    matches!(
        uid,
        uids::IMPLICIT_VR_LITTLE_ENDIAN | uids::EXPLICIT_VR_LITTLE_ENDIAN | uids::EXPLICIT_VR_BIG_ENDIAN
    )
}

/// 获取传输语法的名称
pub fn name(uid: &str) -> String {
    match uid {
        uids::IMPLICIT_VR_LITTLE_ENDIAN => "Implicit VR Little Endian".to_string(),
        uids::EXPLICIT_VR_LITTLE_ENDIAN => "Explicit VR Little Endian".to_string(),
        uids::EXPLICIT_VR_BIG_ENDIAN => "Explicit VR Big Endian".to_string(),
        uids::DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN => "Deflated Explicit VR Little Endian".to_string(),
        uids::JPEG_BASELINE => "JPEG Baseline (Process 1)".to_string(),
        uids::JPEG_EXTENDED => "JPEG Extended (Process 2 & 4)".to_string(),
        uids::JPEG_LOSSLESS => "JPEG Lossless (Process 14)".to_string(),
        uids::JPEG_LOSSLESS_SV1 => "JPEG Lossless, Non-Hierarchical, First-Order Prediction".to_string(),
        uids::JPEG_LS_LOSSLESS => "JPEG-LS Lossless Image Compression".to_string(),
        uids::JPEG_LS_NEAR_LOSSLESS => "JPEG-LS Near Lossless Image Compression".to_string(),
        uids::JPEG_2000_LOSSLESS => "JPEG 2000 Image Compression (Lossless Only)".to_string(),
        uids::JPEG_2000 => "JPEG 2000 Image Compression".to_string(),
        uids::RLE_LOSSLESS => "RLE Lossless".to_string(),
        _ => format!("Unknown Transfer Syntax ({})", uid),
    }
}

/// 在提议列表中选出第一个本端支持的传输语法
pub fn negotiate<'a>(proposed: &'a [String], supported: &[&str]) -> Option<&'a str> {
    proposed
        .iter()
        .map(|ts| ts.trim_end_matches('\0'))
        .find(|ts| supported.contains(ts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_syntaxes() {
        assert!(lookup(uids::IMPLICIT_VR_LITTLE_ENDIAN).is_ok());
        assert!(lookup("1.2.840.10008.1.2.1\0").is_ok());
        assert!(lookup("1.2.3.4.5.6.7.8.9").is_err());
    }

    #[test]
    fn test_native_syntaxes() {
        assert!(is_native(uids::EXPLICIT_VR_LITTLE_ENDIAN));
        assert!(!is_native(uids::JPEG_2000));
    }

    #[test]
    fn test_negotiate_follows_proposer_order() {
        let proposed = vec![uids::JPEG_2000.to_string(), uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string()];
        assert_eq!(
            negotiate(&proposed, QUERY_TRANSFER_SYNTAXES),
            Some(uids::IMPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(negotiate(&proposed, STORAGE_TRANSFER_SYNTAXES), Some(uids::JPEG_2000));
        assert_eq!(negotiate(&["9.9".to_string()], STORAGE_TRANSFER_SYNTAXES), None);
    }

    #[test]
    fn test_names() {
        assert_eq!(name(uids::RLE_LOSSLESS), "RLE Lossless");
        assert!(name("1.2.3").starts_with("Unknown"));
    }
}
