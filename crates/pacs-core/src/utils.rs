//! 通用工具函数

use chrono::NaiveDate;
use uuid::Uuid;

/// 本实现的 Implementation Class UID
pub const IMPLEMENTATION_CLASS_UID: &str = "1.2.826.0.1.3680043.9.7382.1.1";

/// 本实现的 Implementation Version Name (不超过16字符)
pub const IMPLEMENTATION_VERSION_NAME: &str = "PACS_RS_010";

/// 生成唯一的DICOM标识符
pub fn generate_dicom_uid() -> String {
    // UUID 派生的 2.25 根，保证不超过64字符
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

/// 验证DICOM UID格式
pub fn is_valid_dicom_uid(uid: &str) -> bool {
    !uid.is_empty()
        && uid.len() <= 64
        && uid.chars().all(|c| c.is_ascii_digit() || c == '.')
        && !uid.starts_with('.')
        && !uid.ends_with('.')
        && !uid.contains("..")
}

/// 去掉DICOM字符串值的填充（空格与NUL）
pub fn trim_dicom_str(s: &str) -> &str {
    s.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

const ILLEGAL_PATH_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// 清理文件夹名称，移除Windows及转换工具不兼容的字符
pub fn sanitize_folder_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '.' {
            let mut j = i;
            while j < chars.len() && chars[j] == '.' {
                j += 1;
            }
            // 点后接空白（如 "303. X Elbow"）整体替换为下划线
            if j < chars.len() && chars[j].is_whitespace() {
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                out.push('_');
            } else {
                out.push('.');
            }
            i = j;
        } else if c.is_whitespace() {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            out.push('_');
        } else {
            out.push(if ILLEGAL_PATH_CHARS.contains(&c) { '_' } else { c });
            i += 1;
        }
    }

    let trimmed: String = out
        .trim_matches(|c| c == '.' || c == '_' || c == ' ')
        .chars()
        .take(50)
        .collect();
    let trimmed = trimmed.trim_matches('.');

    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// 序列目录名: `{SeriesNumber:0>3}_{清理后的描述}`
pub fn series_folder_name(series_number: Option<i32>, index: usize, description: Option<&str>) -> String {
    let number = match series_number {
        Some(n) => format!("{:0>3}", n),
        None => format!("Series{}", index + 1),
    };
    format!("{}_{}", number, sanitize_folder_name(description.unwrap_or("Unknown")))
}

/// 解析DICOM TM值为当日秒数
///
/// 支持 `HH`、`HHMM`、`HHMMSS`、`HHMMSS.FFFFFF` 以及旧式 `HH:MM:SS`。
pub fn parse_dicom_time(value: &str) -> Option<f64> {
    let value = trim_dicom_str(value).replace(':', "");
    if value.is_empty() {
        return None;
    }
    let (whole, frac) = match value.split_once('.') {
        Some((w, f)) => (w.to_string(), f.to_string()),
        None => (value.clone(), String::new()),
    };
    if whole.len() % 2 != 0 || whole.len() > 6 || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let field = |start: usize| -> Option<f64> {
        whole.get(start..start + 2).map(|s| s.parse::<f64>().ok()).unwrap_or(Some(0.0))
    };
    let hours = field(0)?;
    let minutes = field(2)?;
    let seconds = field(4)?;
    if hours >= 24.0 || minutes >= 60.0 || seconds >= 61.0 {
        return None;
    }

    let fraction = if frac.is_empty() {
        0.0
    } else {
        format!("0.{}", frac).parse::<f64>().ok()?
    };

    Some(hours * 3600.0 + minutes * 60.0 + seconds + fraction)
}

/// 解析DICOM DA值
pub fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    let value = trim_dicom_str(value);
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y.%m.%d"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_dicom_uid() {
        let uid = generate_dicom_uid();
        assert!(is_valid_dicom_uid(&uid));
    }

    #[test]
    fn test_is_valid_dicom_uid() {
        assert!(is_valid_dicom_uid("1.2.840.10008.5.1.4.1.1.4"));
        assert!(!is_valid_dicom_uid(""));
        assert!(!is_valid_dicom_uid("invalid.uid.with.letters"));
        assert!(!is_valid_dicom_uid("1..2"));
    }

    #[test]
    fn test_sanitize_folder_name() {
        assert_eq!(sanitize_folder_name("303. X Elbow"), "303_X_Elbow");
        assert_eq!(sanitize_folder_name("t1_fl2d_tra <a/b>"), "t1_fl2d_tra__a_b");
        assert_eq!(sanitize_folder_name("  ..  "), "Unknown");
        assert_eq!(sanitize_folder_name("a...b"), "a.b");
        assert_eq!(sanitize_folder_name(&"x".repeat(80)).len(), 50);
    }

    #[test]
    fn test_series_folder_name() {
        assert_eq!(series_folder_name(Some(5), 0, Some("t2 tse tra")), "005_t2_tse_tra");
        assert_eq!(series_folder_name(None, 2, None), "Series3_Unknown");
    }

    #[test]
    fn test_parse_dicom_time() {
        assert_eq!(parse_dicom_time("101530"), Some(36930.0));
        assert_eq!(parse_dicom_time("1015"), Some(36900.0));
        assert_eq!(parse_dicom_time("10:15:30"), Some(36930.0));
        let t = parse_dicom_time("101530.25 ").unwrap();
        assert!((t - 36930.25).abs() < 1e-9);
        assert_eq!(parse_dicom_time(""), None);
        assert_eq!(parse_dicom_time("2561"), None);
    }

    #[test]
    fn test_parse_dicom_date() {
        assert_eq!(parse_dicom_date("20250530"), NaiveDate::from_ymd_opt(2025, 5, 30));
        assert_eq!(parse_dicom_date("garbage"), None);
    }
}
