//! 体数据转换
//!
//! 输出约定: 三维数组，轴顺序 (层, 行, 列)，float32。方向统一到最接近的标准轴:
//! 层从上到下 (superior -> inferior)，行从前到后，列从右到左。
//! 原生转换器只处理非压缩单通道像素；其他情况交给外部命令 (如 dcm2niix)。

use crate::extractor::series_files;
use crate::server::write_atomically;
use crate::transfer_syntax::{self, uids};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use dicom_core::value::PrimitiveValue;
use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use ndarray::{Array3, Axis};
use pacs_core::{PacsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// 序列目录 -> 体数据文件
#[async_trait]
pub trait VolumeConverter: Send + Sync {
    fn name(&self) -> &str;

    /// 输出文件扩展名，不含前导点
    fn extension(&self) -> &str;

    /// 转换一个序列，返回生成的文件路径
    async fn convert(&self, series_dir: &Path, output_dir: &Path, name: &str) -> Result<PathBuf>;
}

fn conversion_error(message: impl Into<String>) -> PacsError {
    PacsError::Conversion(message.into())
}

fn int_of(obj: &InMemDicomObject, tag: Tag) -> Option<i64> {
    obj.get(tag).and_then(|e| e.to_int::<i64>().ok())
}

fn float_of(obj: &InMemDicomObject, tag: Tag) -> Option<f64> {
    obj.get(tag).and_then(|e| e.to_float64().ok()).filter(|v| v.is_finite())
}

fn floats_of<const N: usize>(obj: &InMemDicomObject, tag: Tag) -> Option<[f64; N]> {
    let values = obj.get(tag).and_then(|e| e.to_multi_float64().ok())?;
    values.get(..N)?.try_into().ok()
}

/// 单个文件的像素与几何信息
#[derive(Debug)]
struct Slice {
    rows: usize,
    columns: usize,
    frames: usize,
    position: Option<[f64; 3]>,
    orientation: Option<[f64; 6]>,
    instance_number: Option<i64>,
    pixels: Vec<f32>,
}

fn decode_samples(primitive: &PrimitiveValue, bits: i64, signed: bool, big_endian: bool) -> Result<Vec<f64>> {
    let samples = match primitive {
        PrimitiveValue::U16(v) => v
            .iter()
            .map(|&x| if signed { x as i16 as f64 } else { x as f64 })
            .collect(),
        PrimitiveValue::I16(v) => v.iter().map(|&x| x as f64).collect(),
        PrimitiveValue::U32(v) => v
            .iter()
            .map(|&x| if signed { x as i32 as f64 } else { x as f64 })
            .collect(),
        PrimitiveValue::I32(v) => v.iter().map(|&x| x as f64).collect(),
        PrimitiveValue::U8(bytes) => match bits {
            8 => bytes
                .iter()
                .map(|&x| if signed { x as i8 as f64 } else { x as f64 })
                .collect(),
            16 => {
                let mut words = vec![0u16; bytes.len() / 2];
                if big_endian {
                    BigEndian::read_u16_into(&bytes[..words.len() * 2], &mut words);
                } else {
                    LittleEndian::read_u16_into(&bytes[..words.len() * 2], &mut words);
                }
                words
                    .into_iter()
                    .map(|x| if signed { x as i16 as f64 } else { x as f64 })
                    .collect()
            }
            32 => {
                let mut words = vec![0u32; bytes.len() / 4];
                if big_endian {
                    BigEndian::read_u32_into(&bytes[..words.len() * 4], &mut words);
                } else {
                    LittleEndian::read_u32_into(&bytes[..words.len() * 4], &mut words);
                }
                words
                    .into_iter()
                    .map(|x| if signed { x as i32 as f64 } else { x as f64 })
                    .collect()
            }
            other => return Err(conversion_error(format!("不支持 BitsAllocated={}", other))),
        },
        _ => return Err(conversion_error("不支持的像素数据表示")),
    };
    Ok(samples)
}

fn read_slice(path: &Path) -> Result<Option<Slice>> {
    let file = match dicom_object::open_file(path) {
        Ok(file) => file,
        Err(e) => {
            debug!("跳过不可读文件 {:?}: {}", path, e);
            return Ok(None);
        }
    };
    let ts = file.meta().transfer_syntax().to_string();
    if !transfer_syntax::is_native(&ts) {
        return Err(conversion_error(format!(
            "{:?} 使用压缩传输语法 {}，需要外部转换器",
            path,
            transfer_syntax::name(&ts)
        )));
    }
    let obj: &InMemDicomObject = &file;

    let rows = int_of(obj, tags::ROWS).ok_or_else(|| conversion_error(format!("{:?} 缺少 Rows", path)))? as usize;
    let columns =
        int_of(obj, tags::COLUMNS).ok_or_else(|| conversion_error(format!("{:?} 缺少 Columns", path)))? as usize;
    if int_of(obj, tags::SAMPLES_PER_PIXEL).unwrap_or(1) != 1 {
        return Err(conversion_error(format!("{:?} 不是单通道图像", path)));
    }
    let frames = int_of(obj, tags::NUMBER_OF_FRAMES).unwrap_or(1).max(1) as usize;
    let bits = int_of(obj, tags::BITS_ALLOCATED).unwrap_or(16);
    let signed = int_of(obj, tags::PIXEL_REPRESENTATION).unwrap_or(0) == 1;
    let slope = float_of(obj, tags::RESCALE_SLOPE).unwrap_or(1.0);
    let intercept = float_of(obj, tags::RESCALE_INTERCEPT).unwrap_or(0.0);

    let pixel_data = obj
        .get(tags::PIXEL_DATA)
        .ok_or_else(|| conversion_error(format!("{:?} 没有像素数据", path)))?;
    let primitive = pixel_data
        .value()
        .primitive()
        .ok_or_else(|| conversion_error(format!("{:?} 像素数据为封装格式，需要外部转换器", path)))?;
    let mut samples = decode_samples(primitive, bits, signed, ts == uids::EXPLICIT_VR_BIG_ENDIAN)?;
    let expected = rows * columns * frames;
    if samples.len() < expected {
        return Err(conversion_error(format!(
            "{:?} 像素数量 {} 少于 {}x{}x{}",
            path,
            samples.len(),
            frames,
            rows,
            columns
        )));
    }
    samples.truncate(expected);

    let mut pixels: Vec<f32> = samples.into_iter().map(|v| (v * slope + intercept) as f32).collect();
    let photometric = obj
        .get(tags::PHOTOMETRIC_INTERPRETATION)
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim().to_uppercase())
        .unwrap_or_default();
    if photometric == "MONOCHROME1" {
        let max = pixels.iter().cloned().fold(f32::MIN, f32::max);
        pixels.iter_mut().for_each(|v| *v = max - *v);
    }

    Ok(Some(Slice {
        rows,
        columns,
        frames,
        position: floats_of::<3>(obj, tags::IMAGE_POSITION_PATIENT),
        orientation: floats_of::<6>(obj, tags::IMAGE_ORIENTATION_PATIENT),
        instance_number: int_of(obj, tags::INSTANCE_NUMBER),
        pixels,
    }))
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// 输出轴 i 对应的患者坐标轴 (LPS) 以及期望的正方向
const OUTPUT_WORLD_AXES: [(usize, f64); 3] = [(2, -1.0), (1, 1.0), (0, 1.0)];

const PERMUTATIONS: [[usize; 3]; 6] = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

/// 根据体素轴方向选出最接近标准方向的轴置换与翻转
///
/// `voxel_axes` 依次为层、行、列索引递增方向在患者坐标系中的单位向量。
pub(crate) fn canonical_layout(voxel_axes: [[f64; 3]; 3]) -> ([usize; 3], [bool; 3]) {
    let score = |perm: &[usize; 3]| -> f64 {
        (0..3)
            .map(|i| voxel_axes[perm[i]][OUTPUT_WORLD_AXES[i].0].abs())
            .sum()
    };
    let mut best = PERMUTATIONS[0];
    for perm in PERMUTATIONS.iter().skip(1) {
        if score(perm) > score(&best) + 1e-9 {
            best = *perm;
        }
    }
    let mut flips = [false; 3];
    for (i, flip) in flips.iter_mut().enumerate() {
        let (world, sign) = OUTPUT_WORLD_AXES[i];
        *flip = voxel_axes[best[i]][world] * sign < 0.0;
    }
    (best, flips)
}

/// 读取序列目录并组装体数据
pub fn build_volume(series_dir: &Path) -> Result<Array3<f32>> {
    let mut slices = Vec::new();
    for path in series_files(series_dir)? {
        if let Some(slice) = read_slice(&path)? {
            slices.push(slice);
        }
    }
    let first = slices
        .first()
        .ok_or_else(|| conversion_error(format!("{:?} 中没有可转换的DICOM文件", series_dir)))?;
    let (rows, columns) = (first.rows, first.columns);
    if slices.iter().any(|s| s.rows != rows || s.columns != columns) {
        return Err(conversion_error(format!("{:?} 中的图像尺寸不一致", series_dir)));
    }

    let orientation = first.orientation;
    let geometry_usable = orientation.is_some()
        && slices.iter().all(|s| s.frames == 1 && s.position.is_some())
        && slices.iter().all(|s| s.orientation == orientation);

    let mut axes = None;
    if let (true, Some(iop)) = (geometry_usable, orientation) {
        let row_dir = [iop[0], iop[1], iop[2]];
        let col_dir = [iop[3], iop[4], iop[5]];
        let normal = cross(row_dir, col_dir);
        slices.sort_by(|a, b| {
            let da = a.position.map(|p| dot(p, normal)).unwrap_or(0.0);
            let db = b.position.map(|p| dot(p, normal)).unwrap_or(0.0);
            da.total_cmp(&db)
        });
        axes = Some([normal, col_dir, row_dir]);
    } else {
        warn!("{:?} 缺少完整的空间信息，按实例号排列且不做方向校正", series_dir);
        slices.sort_by_key(|s| s.instance_number.unwrap_or(i64::MAX));
    }

    let depth: usize = slices.iter().map(|s| s.frames).sum();
    let mut data = Vec::with_capacity(depth * rows * columns);
    for slice in slices {
        data.extend(slice.pixels);
    }
    let volume = Array3::from_shape_vec((depth, rows, columns), data)
        .map_err(|e| conversion_error(format!("体数据形状错误: {}", e)))?;

    let Some(axes) = axes else {
        return Ok(volume);
    };
    let (perm, flips) = canonical_layout(axes);
    let mut oriented = volume.permuted_axes(perm);
    for (i, flip) in flips.iter().enumerate() {
        if *flip {
            oriented.invert_axis(Axis(i));
        }
    }
    Ok(oriented)
}

/// NumPy `.npy` v1.0 头，`<f4` C 顺序，总长度按 64 字节对齐
pub fn npy_header(shape: &[usize]) -> Vec<u8> {
    let shape = match shape {
        [single] => format!("({},)", single),
        dims => format!(
            "({})",
            dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
        ),
    };
    let dict = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': {}, }}", shape);
    // 魔数 6 + 版本 2 + 长度 2
    let unpadded = 10 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(10 + header_len);
    out.extend_from_slice(b"\x93NUMPY");
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    out
}

/// 按逻辑顺序编码为 `.npy` 字节
pub fn encode_npy(volume: &Array3<f32>) -> Result<Vec<u8>> {
    let mut out = npy_header(volume.shape());
    out.reserve(volume.len() * 4);
    for value in volume.iter() {
        out.write_f32::<LittleEndian>(*value)?;
    }
    Ok(out)
}

/// 原生 `.npy` 转换器
#[derive(Debug, Default, Clone, Copy)]
pub struct NpyConverter;

#[async_trait]
impl VolumeConverter for NpyConverter {
    fn name(&self) -> &str {
        "native-npy"
    }

    fn extension(&self) -> &str {
        "npy"
    }

    async fn convert(&self, series_dir: &Path, output_dir: &Path, name: &str) -> Result<PathBuf> {
        let dir = series_dir.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || build_volume(&dir).and_then(|v| encode_npy(&v)))
            .await
            .map_err(|e| PacsError::Internal(format!("转换任务异常: {}", e)))??;
        let file_name = format!("{}.npy", name);
        write_atomically(output_dir, &file_name, &bytes).await?;
        let path = output_dir.join(file_name);
        debug!("写出 {:?} ({} 字节)", path, bytes.len());
        Ok(path)
    }
}

/// 外部转换命令
///
/// 参数中的 `{input}`、`{output}`、`{name}` 在运行时替换。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExternalCommand {
    pub program: String,
    pub args: Vec<String>,
    pub extension: String,
    pub timeout_secs: u64,
}

impl Default for ExternalCommand {
    fn default() -> Self {
        Self {
            program: "dcm2niix".to_string(),
            args: ["-z", "y", "-f", "{name}", "-o", "{output}", "{input}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extension: "nii.gz".to_string(),
            timeout_secs: 600,
        }
    }
}

/// 调用外部程序的转换器
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    command: ExternalCommand,
}

impl ExternalConverter {
    pub fn new(command: ExternalCommand) -> Self {
        Self { command }
    }

    fn render_args(&self, input: &Path, output: &Path, name: &str) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.command
            .args
            .iter()
            .map(|a| {
                a.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{name}", name)
            })
            .collect()
    }
}

#[async_trait]
impl VolumeConverter for ExternalConverter {
    fn name(&self) -> &str {
        &self.command.program
    }

    fn extension(&self) -> &str {
        &self.command.extension
    }

    async fn convert(&self, series_dir: &Path, output_dir: &Path, name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(output_dir).await?;
        let args = self.render_args(series_dir, output_dir, name);
        debug!("运行外部转换: {} {:?}", self.command.program, args);

        let child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(Duration::from_secs(self.command.timeout_secs), child).await {
            Ok(result) => {
                result.map_err(|e| conversion_error(format!("无法启动 {}: {}", self.command.program, e)))?
            }
            Err(_) => {
                return Err(conversion_error(format!(
                    "{} 超过 {} 秒未完成",
                    self.command.program, self.command.timeout_secs
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.chars().rev().take(500).collect::<Vec<_>>().into_iter().rev().collect();
            return Err(conversion_error(format!(
                "{} 退出码 {:?}: {}",
                self.command.program,
                output.status.code(),
                tail.trim()
            )));
        }

        let suffix = format!(".{}", self.command.extension);
        let mut produced: Vec<PathBuf> = std::fs::read_dir(output_dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with(name) && n.ends_with(&suffix)
                    })
                    .unwrap_or(false)
            })
            .collect();
        produced.sort();
        let path = produced
            .into_iter()
            .next()
            .ok_or_else(|| conversion_error(format!("{} 没有生成 {} 文件", self.command.program, suffix)))?;
        info!("外部转换完成: {:?}", path);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::instance;
    use crate::dimse::encode_dataset;
    use crate::server::part10_bytes;
    use dicom_core::{dicom_value, DataElement, VR};

    fn strs(values: &[f64]) -> PrimitiveValue {
        PrimitiveValue::Strs(values.iter().map(|v| v.to_string()).collect::<Vec<_>>().into())
    }

    /// 2x3 的切片，像素值 = 基数 + 索引
    fn write_slice(dir: &Path, index: u16, z: f64, iop: &[f64], base: u16) {
        let sop = format!("1.2.3.1.{}", index);
        let mut obj = instance("1.2.3", "1.2.3.1", &sop, 1, "t1");
        obj.put(DataElement::new(tags::ROWS, VR::US, dicom_value!(U16, [2])));
        obj.put(DataElement::new(tags::COLUMNS, VR::US, dicom_value!(U16, [3])));
        obj.put(DataElement::new(tags::BITS_ALLOCATED, VR::US, dicom_value!(U16, [16])));
        obj.put(DataElement::new(tags::BITS_STORED, VR::US, dicom_value!(U16, [16])));
        obj.put(DataElement::new(tags::PIXEL_REPRESENTATION, VR::US, dicom_value!(U16, [0])));
        obj.put(DataElement::new(tags::SAMPLES_PER_PIXEL, VR::US, dicom_value!(U16, [1])));
        obj.put(DataElement::new(tags::PHOTOMETRIC_INTERPRETATION, VR::CS, dicom_value!(Str, "MONOCHROME2")));
        obj.put(DataElement::new(tags::RESCALE_SLOPE, VR::DS, dicom_value!(Str, "2")));
        obj.put(DataElement::new(tags::RESCALE_INTERCEPT, VR::DS, dicom_value!(Str, "-1")));
        obj.put(DataElement::new(tags::IMAGE_POSITION_PATIENT, VR::DS, strs(&[0.0, 0.0, z])));
        obj.put(DataElement::new(tags::IMAGE_ORIENTATION_PATIENT, VR::DS, strs(iop)));
        obj.put(DataElement::new(
            tags::INSTANCE_NUMBER,
            VR::IS,
            dicom_value!(Str, index.to_string()),
        ));
        let pixels: Vec<u16> = (0..6).map(|i| base + i).collect();
        obj.put(DataElement::new(tags::PIXEL_DATA, VR::OW, PrimitiveValue::U16(pixels.into())));

        let data = encode_dataset(&obj, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let bytes =
            part10_bytes("1.2.840.10008.5.1.4.1.1.4", &sop, uids::EXPLICIT_VR_LITTLE_ENDIAN, "", &data).unwrap();
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(format!("{}.dcm", sop)), bytes).unwrap();
    }

    const AXIAL: [f64; 6] = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    #[test]
    fn test_npy_header_alignment() {
        let header = npy_header(&[3, 2, 4]);
        assert_eq!(header.len() % 64, 0);
        assert_eq!(&header[..6], b"\x93NUMPY");
        let text = String::from_utf8_lossy(&header[10..]);
        assert!(text.contains("'shape': (3, 2, 4)"));
        assert!(text.ends_with('\n'));
        assert!(String::from_utf8_lossy(&npy_header(&[5])).contains("(5,)"));
    }

    #[test]
    fn test_axial_volume_runs_superior_to_inferior() {
        let dir = tempfile::tempdir().unwrap();
        // 文件名顺序与空间顺序相反
        write_slice(dir.path(), 1, 0.0, &AXIAL, 0);
        write_slice(dir.path(), 2, 10.0, &AXIAL, 100);
        write_slice(dir.path(), 3, 5.0, &AXIAL, 50);

        let volume = build_volume(dir.path()).unwrap();
        assert_eq!(volume.shape(), &[3, 2, 3]);
        // 最上方 (z=10) 在前，并应用了 slope/intercept
        assert_eq!(volume[[0, 0, 0]], 199.0);
        assert_eq!(volume[[1, 0, 0]], 99.0);
        assert_eq!(volume[[2, 0, 0]], -1.0);
        assert_eq!(volume[[0, 1, 2]], 209.0);
    }

    #[test]
    fn test_reversed_row_direction_is_flipped() {
        let dir = tempfile::tempdir().unwrap();
        // 行方向指向患者右侧
        let iop = [-1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        write_slice(dir.path(), 1, 0.0, &iop, 0);
        write_slice(dir.path(), 2, 5.0, &iop, 10);
        let volume = build_volume(dir.path()).unwrap();
        // 列被翻转: 原来的最后一列在最前
        assert_eq!(volume[[0, 0, 0]], 2.0 * 12.0 - 1.0);
        assert_eq!(volume[[0, 0, 2]], 2.0 * 10.0 - 1.0);
    }

    #[test]
    fn test_canonical_layout_for_sagittal() {
        // 行 -> 后方 (+y)，列 -> 下方 (-z)，法向 = (-1, 0, 0)
        let row = [0.0, 1.0, 0.0];
        let col = [0.0, 0.0, -1.0];
        let normal = cross(row, col);
        let (perm, flips) = canonical_layout([normal, col, row]);
        // 输出 (z, y, x) 分别来自 (行, 列, 层)
        assert_eq!(perm, [1, 2, 0]);
        assert_eq!(flips, [false, false, true]);
    }

    #[tokio::test]
    async fn test_npy_converter_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let series = dir.path().join("001_t1");
        write_slice(&series, 1, 0.0, &AXIAL, 0);
        let out = dir.path().join("out");
        let path = NpyConverter.convert(&series, &out, "001_t1").await.unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let header = npy_header(&[1, 2, 3]);
        assert_eq!(&bytes[..header.len()], &header[..]);
        assert_eq!(bytes.len(), header.len() + 6 * 4);
        assert_eq!(LittleEndian::read_f32(&bytes[header.len()..]), -1.0);
    }

    #[tokio::test]
    async fn test_empty_directory_fails_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let err = NpyConverter.convert(dir.path(), dir.path(), "x").await.unwrap_err();
        assert!(matches!(err, PacsError::Conversion(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_converter_contract() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let converter = ExternalConverter::new(ExternalCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "touch {output}/{name}.nii.gz".to_string()],
            extension: "nii.gz".to_string(),
            timeout_secs: 10,
        });
        let path = converter.convert(dir.path(), &out, "002_dwi").await.unwrap();
        assert_eq!(path, out.join("002_dwi.nii.gz"));

        let failing = ExternalConverter::new(ExternalCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            extension: "nii.gz".to_string(),
            timeout_secs: 10,
        });
        let err = failing.convert(dir.path(), &out, "003_x").await.unwrap_err();
        assert!(matches!(err, PacsError::Conversion(ref m) if m.contains("boom")));
    }
}
