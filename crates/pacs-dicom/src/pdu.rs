//! DICOM上层协议 PDU 编解码
//!
//! PDU 头固定6字节：类型(1) + 保留(1) + 长度(4, 大端)。
//! `PduCodec` 同时实现 tokio-util 的 `Decoder` 与 `Encoder`，
//! 可以直接包在 `Framed` 中使用。

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pacs_core::{PacsError, Result};
use tokio_util::codec::{Decoder, Encoder};

/// DICOM 应用上下文
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// 默认最大 PDU 长度
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 16384;

const PDU_HEADER_LEN: usize = 6;
const AE_TITLE_LEN: usize = 16;

/// 未设置上限时对单个 PDU 的防御性限制
const HARD_PDU_LIMIT: usize = 64 * 1024 * 1024;

const PDU_ASSOCIATE_RQ: u8 = 0x01;
const PDU_ASSOCIATE_AC: u8 = 0x02;
const PDU_ASSOCIATE_RJ: u8 = 0x03;
const PDU_P_DATA_TF: u8 = 0x04;
const PDU_RELEASE_RQ: u8 = 0x05;
const PDU_RELEASE_RP: u8 = 0x06;
const PDU_ABORT: u8 = 0x07;

const ITEM_APPLICATION_CONTEXT: u8 = 0x10;
const ITEM_PRESENTATION_CONTEXT_RQ: u8 = 0x20;
const ITEM_PRESENTATION_CONTEXT_AC: u8 = 0x21;
const ITEM_ABSTRACT_SYNTAX: u8 = 0x30;
const ITEM_TRANSFER_SYNTAX: u8 = 0x40;
const ITEM_USER_INFORMATION: u8 = 0x50;
const ITEM_MAX_LENGTH: u8 = 0x51;
const ITEM_IMPLEMENTATION_CLASS_UID: u8 = 0x52;
const ITEM_IMPLEMENTATION_VERSION_NAME: u8 = 0x55;

/// 请求方提议的表示上下文
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextProposed {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntaxes: Vec<String>,
}

/// 表示上下文协商结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationContextResultReason {
    Acceptance,
    UserRejection,
    NoReason,
    AbstractSyntaxNotSupported,
    TransferSyntaxesNotSupported,
}

impl PresentationContextResultReason {
    fn code(self) -> u8 {
        match self {
            Self::Acceptance => 0,
            Self::UserRejection => 1,
            Self::NoReason => 2,
            Self::AbstractSyntaxNotSupported => 3,
            Self::TransferSyntaxesNotSupported => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            2 => Self::NoReason,
            3 => Self::AbstractSyntaxNotSupported,
            4 => Self::TransferSyntaxesNotSupported,
            other => {
                return Err(PacsError::Protocol(format!("未知的表示上下文结果: {}", other)))
            }
        })
    }
}

/// 接受方返回的表示上下文
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContextResult {
    pub id: u8,
    pub reason: PresentationContextResultReason,
    pub transfer_syntax: String,
}

/// 用户信息子项
#[derive(Debug, Clone, PartialEq)]
pub struct UserVariables {
    pub max_pdu_length: u32, // 0 表示不限制
    pub implementation_class_uid: String,
    pub implementation_version_name: Option<String>,
}

/// A-ASSOCIATE-RQ
#[derive(Debug, Clone, PartialEq)]
pub struct AssociateRq {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextProposed>,
    pub user_variables: UserVariables,
}

/// A-ASSOCIATE-AC
#[derive(Debug, Clone, PartialEq)]
pub struct AssociateAc {
    pub called_ae_title: String,
    pub calling_ae_title: String,
    pub application_context: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: UserVariables,
}

/// P-DATA-TF 中的单个 PDV
#[derive(Debug, Clone, PartialEq)]
pub struct PDataValue {
    pub presentation_context_id: u8,
    pub is_command: bool,
    pub is_last: bool,
    pub data: Bytes,
}

/// 协议数据单元
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj { result: u8, source: u8, reason: u8 },
    PData(Vec<PDataValue>),
    ReleaseRq,
    ReleaseRp,
    Abort { source: u8, reason: u8 },
}

impl Pdu {
    /// 用于日志的简短名称
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::AssociateRq(_) => "A-ASSOCIATE-RQ",
            Pdu::AssociateAc(_) => "A-ASSOCIATE-AC",
            Pdu::AssociateRj { .. } => "A-ASSOCIATE-RJ",
            Pdu::PData(_) => "P-DATA-TF",
            Pdu::ReleaseRq => "A-RELEASE-RQ",
            Pdu::ReleaseRp => "A-RELEASE-RP",
            Pdu::Abort { .. } => "A-ABORT",
        }
    }
}

/// DICOM网络编解码器
#[derive(Debug, Clone)]
pub struct PduCodec {
    max_pdu_length: u32, // 本端可接收的最大 P-DATA 长度
}

impl PduCodec {
    pub fn new(max_pdu_length: u32) -> Self {
        Self { max_pdu_length }
    }
}

impl Default for PduCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PDU_LENGTH)
    }
}

impl Decoder for PduCodec {
    type Item = Pdu;
    type Error = PacsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < PDU_HEADER_LEN {
            return Ok(None);
        }

        let pdu_type = src[0];
        let pdu_length = u32::from_be_bytes([src[2], src[3], src[4], src[5]]) as usize;

        let limit = if pdu_type == PDU_P_DATA_TF && self.max_pdu_length > 0 {
            self.max_pdu_length as usize
        } else {
            HARD_PDU_LIMIT
        };
        if pdu_length > limit {
            return Err(PacsError::Protocol(format!(
                "PDU长度 {} 超过上限 {}",
                pdu_length, limit
            )));
        }

        let total_length = PDU_HEADER_LEN + pdu_length;
        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total_length).freeze();
        frame.advance(PDU_HEADER_LEN);
        decode_body(pdu_type, frame).map(Some)
    }
}

impl Encoder<Pdu> for PduCodec {
    type Error = PacsError;

    fn encode(&mut self, item: Pdu, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let pdu_type = match &item {
            Pdu::AssociateRq(rq) => {
                write_associate_header(&mut body, &rq.called_ae_title, &rq.calling_ae_title)?;
                write_item(&mut body, ITEM_APPLICATION_CONTEXT, rq.application_context.as_bytes())?;
                for pc in &rq.presentation_contexts {
                    let mut sub = BytesMut::new();
                    sub.put_u8(pc.id);
                    sub.put_slice(&[0, 0, 0]);
                    write_item(&mut sub, ITEM_ABSTRACT_SYNTAX, pc.abstract_syntax.as_bytes())?;
                    for ts in &pc.transfer_syntaxes {
                        write_item(&mut sub, ITEM_TRANSFER_SYNTAX, ts.as_bytes())?;
                    }
                    write_item(&mut body, ITEM_PRESENTATION_CONTEXT_RQ, &sub)?;
                }
                write_user_variables(&mut body, &rq.user_variables)?;
                PDU_ASSOCIATE_RQ
            }
            Pdu::AssociateAc(ac) => {
                write_associate_header(&mut body, &ac.called_ae_title, &ac.calling_ae_title)?;
                write_item(&mut body, ITEM_APPLICATION_CONTEXT, ac.application_context.as_bytes())?;
                for pc in &ac.presentation_contexts {
                    let mut sub = BytesMut::new();
                    sub.put_u8(pc.id);
                    sub.put_u8(0);
                    sub.put_u8(pc.reason.code());
                    sub.put_u8(0);
                    write_item(&mut sub, ITEM_TRANSFER_SYNTAX, pc.transfer_syntax.as_bytes())?;
                    write_item(&mut body, ITEM_PRESENTATION_CONTEXT_AC, &sub)?;
                }
                write_user_variables(&mut body, &ac.user_variables)?;
                PDU_ASSOCIATE_AC
            }
            Pdu::AssociateRj { result, source, reason } => {
                body.put_slice(&[0, *result, *source, *reason]);
                PDU_ASSOCIATE_RJ
            }
            Pdu::PData(values) => {
                for pdv in values {
                    body.put_u32(pdv.data.len() as u32 + 2);
                    body.put_u8(pdv.presentation_context_id);
                    let mut header = 0u8;
                    if pdv.is_command {
                        header |= 0x01;
                    }
                    if pdv.is_last {
                        header |= 0x02;
                    }
                    body.put_u8(header);
                    body.put_slice(&pdv.data);
                }
                PDU_P_DATA_TF
            }
            Pdu::ReleaseRq => {
                body.put_u32(0);
                PDU_RELEASE_RQ
            }
            Pdu::ReleaseRp => {
                body.put_u32(0);
                PDU_RELEASE_RP
            }
            Pdu::Abort { source, reason } => {
                body.put_slice(&[0, 0, *source, *reason]);
                PDU_ABORT
            }
        };

        dst.reserve(PDU_HEADER_LEN + body.len());
        dst.put_u8(pdu_type);
        dst.put_u8(0);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

fn write_item(dst: &mut BytesMut, item_type: u8, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| PacsError::Protocol(format!("条目 0x{:02X} 过长", item_type)))?;
    dst.put_u8(item_type);
    dst.put_u8(0);
    dst.put_u16(len);
    dst.put_slice(value);
    Ok(())
}

fn write_ae_title(dst: &mut BytesMut, ae: &str) -> Result<()> {
    if ae.len() > AE_TITLE_LEN {
        return Err(PacsError::Protocol(format!("AE Title 过长: {}", ae)));
    }
    let mut field = [b' '; AE_TITLE_LEN];
    field[..ae.len()].copy_from_slice(ae.as_bytes());
    dst.put_slice(&field);
    Ok(())
}

fn write_associate_header(dst: &mut BytesMut, called: &str, calling: &str) -> Result<()> {
    dst.put_u16(1); // 协议版本
    dst.put_u16(0);
    write_ae_title(dst, called)?;
    write_ae_title(dst, calling)?;
    dst.put_slice(&[0u8; 32]);
    Ok(())
}

fn write_user_variables(dst: &mut BytesMut, user: &UserVariables) -> Result<()> {
    let mut sub = BytesMut::new();
    write_item(&mut sub, ITEM_MAX_LENGTH, &user.max_pdu_length.to_be_bytes())?;
    write_item(&mut sub, ITEM_IMPLEMENTATION_CLASS_UID, user.implementation_class_uid.as_bytes())?;
    if let Some(name) = &user.implementation_version_name {
        write_item(&mut sub, ITEM_IMPLEMENTATION_VERSION_NAME, name.as_bytes())?;
    }
    write_item(dst, ITEM_USER_INFORMATION, &sub)
}

fn take(buf: &mut Bytes, n: usize, what: &str) -> Result<Bytes> {
    if buf.remaining() < n {
        return Err(PacsError::Protocol(format!("{} 数据截断", what)));
    }
    Ok(buf.split_to(n))
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

/// 读取一个条目，返回 (类型, 值)
fn read_item(buf: &mut Bytes) -> Result<(u8, Bytes)> {
    let mut header = take(buf, 4, "条目头")?;
    let item_type = header.get_u8();
    header.advance(1);
    let len = header.get_u16() as usize;
    let value = take(buf, len, "条目")?;
    Ok((item_type, value))
}

struct AssociateBody {
    called: String,
    calling: String,
    application_context: String,
    proposed: Vec<PresentationContextProposed>,
    results: Vec<PresentationContextResult>,
    user: UserVariables,
}

fn decode_associate(mut body: Bytes) -> Result<AssociateBody> {
    let mut fixed = take(&mut body, 68, "关联请求头")?;
    fixed.advance(4); // 协议版本 + 保留
    let called = text(&fixed.split_to(AE_TITLE_LEN));
    let calling = text(&fixed.split_to(AE_TITLE_LEN));

    let mut out = AssociateBody {
        called,
        calling,
        application_context: String::new(),
        proposed: Vec::new(),
        results: Vec::new(),
        user: UserVariables {
            max_pdu_length: 0,
            implementation_class_uid: String::new(),
            implementation_version_name: None,
        },
    };

    while body.has_remaining() {
        let (item_type, mut value) = read_item(&mut body)?;
        match item_type {
            ITEM_APPLICATION_CONTEXT => out.application_context = text(&value),
            ITEM_PRESENTATION_CONTEXT_RQ => {
                let mut head = take(&mut value, 4, "表示上下文")?;
                let id = head.get_u8();
                let mut pc = PresentationContextProposed {
                    id,
                    abstract_syntax: String::new(),
                    transfer_syntaxes: Vec::new(),
                };
                while value.has_remaining() {
                    let (sub_type, sub) = read_item(&mut value)?;
                    match sub_type {
                        ITEM_ABSTRACT_SYNTAX => pc.abstract_syntax = text(&sub),
                        ITEM_TRANSFER_SYNTAX => pc.transfer_syntaxes.push(text(&sub)),
                        _ => {}
                    }
                }
                out.proposed.push(pc);
            }
            ITEM_PRESENTATION_CONTEXT_AC => {
                let mut head = take(&mut value, 4, "表示上下文")?;
                let id = head.get_u8();
                head.advance(1);
                let reason = PresentationContextResultReason::from_code(head.get_u8())?;
                let mut transfer_syntax = String::new();
                while value.has_remaining() {
                    let (sub_type, sub) = read_item(&mut value)?;
                    if sub_type == ITEM_TRANSFER_SYNTAX {
                        transfer_syntax = text(&sub);
                    }
                }
                out.results.push(PresentationContextResult { id, reason, transfer_syntax });
            }
            ITEM_USER_INFORMATION => {
                while value.has_remaining() {
                    let (sub_type, mut sub) = read_item(&mut value)?;
                    match sub_type {
                        ITEM_MAX_LENGTH => {
                            if sub.remaining() != 4 {
                                return Err(PacsError::Protocol("最大长度子项长度错误".to_string()));
                            }
                            out.user.max_pdu_length = sub.get_u32();
                        }
                        ITEM_IMPLEMENTATION_CLASS_UID => out.user.implementation_class_uid = text(&sub),
                        ITEM_IMPLEMENTATION_VERSION_NAME => {
                            out.user.implementation_version_name = Some(text(&sub))
                        }
                        // 其他扩展协商子项忽略
                        _ => {}
                    }
                }
            }
            other => {
                return Err(PacsError::Protocol(format!("未知的关联条目类型 0x{:02X}", other)));
            }
        }
    }

    Ok(out)
}

fn decode_body(pdu_type: u8, mut body: Bytes) -> Result<Pdu> {
    match pdu_type {
        PDU_ASSOCIATE_RQ => {
            let a = decode_associate(body)?;
            Ok(Pdu::AssociateRq(AssociateRq {
                called_ae_title: a.called,
                calling_ae_title: a.calling,
                application_context: a.application_context,
                presentation_contexts: a.proposed,
                user_variables: a.user,
            }))
        }
        PDU_ASSOCIATE_AC => {
            let a = decode_associate(body)?;
            Ok(Pdu::AssociateAc(AssociateAc {
                called_ae_title: a.called,
                calling_ae_title: a.calling,
                application_context: a.application_context,
                presentation_contexts: a.results,
                user_variables: a.user,
            }))
        }
        PDU_ASSOCIATE_RJ => {
            let mut b = take(&mut body, 4, "A-ASSOCIATE-RJ")?;
            b.advance(1);
            Ok(Pdu::AssociateRj {
                result: b.get_u8(),
                source: b.get_u8(),
                reason: b.get_u8(),
            })
        }
        PDU_P_DATA_TF => {
            let mut values = Vec::new();
            while body.has_remaining() {
                let len = take(&mut body, 4, "PDV长度")?.get_u32() as usize;
                if len < 2 {
                    return Err(PacsError::Protocol(format!("PDV长度非法: {}", len)));
                }
                let mut item = take(&mut body, len, "PDV")?;
                let presentation_context_id = item.get_u8();
                let header = item.get_u8();
                values.push(PDataValue {
                    presentation_context_id,
                    is_command: header & 0x01 != 0,
                    is_last: header & 0x02 != 0,
                    data: item,
                });
            }
            Ok(Pdu::PData(values))
        }
        PDU_RELEASE_RQ => Ok(Pdu::ReleaseRq),
        PDU_RELEASE_RP => Ok(Pdu::ReleaseRp),
        PDU_ABORT => {
            let mut b = take(&mut body, 4, "A-ABORT")?;
            b.advance(2);
            Ok(Pdu::Abort {
                source: b.get_u8(),
                reason: b.get_u8(),
            })
        }
        other => Err(PacsError::Protocol(format!("未知的PDU类型 0x{:02X}", other))),
    }
}
