//! DIMSE消息处理
//!
//! 命令集始终以隐式VR小端编码；数据集使用所在表示上下文协商的传输语法。

use crate::transfer_syntax::{self, uids};
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use pacs_core::{PacsError, Result};

/// 检索模型: Study Root Query/Retrieve - FIND
pub const STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
/// 检索模型: Study Root Query/Retrieve - MOVE
pub const STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
/// Verification SOP Class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// 数据集类型: 无数据集
const NO_DATA_SET: u16 = 0x0101;
const HAS_DATA_SET: u16 = 0x0000;

const PRIORITY_MEDIUM: u16 = 0x0000;

/// 命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    CStoreRq,
    CStoreRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    CCancelRq,
    Unknown(u16),
}

impl CommandType {
    pub fn from_field(field: u16) -> Self {
        match field {
            0x0001 => CommandType::CStoreRq,
            0x8001 => CommandType::CStoreRsp,
            0x0020 => CommandType::CFindRq,
            0x8020 => CommandType::CFindRsp,
            0x0021 => CommandType::CMoveRq,
            0x8021 => CommandType::CMoveRsp,
            0x0030 => CommandType::CEchoRq,
            0x8030 => CommandType::CEchoRsp,
            0x0FFF => CommandType::CCancelRq,
            other => CommandType::Unknown(other),
        }
    }

    pub fn field(self) -> u16 {
        match self {
            CommandType::CStoreRq => 0x0001,
            CommandType::CStoreRsp => 0x8001,
            CommandType::CFindRq => 0x0020,
            CommandType::CFindRsp => 0x8020,
            CommandType::CMoveRq => 0x0021,
            CommandType::CMoveRsp => 0x8021,
            CommandType::CEchoRq => 0x0030,
            CommandType::CEchoRsp => 0x8030,
            CommandType::CCancelRq => 0x0FFF,
            CommandType::Unknown(other) => other,
        }
    }
}

/// DIMSE状态分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Success,
    Pending,
    Cancel,
    Warning,
    Failure,
}

impl StatusKind {
    pub fn of(status: u16) -> Self {
        match status {
            0x0000 => StatusKind::Success,
            0xFF00 | 0xFF01 => StatusKind::Pending,
            0xFE00 => StatusKind::Cancel,
            0x0001 | 0x0107 | 0x0116 => StatusKind::Warning,
            s if s & 0xF000 == 0xB000 => StatusKind::Warning,
            _ => StatusKind::Failure,
        }
    }
}

/// 常用状态码
pub mod status {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0xFF00;
    /// 存储失败: 资源不足
    pub const OUT_OF_RESOURCES: u16 = 0xA700;
    /// 无法理解（无匹配的接收方）
    pub const CANNOT_UNDERSTAND: u16 = 0xC000;
    /// 子操作部分失败
    pub const SUB_OPERATIONS_WARNING: u16 = 0xB000;
}

/// C-MOVE 子操作计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubOperations {
    pub remaining: u16,
    pub completed: u16,
    pub failed: u16,
    pub warning: u16,
}

impl SubOperations {
    /// PACS 报告尝试发送的对象数
    pub fn attempted(&self) -> u32 {
        self.completed as u32 + self.failed as u32 + self.warning as u32
    }
}

/// 已解码的命令集
#[derive(Debug, Clone)]
pub struct CommandSet {
    obj: InMemDicomObject,
}

impl CommandSet {
    pub fn new(obj: InMemDicomObject) -> Self {
        Self { obj }
    }

    pub fn object(&self) -> &InMemDicomObject {
        &self.obj
    }

    fn u16_of(&self, tag: Tag) -> Option<u16> {
        self.obj.get(tag).and_then(|e| e.to_int::<u16>().ok())
    }

    fn str_of(&self, tag: Tag) -> Option<String> {
        self.obj
            .get(tag)
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim_end_matches(|c: char| c == '\0' || c == ' ').to_string())
    }

    /// 获取命令类型
    pub fn command_type(&self) -> CommandType {
        CommandType::from_field(self.u16_of(tags::COMMAND_FIELD).unwrap_or(0))
    }

    pub fn message_id(&self) -> u16 {
        self.u16_of(tags::MESSAGE_ID).unwrap_or(0)
    }

    pub fn message_id_responded_to(&self) -> u16 {
        self.u16_of(tags::MESSAGE_ID_BEING_RESPONDED_TO).unwrap_or(0)
    }

    pub fn has_dataset(&self) -> bool {
        self.u16_of(tags::COMMAND_DATA_SET_TYPE)
            .map(|t| t != NO_DATA_SET)
            .unwrap_or(false)
    }

    pub fn status(&self) -> Option<u16> {
        self.u16_of(tags::STATUS)
    }

    pub fn affected_sop_class_uid(&self) -> Option<String> {
        self.str_of(tags::AFFECTED_SOP_CLASS_UID)
    }

    pub fn affected_sop_instance_uid(&self) -> Option<String> {
        self.str_of(tags::AFFECTED_SOP_INSTANCE_UID)
    }

    pub fn move_destination(&self) -> Option<String> {
        self.str_of(tags::MOVE_DESTINATION)
    }

    pub fn error_comment(&self) -> Option<String> {
        self.str_of(tags::ERROR_COMMENT)
    }

    pub fn sub_operations(&self) -> SubOperations {
        SubOperations {
            remaining: self.u16_of(tags::NUMBER_OF_REMAINING_SUBOPERATIONS).unwrap_or(0),
            completed: self.u16_of(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS).unwrap_or(0),
            failed: self.u16_of(tags::NUMBER_OF_FAILED_SUBOPERATIONS).unwrap_or(0),
            warning: self.u16_of(tags::NUMBER_OF_WARNING_SUBOPERATIONS).unwrap_or(0),
        }
    }
}

fn us(tag: Tag, value: u16) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::US, dicom_value!(U16, [value]))
}

fn ui(tag: Tag, value: &str) -> DataElement<InMemDicomObject> {
    DataElement::new(tag, VR::UI, dicom_value!(Str, value))
}

fn dataset_type(has_dataset: bool) -> u16 {
    if has_dataset {
        HAS_DATA_SET
    } else {
        NO_DATA_SET
    }
}

pub fn c_echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, VERIFICATION),
        us(tags::COMMAND_FIELD, CommandType::CEchoRq.field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
    ])
}

pub fn c_echo_rsp(message_id: u16, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, VERIFICATION),
        us(tags::COMMAND_FIELD, CommandType::CEchoRsp.field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us(tags::STATUS, status),
    ])
}

pub fn c_find_rq(message_id: u16, sop_class_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandType::CFindRq.field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, HAS_DATA_SET),
    ])
}

pub fn c_find_rsp(message_id: u16, sop_class_uid: &str, status: u16, has_dataset: bool) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandType::CFindRsp.field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, dataset_type(has_dataset)),
        us(tags::STATUS, status),
    ])
}

pub fn c_move_rq(message_id: u16, sop_class_uid: &str, destination: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandType::CMoveRq.field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, HAS_DATA_SET),
        DataElement::new(tags::MOVE_DESTINATION, VR::AE, dicom_value!(Str, destination)),
    ])
}

pub fn c_move_rsp(message_id: u16, sop_class_uid: &str, status: u16, counts: SubOperations) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandType::CMoveRsp.field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us(tags::STATUS, status),
        us(tags::NUMBER_OF_REMAINING_SUBOPERATIONS, counts.remaining),
        us(tags::NUMBER_OF_COMPLETED_SUBOPERATIONS, counts.completed),
        us(tags::NUMBER_OF_FAILED_SUBOPERATIONS, counts.failed),
        us(tags::NUMBER_OF_WARNING_SUBOPERATIONS, counts.warning),
    ])
}

pub fn c_store_rq(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandType::CStoreRq.field()),
        us(tags::MESSAGE_ID, message_id),
        us(tags::PRIORITY, PRIORITY_MEDIUM),
        us(tags::COMMAND_DATA_SET_TYPE, HAS_DATA_SET),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

pub fn c_store_rsp(message_id: u16, sop_class_uid: &str, sop_instance_uid: &str, status: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        ui(tags::AFFECTED_SOP_CLASS_UID, sop_class_uid),
        us(tags::COMMAND_FIELD, CommandType::CStoreRsp.field()),
        us(tags::MESSAGE_ID_BEING_RESPONDED_TO, message_id),
        us(tags::COMMAND_DATA_SET_TYPE, NO_DATA_SET),
        us(tags::STATUS, status),
        ui(tags::AFFECTED_SOP_INSTANCE_UID, sop_instance_uid),
    ])
}

/// 编码命令集
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    encode_dataset(command, uids::IMPLICIT_VR_LITTLE_ENDIAN)
}

/// 解码命令集
pub fn decode_command(data: &[u8]) -> Result<CommandSet> {
    decode_dataset(data, uids::IMPLICIT_VR_LITTLE_ENDIAN).map(CommandSet::new)
}

/// 按指定传输语法编码数据集
pub fn encode_dataset(obj: &InMemDicomObject, ts_uid: &str) -> Result<Vec<u8>> {
    let ts = transfer_syntax::lookup(ts_uid)?;
    let mut buf = Vec::new();
    obj.write_dataset_with_ts(&mut buf, ts)
        .map_err(|e| PacsError::Dicom(format!("数据集编码失败: {}", e)))?;
    Ok(buf)
}

/// 按指定传输语法解码数据集
pub fn decode_dataset(data: &[u8], ts_uid: &str) -> Result<InMemDicomObject> {
    let ts = transfer_syntax::lookup(ts_uid)?;
    InMemDicomObject::read_dataset_with_ts(data, ts)
        .map_err(|e| PacsError::DicomParseError(format!("数据集解码失败: {}", e)))
}

/// 从数据集读取字符串值，去掉填充
pub fn element_str(obj: &InMemDicomObject, tag: Tag) -> Option<String> {
    obj.get(tag)
        .and_then(|e| e.to_str().ok())
        .map(|s| pacs_core::utils::trim_dicom_str(&s).to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip_keeps_fields() {
        let cmd = c_move_rq(7, STUDY_ROOT_MOVE, "WMX01");
        let bytes = encode_command(&cmd).unwrap();
        let decoded = decode_command(&bytes).unwrap();
        assert_eq!(decoded.command_type(), CommandType::CMoveRq);
        assert_eq!(decoded.message_id(), 7);
        assert!(decoded.has_dataset());
        assert_eq!(decoded.move_destination().as_deref(), Some("WMX01"));
        assert_eq!(decoded.affected_sop_class_uid().as_deref(), Some(STUDY_ROOT_MOVE));
    }

    #[test]
    fn test_group_length_is_written() {
        let cmd = c_echo_rq(1);
        let bytes = encode_command(&cmd).unwrap();
        // (0000,0000) UL 4
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 4, 0, 0, 0]);
        let declared = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        assert_eq!(declared, bytes.len() - 12);
    }

    #[test]
    fn test_move_response_counts() {
        let counts = SubOperations { remaining: 2, completed: 3, failed: 1, warning: 0 };
        let rsp = c_move_rsp(9, STUDY_ROOT_MOVE, status::PENDING, counts);
        let decoded = decode_command(&encode_command(&rsp).unwrap()).unwrap();
        assert_eq!(decoded.command_type(), CommandType::CMoveRsp);
        assert_eq!(decoded.message_id_responded_to(), 9);
        assert!(!decoded.has_dataset());
        assert_eq!(decoded.sub_operations(), counts);
        assert_eq!(decoded.sub_operations().attempted(), 4);
    }

    #[test]
    fn test_status_kinds() {
        assert_eq!(StatusKind::of(0x0000), StatusKind::Success);
        assert_eq!(StatusKind::of(0xFF00), StatusKind::Pending);
        assert_eq!(StatusKind::of(0xFF01), StatusKind::Pending);
        assert_eq!(StatusKind::of(0xFE00), StatusKind::Cancel);
        assert_eq!(StatusKind::of(0xB000), StatusKind::Warning);
        assert_eq!(StatusKind::of(0xA701), StatusKind::Failure);
        assert_eq!(StatusKind::of(0xC000), StatusKind::Failure);
    }

    #[test]
    fn test_identifier_in_explicit_vr() {
        let identifier = InMemDicomObject::from_element_iter([
            DataElement::new(tags::QUERY_RETRIEVE_LEVEL, VR::CS, dicom_value!(Str, "STUDY")),
            DataElement::new(tags::ACCESSION_NUMBER, VR::SH, dicom_value!(Str, "M25053000056")),
        ]);
        let bytes = encode_dataset(&identifier, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        let decoded = decode_dataset(&bytes, uids::EXPLICIT_VR_LITTLE_ENDIAN).unwrap();
        assert_eq!(element_str(&decoded, tags::ACCESSION_NUMBER).as_deref(), Some("M25053000056"));
        assert_eq!(element_str(&decoded, tags::QUERY_RETRIEVE_LEVEL).as_deref(), Some("STUDY"));
    }
}
