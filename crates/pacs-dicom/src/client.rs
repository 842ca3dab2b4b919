//! PACS 查询/检索客户端
//!
//! 每个操作都从端点存储中取得当前快照再建立关联。
//! 正常结束时释放关联，任何协议层错误都中止关联。

use crate::association::{Association, RequestOptions};
use crate::dimse::{self, element_str, StatusKind, SubOperations, STUDY_ROOT_FIND, STUDY_ROOT_MOVE, VERIFICATION};
use crate::transfer_syntax::QUERY_TRANSFER_SYNTAXES;
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use pacs_core::{EndpointStore, PacsError, Result, SeriesIdentity, VersionedEndpoint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// 网络参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkOptions {
    pub connect_timeout_secs: u64,
    pub acse_timeout_secs: u64,
    pub dimse_timeout_secs: u64,
    pub max_pdu_length: u32,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 300,
            acse_timeout_secs: 30,
            dimse_timeout_secs: 300,
            max_pdu_length: crate::pdu::DEFAULT_MAX_PDU_LENGTH,
        }
    }
}

impl NetworkOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn acse_timeout(&self) -> Duration {
        Duration::from_secs(self.acse_timeout_secs)
    }

    pub fn dimse_timeout(&self) -> Duration {
        Duration::from_secs(self.dimse_timeout_secs)
    }
}

/// 查询层级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLevel {
    Patient,
    Study,
    Series,
    Image,
}

impl QueryLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryLevel::Patient => "PATIENT",
            QueryLevel::Study => "STUDY",
            QueryLevel::Series => "SERIES",
            QueryLevel::Image => "IMAGE",
        }
    }
}

/// C-MOVE 结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome {
    pub status: u16,
    pub sub_operations: SubOperations,
}

/// 构造查询标识
pub fn query_identifier(level: QueryLevel, keys: &[(Tag, VR, &str)]) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, level.as_str()),
    ));
    for (tag, vr, value) in keys {
        let value = if value.is_empty() {
            PrimitiveValue::Empty
        } else {
            dicom_value!(Str, *value)
        };
        obj.put(DataElement::new(*tag, *vr, value));
    }
    obj
}

fn message_id_after(id: &mut u16) -> u16 {
    *id = id.wrapping_add(1).max(1);
    *id
}

/// 从一个 C-FIND 响应中取出匹配结果
///
/// 返回 `Ok(None)` 表示收到最终成功状态。
async fn next_find_match(
    assoc: &mut Association<TcpStream>,
    context_id: u8,
    ts_uid: &str,
) -> Result<Option<InMemDicomObject>> {
    loop {
        let msg = assoc
            .receive_message()
            .await?
            .ok_or_else(|| PacsError::Protocol("C-FIND 过程中对端释放关联".to_string()))?;
        if msg.presentation_context_id != context_id {
            return Err(PacsError::Protocol(format!(
                "C-FIND 响应的表示上下文 {} 与请求 {} 不符",
                msg.presentation_context_id, context_id
            )));
        }
        let status = msg
            .command
            .status()
            .ok_or_else(|| PacsError::Protocol("C-FIND 响应缺少状态".to_string()))?;
        match StatusKind::of(status) {
            StatusKind::Pending => match msg.data {
                Some(data) => return dimse::decode_dataset(&data, ts_uid).map(Some),
                // 没有标识的待定响应直接跳过
                None => continue,
            },
            StatusKind::Success => return Ok(None),
            StatusKind::Cancel => return Err(PacsError::Cancelled),
            StatusKind::Warning => {
                warn!("C-FIND 返回警告状态 0x{:04X}", status);
                return Ok(None);
            }
            StatusKind::Failure => {
                return Err(PacsError::DimseFailure {
                    status,
                    message: msg.command.error_comment().unwrap_or_else(|| "C-FIND 失败".to_string()),
                })
            }
        }
    }
}

/// C-FIND 的惰性结果序列
///
/// 有限且不可重启；读到最终状态后自动释放关联，出错时中止关联。
pub struct FindResponses {
    assoc: Option<Association<TcpStream>>,
    context_id: u8,
    transfer_syntax: String,
}

impl FindResponses {
    pub async fn next(&mut self) -> Result<Option<InMemDicomObject>> {
        let Some(assoc) = self.assoc.as_mut() else {
            return Ok(None);
        };
        match next_find_match(assoc, self.context_id, &self.transfer_syntax).await {
            Ok(Some(found)) => Ok(Some(found)),
            Ok(None) => {
                if let Some(assoc) = self.assoc.take() {
                    assoc.release().await?;
                }
                Ok(None)
            }
            Err(e) => {
                if let Some(assoc) = self.assoc.take() {
                    assoc.abort().await;
                }
                Err(e)
            }
        }
    }

    /// 读取全部剩余结果
    pub async fn collect_all(mut self) -> Result<Vec<InMemDicomObject>> {
        let mut out = Vec::new();
        while let Some(found) = self.next().await? {
            out.push(found);
        }
        Ok(out)
    }

    /// 提前结束，中止关联
    pub async fn close(mut self) {
        if let Some(assoc) = self.assoc.take() {
            assoc.abort().await;
        }
    }
}

/// PACS 客户端
#[derive(Clone)]
pub struct PacsClient {
    endpoints: EndpointStore,
    network: NetworkOptions,
}

impl PacsClient {
    pub fn new(endpoints: EndpointStore, network: NetworkOptions) -> Self {
        Self { endpoints, network }
    }

    pub fn endpoints(&self) -> &EndpointStore {
        &self.endpoints
    }

    pub fn network(&self) -> &NetworkOptions {
        &self.network
    }

    async fn connect(&self, abstract_syntaxes: &[&str]) -> Result<(Association<TcpStream>, Arc<VersionedEndpoint>)> {
        let snapshot = self.endpoints.snapshot();
        let endpoint = &snapshot.endpoint;
        let address = endpoint.address();
        debug!("连接PACS {} (配置版本 {})", address, snapshot.version);

        let stream = match tokio::time::timeout(self.network.connect_timeout(), TcpStream::connect(&address)).await {
            Ok(stream) => stream.map_err(PacsError::Network)?,
            Err(_) => {
                return Err(PacsError::Timeout(format!(
                    "连接 {} 超过 {} 秒",
                    address, self.network.connect_timeout_secs
                )))
            }
        };

        let options = RequestOptions {
            calling_ae_title: endpoint.calling_aet.clone(),
            called_ae_title: endpoint.called_aet.clone(),
            abstract_syntaxes: abstract_syntaxes.iter().map(|s| s.to_string()).collect(),
            transfer_syntaxes: QUERY_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()).collect(),
            max_pdu_length: self.network.max_pdu_length,
            acse_timeout: self.network.acse_timeout(),
            dimse_timeout: self.network.dimse_timeout(),
        };
        let assoc = Association::request(stream, &options).await?;
        Ok((assoc, snapshot))
    }

    /// C-ECHO 连通性验证
    pub async fn c_echo(&self) -> Result<()> {
        let (mut assoc, snapshot) = self.connect(&[VERIFICATION]).await?;
        let outcome = async {
            let ctx = assoc.context_for(VERIFICATION)?.id;
            assoc.send_message(ctx, &dimse::c_echo_rq(1), None).await?;
            let msg = assoc
                .receive_message()
                .await?
                .ok_or_else(|| PacsError::Protocol("C-ECHO 过程中对端释放关联".to_string()))?;
            match msg.command.status() {
                Some(0) => Ok(()),
                Some(status) => Err(PacsError::DimseFailure {
                    status,
                    message: "C-ECHO 失败".to_string(),
                }),
                None => Err(PacsError::Protocol("C-ECHO 响应缺少状态".to_string())),
            }
        }
        .await;

        match outcome {
            Ok(()) => {
                assoc.release().await?;
                info!("C-ECHO 成功: {}", snapshot.endpoint.address());
                Ok(())
            }
            Err(e) => {
                assoc.abort().await;
                Err(e)
            }
        }
    }

    /// 发起 C-FIND，返回惰性结果序列
    pub async fn c_find(&self, identifier: &InMemDicomObject) -> Result<FindResponses> {
        let (mut assoc, _) = self.connect(&[STUDY_ROOT_FIND]).await?;
        let sent = async {
            let ctx = assoc.context_for(STUDY_ROOT_FIND)?.clone();
            let data = dimse::encode_dataset(identifier, &ctx.transfer_syntax)?;
            assoc.send_message(ctx.id, &dimse::c_find_rq(1, STUDY_ROOT_FIND), Some(&data)).await?;
            Ok::<_, PacsError>(ctx)
        }
        .await;

        match sent {
            Ok(ctx) => Ok(FindResponses {
                assoc: Some(assoc),
                context_id: ctx.id,
                transfer_syntax: ctx.transfer_syntax,
            }),
            Err(e) => {
                assoc.abort().await;
                Err(e)
            }
        }
    }

    /// 按检查号查询全部序列
    ///
    /// 先以 STUDY 级查询得到检查UID，再在同一关联上逐个检查做 SERIES 级查询。
    pub async fn find_series(&self, accession_number: &str) -> Result<Vec<SeriesIdentity>> {
        let (mut assoc, _) = self.connect(&[STUDY_ROOT_FIND]).await?;
        let outcome = Self::find_series_on(&mut assoc, accession_number).await;
        match outcome {
            Ok(series) => {
                assoc.release().await?;
                Ok(series)
            }
            Err(e) => {
                assoc.abort().await;
                Err(e)
            }
        }
    }

    async fn find_all_on(
        assoc: &mut Association<TcpStream>,
        message_id: u16,
        identifier: &InMemDicomObject,
    ) -> Result<Vec<InMemDicomObject>> {
        let ctx = assoc.context_for(STUDY_ROOT_FIND)?.clone();
        let data = dimse::encode_dataset(identifier, &ctx.transfer_syntax)?;
        assoc
            .send_message(ctx.id, &dimse::c_find_rq(message_id, STUDY_ROOT_FIND), Some(&data))
            .await?;
        let mut out = Vec::new();
        while let Some(found) = next_find_match(assoc, ctx.id, &ctx.transfer_syntax).await? {
            out.push(found);
        }
        Ok(out)
    }

    async fn find_series_on(assoc: &mut Association<TcpStream>, accession_number: &str) -> Result<Vec<SeriesIdentity>> {
        let mut message_id = 0u16;
        let study_query = query_identifier(
            QueryLevel::Study,
            &[
                (tags::ACCESSION_NUMBER, VR::SH, accession_number),
                (tags::STUDY_INSTANCE_UID, VR::UI, ""),
            ],
        );
        let studies = Self::find_all_on(assoc, message_id_after(&mut message_id), &study_query).await?;

        let mut study_uids: Vec<String> = Vec::new();
        for study in &studies {
            if let Some(uid) = element_str(study, tags::STUDY_INSTANCE_UID) {
                if !study_uids.contains(&uid) {
                    study_uids.push(uid);
                }
            }
        }
        debug!("检查号 {} 对应 {} 个检查", accession_number, study_uids.len());

        let mut series = Vec::new();
        for study_uid in &study_uids {
            let series_query = query_identifier(
                QueryLevel::Series,
                &[
                    (tags::STUDY_INSTANCE_UID, VR::UI, study_uid.as_str()),
                    (tags::SERIES_INSTANCE_UID, VR::UI, ""),
                    (tags::SERIES_NUMBER, VR::IS, ""),
                    (tags::SERIES_DESCRIPTION, VR::LO, ""),
                    (tags::MODALITY, VR::CS, ""),
                    (tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, ""),
                ],
            );
            for found in Self::find_all_on(assoc, message_id_after(&mut message_id), &series_query).await? {
                let Some(series_uid) = element_str(&found, tags::SERIES_INSTANCE_UID) else {
                    warn!("检查 {} 的序列查询结果缺少 SeriesInstanceUID，已忽略", study_uid);
                    continue;
                };
                series.push(SeriesIdentity {
                    study_uid: study_uid.clone(),
                    series_uid,
                    series_number: element_str(&found, tags::SERIES_NUMBER).and_then(|s| s.parse().ok()),
                    series_description: element_str(&found, tags::SERIES_DESCRIPTION),
                    modality: element_str(&found, tags::MODALITY),
                    instance_count: element_str(&found, tags::NUMBER_OF_SERIES_RELATED_INSTANCES)
                        .and_then(|s| s.parse().ok()),
                });
            }
        }
        Ok(series)
    }

    /// SERIES 级 C-MOVE，目标为本端 Calling AE
    ///
    /// `on_pending` 在每个待定响应到达时被调用。
    pub async fn move_series<F>(&self, study_uid: &str, series_uid: &str, mut on_pending: F) -> Result<MoveOutcome>
    where
        F: FnMut(&SubOperations),
    {
        let (mut assoc, snapshot) = self.connect(&[STUDY_ROOT_MOVE]).await?;
        let destination = snapshot.endpoint.calling_aet.clone();
        let identifier = query_identifier(
            QueryLevel::Series,
            &[
                (tags::STUDY_INSTANCE_UID, VR::UI, study_uid),
                (tags::SERIES_INSTANCE_UID, VR::UI, series_uid),
            ],
        );

        let outcome = async {
            let ctx = assoc.context_for(STUDY_ROOT_MOVE)?.clone();
            let data = dimse::encode_dataset(&identifier, &ctx.transfer_syntax)?;
            assoc
                .send_message(ctx.id, &dimse::c_move_rq(1, STUDY_ROOT_MOVE, &destination), Some(&data))
                .await?;

            loop {
                let msg = assoc
                    .receive_message()
                    .await?
                    .ok_or_else(|| PacsError::Protocol("C-MOVE 过程中对端释放关联".to_string()))?;
                let status = msg
                    .command
                    .status()
                    .ok_or_else(|| PacsError::Protocol("C-MOVE 响应缺少状态".to_string()))?;
                let counts = msg.command.sub_operations();
                match StatusKind::of(status) {
                    StatusKind::Pending => on_pending(&counts),
                    StatusKind::Success | StatusKind::Warning => {
                        return Ok(MoveOutcome {
                            status,
                            sub_operations: counts,
                        })
                    }
                    StatusKind::Cancel => return Err(PacsError::Cancelled),
                    StatusKind::Failure => {
                        return Err(PacsError::DimseFailure {
                            status,
                            message: msg.command.error_comment().unwrap_or_else(|| "C-MOVE 失败".to_string()),
                        })
                    }
                }
            }
        }
        .await;

        match outcome {
            Ok(result) => {
                assoc.release().await?;
                Ok(result)
            }
            Err(e) => {
                assoc.abort().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    //! 基于本 crate 编解码器的假 PACS
    use super::*;
    use crate::association::{AcceptOptions, DimseMessage};
    use crate::dimse::{status, CommandType};
    use crate::transfer_syntax::STORAGE_TRANSFER_SYNTAXES;
    use pacs_core::PacsEndpoint;
    use tokio::net::TcpListener;

    /// 假 PACS 中的一个序列
    #[derive(Clone)]
    pub(crate) struct FakeSeries {
        pub study_uid: String,
        pub series_uid: String,
        pub series_number: i32,
        pub description: String,
        pub modality: String,
        pub instances: Vec<InMemDicomObject>,
    }

    /// 假 PACS 行为
    #[derive(Clone)]
    pub(crate) struct FakePacs {
        pub accession: String,
        pub series: Vec<FakeSeries>,
        /// 声称但不会发送的序列UID
        pub withhold: Vec<String>,
        pub move_failure: Option<u16>,
        pub store_port: Option<u16>,
        pub store_ae: String,
    }

    pub(crate) async fn spawn_fake_pacs(fake: FakePacs) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let fake = fake.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, fake).await;
                });
            }
        });
        port
    }

    fn accept_options() -> AcceptOptions {
        AcceptOptions {
            ae_title: "pacsFIR".to_string(),
            transfer_syntaxes: QUERY_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()).collect(),
            max_pdu_length: 16384,
            acse_timeout: Duration::from_secs(5),
            dimse_timeout: Duration::from_secs(5),
        }
    }

    async fn serve(stream: TcpStream, fake: FakePacs) -> Result<()> {
        let mut assoc = Association::accept(stream, &accept_options()).await?;
        while let Some(msg) = assoc.receive_message().await? {
            let ctx = assoc.context_by_id(msg.presentation_context_id)?.clone();
            match msg.command.command_type() {
                CommandType::CEchoRq => {
                    assoc
                        .send_message(ctx.id, &dimse::c_echo_rsp(msg.command.message_id(), 0), None)
                        .await?;
                }
                CommandType::CFindRq => handle_find(&mut assoc, &fake, &msg, &ctx.transfer_syntax).await?,
                CommandType::CMoveRq => handle_move(&mut assoc, &fake, &msg, &ctx.transfer_syntax).await?,
                _ => return Err(PacsError::Protocol("unexpected".into())),
            }
        }
        Ok(())
    }

    async fn handle_find(
        assoc: &mut Association<TcpStream>,
        fake: &FakePacs,
        msg: &DimseMessage,
        ts: &str,
    ) -> Result<()> {
        let id = msg.command.message_id();
        let query = dimse::decode_dataset(msg.data.as_deref().unwrap_or_default(), ts)?;
        let level = element_str(&query, tags::QUERY_RETRIEVE_LEVEL).unwrap_or_default();
        let mut matches = Vec::new();
        if level == "STUDY" {
            if element_str(&query, tags::ACCESSION_NUMBER).as_deref() == Some(fake.accession.as_str()) {
                let mut studies: Vec<&str> = fake.series.iter().map(|s| s.study_uid.as_str()).collect();
                studies.dedup();
                for uid in studies {
                    matches.push(query_identifier(QueryLevel::Study, &[(tags::STUDY_INSTANCE_UID, VR::UI, uid)]));
                }
            }
        } else {
            let study = element_str(&query, tags::STUDY_INSTANCE_UID).unwrap_or_default();
            for s in fake.series.iter().filter(|s| s.study_uid == study) {
                let number = s.series_number.to_string();
                let count = s.instances.len().to_string();
                matches.push(query_identifier(
                    QueryLevel::Series,
                    &[
                        (tags::SERIES_INSTANCE_UID, VR::UI, s.series_uid.as_str()),
                        (tags::SERIES_NUMBER, VR::IS, number.as_str()),
                        (tags::SERIES_DESCRIPTION, VR::LO, s.description.as_str()),
                        (tags::MODALITY, VR::CS, s.modality.as_str()),
                        (tags::NUMBER_OF_SERIES_RELATED_INSTANCES, VR::IS, count.as_str()),
                    ],
                ));
            }
        }
        for (i, m) in matches.iter().enumerate() {
            // 交替使用两种待定状态
            let pending = if i % 2 == 0 { 0xFF00 } else { 0xFF01 };
            let data = dimse::encode_dataset(m, ts)?;
            assoc
                .send_message(
                    msg.presentation_context_id,
                    &dimse::c_find_rsp(id, STUDY_ROOT_FIND, pending, true),
                    Some(&data),
                )
                .await?;
        }
        assoc
            .send_message(
                msg.presentation_context_id,
                &dimse::c_find_rsp(id, STUDY_ROOT_FIND, status::SUCCESS, false),
                None,
            )
            .await
    }

    async fn handle_move(
        assoc: &mut Association<TcpStream>,
        fake: &FakePacs,
        msg: &DimseMessage,
        ts: &str,
    ) -> Result<()> {
        let id = msg.command.message_id();
        if let Some(failure) = fake.move_failure {
            return assoc
                .send_message(
                    msg.presentation_context_id,
                    &dimse::c_move_rsp(id, STUDY_ROOT_MOVE, failure, SubOperations::default()),
                    None,
                )
                .await;
        }
        let query = dimse::decode_dataset(msg.data.as_deref().unwrap_or_default(), ts)?;
        let series_uid = element_str(&query, tags::SERIES_INSTANCE_UID).unwrap_or_default();
        let Some(series) = fake.series.iter().find(|s| s.series_uid == series_uid) else {
            return assoc
                .send_message(
                    msg.presentation_context_id,
                    &dimse::c_move_rsp(id, STUDY_ROOT_MOVE, status::SUCCESS, SubOperations::default()),
                    None,
                )
                .await;
        };

        let mut counts = SubOperations {
            remaining: series.instances.len() as u16,
            ..SubOperations::default()
        };
        if !fake.withhold.contains(&series_uid) {
            if let Some(port) = fake.store_port {
                for instance in &series.instances {
                    let ok = store_one(port, &fake.store_ae, instance).await.is_ok();
                    counts.remaining -= 1;
                    if ok {
                        counts.completed += 1;
                    } else {
                        counts.failed += 1;
                    }
                    assoc
                        .send_message(
                            msg.presentation_context_id,
                            &dimse::c_move_rsp(id, STUDY_ROOT_MOVE, status::PENDING, counts),
                            None,
                        )
                        .await?;
                }
            }
        } else {
            counts.completed = counts.remaining;
            counts.remaining = 0;
        }
        assoc
            .send_message(
                msg.presentation_context_id,
                &dimse::c_move_rsp(id, STUDY_ROOT_MOVE, status::SUCCESS, counts),
                None,
            )
            .await
    }

    /// 以 C-STORE SCU 身份推送一个对象
    pub(crate) async fn store_one(port: u16, called_ae: &str, instance: &InMemDicomObject) -> Result<u16> {
        let sop_class = element_str(instance, tags::SOP_CLASS_UID).unwrap_or_default();
        let sop_instance = element_str(instance, tags::SOP_INSTANCE_UID).unwrap_or_default();
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let options = RequestOptions {
            calling_ae_title: "pacsFIR".to_string(),
            called_ae_title: called_ae.to_string(),
            abstract_syntaxes: vec![sop_class.clone()],
            transfer_syntaxes: STORAGE_TRANSFER_SYNTAXES[..2].iter().map(|s| s.to_string()).collect(),
            max_pdu_length: 16384,
            acse_timeout: Duration::from_secs(5),
            dimse_timeout: Duration::from_secs(5),
        };
        let mut assoc = Association::request(stream, &options).await?;
        let ctx = assoc.context_for(&sop_class)?.clone();
        let data = dimse::encode_dataset(instance, &ctx.transfer_syntax)?;
        assoc
            .send_message(ctx.id, &dimse::c_store_rq(1, &sop_class, &sop_instance), Some(&data))
            .await?;
        let rsp = assoc
            .receive_message()
            .await?
            .ok_or_else(|| PacsError::Protocol("no response".into()))?;
        assoc.release().await?;
        let status = rsp.command.status().unwrap_or(0xFFFF);
        if status == 0 {
            Ok(status)
        } else {
            Err(PacsError::DimseFailure { status, message: String::new() })
        }
    }

    pub(crate) fn instance(study: &str, series: &str, sop: &str, number: i32, description: &str) -> InMemDicomObject {
        let n = number.to_string();
        let mut obj = InMemDicomObject::new_empty();
        for (tag, vr, value) in [
            (tags::SOP_CLASS_UID, VR::UI, "1.2.840.10008.5.1.4.1.1.4"),
            (tags::SOP_INSTANCE_UID, VR::UI, sop),
            (tags::STUDY_INSTANCE_UID, VR::UI, study),
            (tags::SERIES_INSTANCE_UID, VR::UI, series),
            (tags::SERIES_NUMBER, VR::IS, n.as_str()),
            (tags::SERIES_DESCRIPTION, VR::LO, description),
            (tags::MODALITY, VR::CS, "MR"),
            (tags::ACCESSION_NUMBER, VR::SH, "M25053000056"),
        ] {
            obj.put(DataElement::new(tag, vr, dicom_value!(Str, value)));
        }
        obj
    }

    pub(crate) fn endpoint_store(pacs_port: u16, calling_port: u16) -> EndpointStore {
        EndpointStore::new(PacsEndpoint {
            pacs_ip: "127.0.0.1".to_string(),
            pacs_port,
            calling_aet: "WMX01".to_string(),
            called_aet: "pacsFIR".to_string(),
            calling_port,
        })
        .unwrap()
    }

    pub(crate) fn fast_network() -> NetworkOptions {
        NetworkOptions {
            connect_timeout_secs: 5,
            acse_timeout_secs: 5,
            dimse_timeout_secs: 5,
            max_pdu_length: 16384,
        }
    }

    fn two_series() -> FakePacs {
        FakePacs {
            accession: "M25053000056".to_string(),
            series: vec![
                FakeSeries {
                    study_uid: "1.2.3".into(),
                    series_uid: "1.2.3.1".into(),
                    series_number: 1,
                    description: "t2 tse tra".into(),
                    modality: "MR".into(),
                    instances: vec![],
                },
                FakeSeries {
                    study_uid: "1.2.3".into(),
                    series_uid: "1.2.3.2".into(),
                    series_number: 2,
                    description: "t1 se sag".into(),
                    modality: "MR".into(),
                    instances: vec![],
                },
            ],
            withhold: vec![],
            move_failure: None,
            store_port: None,
            store_ae: "WMX01".to_string(),
        }
    }

    #[tokio::test]
    async fn test_c_echo() {
        let port = spawn_fake_pacs(two_series()).await;
        let client = PacsClient::new(endpoint_store(port, 1103), fast_network());
        client.c_echo().await.unwrap();
    }

    #[tokio::test]
    async fn test_find_series_reads_all_pending_responses() {
        let port = spawn_fake_pacs(two_series()).await;
        let client = PacsClient::new(endpoint_store(port, 1103), fast_network());
        let series = client.find_series("M25053000056").await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].series_uid, "1.2.3.1");
        assert_eq!(series[0].series_number, Some(1));
        assert_eq!(series[1].series_description.as_deref(), Some("t1 se sag"));
        assert_eq!(series[1].instance_count, Some(0));
    }

    #[tokio::test]
    async fn test_lazy_find_responses() {
        let port = spawn_fake_pacs(two_series()).await;
        let client = PacsClient::new(endpoint_store(port, 1103), fast_network());
        let identifier = query_identifier(
            QueryLevel::Study,
            &[
                (tags::ACCESSION_NUMBER, VR::SH, "M25053000056"),
                (tags::STUDY_INSTANCE_UID, VR::UI, ""),
            ],
        );
        let mut responses = client.c_find(&identifier).await.unwrap();
        let first = responses.next().await.unwrap().unwrap();
        assert_eq!(element_str(&first, tags::STUDY_INSTANCE_UID).as_deref(), Some("1.2.3"));
        assert!(responses.next().await.unwrap().is_none());
        // 结束后继续读取仍返回 None
        assert!(responses.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_accession_yields_no_series() {
        let port = spawn_fake_pacs(two_series()).await;
        let client = PacsClient::new(endpoint_store(port, 1103), fast_network());
        assert!(client.find_series("NOPE").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_move_failure_status() {
        let mut fake = two_series();
        fake.move_failure = Some(0xA702);
        let port = spawn_fake_pacs(fake).await;
        let client = PacsClient::new(endpoint_store(port, 1103), fast_network());
        let err = client.move_series("1.2.3", "1.2.3.1", |_| {}).await.unwrap_err();
        assert!(matches!(err, PacsError::DimseFailure { status: 0xA702, .. }));
    }

    #[tokio::test]
    async fn test_wrong_called_ae_is_rejected() {
        let port = spawn_fake_pacs(two_series()).await;
        let store = endpoint_store(port, 1103);
        let mut endpoint = store.snapshot().endpoint.clone();
        endpoint.called_aet = "OTHERPACS".to_string();
        store.update(endpoint).unwrap();
        let client = PacsClient::new(store, fast_network());
        let err = client.c_echo().await.unwrap_err();
        assert!(matches!(err, PacsError::AssociationRejected { reason: 7, .. }));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let client = PacsClient::new(endpoint_store(port, 1103), fast_network());
        assert!(matches!(client.c_echo().await, Err(PacsError::Network(_))));
    }
}
