//! DICOM关联管理
//!
//! `Association` 包装一条已协商的连接，负责 DIMSE 消息的分片发送与重组。
//! 端点参数在建立关联时以快照形式捕获，之后的配置变更不影响该关联。

use crate::dimse::{self, CommandSet};
use crate::pdu::{
    AssociateAc, AssociateRq, PDataValue, Pdu, PduCodec, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserVariables, APPLICATION_CONTEXT_NAME,
};
use crate::transfer_syntax;
use bytes::Bytes;
use dicom_object::InMemDicomObject;
use futures::{SinkExt, StreamExt};
use pacs_core::utils::{IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use pacs_core::{PacsError, Result};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// 关联状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationState {
    Idle,
    Negotiating,
    Established,
    Releasing,
    Closed,
    Aborted,
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssociationState::Idle => "idle",
            AssociationState::Negotiating => "negotiating",
            AssociationState::Established => "established",
            AssociationState::Releasing => "releasing",
            AssociationState::Closed => "closed",
            AssociationState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// 已接受的表示上下文
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationContext {
    pub id: u8,
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// 作为请求方建立关联的参数
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub abstract_syntaxes: Vec<String>,
    pub transfer_syntaxes: Vec<String>,
    pub max_pdu_length: u32,
    pub acse_timeout: Duration,
    pub dimse_timeout: Duration,
}

/// 作为接受方响应关联的参数
#[derive(Debug, Clone)]
pub struct AcceptOptions {
    pub ae_title: String,
    pub transfer_syntaxes: Vec<String>,
    pub max_pdu_length: u32,
    pub acse_timeout: Duration,
    pub dimse_timeout: Duration,
}

/// 一条完整的 DIMSE 消息
#[derive(Debug, Clone)]
pub struct DimseMessage {
    pub presentation_context_id: u8,
    pub command: CommandSet,
    pub data: Option<Vec<u8>>,
}

/// DICOM关联
pub struct Association<S> {
    framed: Framed<S, PduCodec>,
    state: AssociationState,
    calling_ae_title: String,
    called_ae_title: String,
    peer_max_pdu_length: u32,
    presentation_contexts: Vec<PresentationContext>,
    acse_timeout: Duration,
    dimse_timeout: Duration,
}

impl<S> fmt::Debug for Association<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("state", &self.state)
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("peer_max_pdu_length", &self.peer_max_pdu_length)
            .field("presentation_contexts", &self.presentation_contexts)
            .finish()
    }
}

async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(PacsError::into_network),
        Err(_) => Err(PacsError::Timeout(format!("{} 超过 {:?}", what, limit))),
    }
}

impl<S> Association<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// 作为请求方发起关联
    pub async fn request(stream: S, options: &RequestOptions) -> Result<Self> {
        let mut framed = Framed::new(stream, PduCodec::new(options.max_pdu_length));

        let proposed: Vec<PresentationContextProposed> = options
            .abstract_syntaxes
            .iter()
            .enumerate()
            .map(|(i, abstract_syntax)| PresentationContextProposed {
                id: (i * 2 + 1) as u8,
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntaxes: options.transfer_syntaxes.clone(),
            })
            .collect();

        let rq = AssociateRq {
            called_ae_title: options.called_ae_title.clone(),
            calling_ae_title: options.calling_ae_title.clone(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: proposed.clone(),
            user_variables: local_user_variables(options.max_pdu_length),
        };

        debug!("发送关联请求: {} -> {}", options.calling_ae_title, options.called_ae_title);
        framed.send(Pdu::AssociateRq(rq)).await.map_err(PacsError::into_network)?;

        let reply = with_timeout(options.acse_timeout, "等待关联响应", async {
            framed
                .next()
                .await
                .unwrap_or_else(|| Err(PacsError::Protocol("对端在关联协商时关闭连接".to_string())))
        })
        .await?;

        match reply {
            Pdu::AssociateAc(ac) => {
                let contexts = accepted_contexts(&proposed, &ac.presentation_contexts);
                if contexts.is_empty() {
                    let mut assoc = Self::from_parts(framed, options.acse_timeout, options.dimse_timeout);
                    assoc.state = AssociationState::Negotiating;
                    assoc.abort().await;
                    return Err(PacsError::Protocol("对端未接受任何表示上下文".to_string()));
                }

                info!(
                    "建立DICOM关联: {} -> {}, 上下文 {} 个, 对端最大PDU {}",
                    options.calling_ae_title,
                    options.called_ae_title,
                    contexts.len(),
                    ac.user_variables.max_pdu_length
                );
                let mut assoc = Self::from_parts(framed, options.acse_timeout, options.dimse_timeout);
                assoc.state = AssociationState::Established;
                assoc.calling_ae_title = options.calling_ae_title.clone();
                assoc.called_ae_title = options.called_ae_title.clone();
                assoc.peer_max_pdu_length = ac.user_variables.max_pdu_length;
                assoc.presentation_contexts = contexts;
                Ok(assoc)
            }
            Pdu::AssociateRj { result, source, reason } => {
                warn!("关联被拒绝: result={}, source={}, reason={}", result, source, reason);
                Err(PacsError::AssociationRejected {
                    result,
                    source_code: source,
                    reason,
                })
            }
            Pdu::Abort { source, reason } => Err(PacsError::Protocol(format!(
                "关联协商时被中止: source={}, reason={}",
                source, reason
            ))),
            other => {
                let mut assoc = Self::from_parts(framed, options.acse_timeout, options.dimse_timeout);
                assoc.state = AssociationState::Negotiating;
                assoc.abort().await;
                Err(PacsError::Protocol(format!("关联协商时收到意外的 {}", other.name())))
            }
        }
    }

    /// 作为接受方响应关联
    ///
    /// Called AE 不匹配时返回 A-ASSOCIATE-RJ (1/1/7)。
    /// 任意抽象语法都会被接受，传输语法按提议顺序选择第一个本端支持的。
    pub async fn accept(stream: S, options: &AcceptOptions) -> Result<Self> {
        let mut framed = Framed::new(stream, PduCodec::new(options.max_pdu_length));

        let first = with_timeout(options.acse_timeout, "等待关联请求", async {
            framed
                .next()
                .await
                .unwrap_or_else(|| Err(PacsError::Protocol("连接在关联请求前关闭".to_string())))
        })
        .await?;

        let rq = match first {
            Pdu::AssociateRq(rq) => rq,
            other => {
                return Err(PacsError::Protocol(format!("期望 A-ASSOCIATE-RQ，收到 {}", other.name())));
            }
        };

        if rq.called_ae_title != options.ae_title {
            warn!(
                "拒绝关联: Called AE {} 与本端 {} 不符 (Calling AE {})",
                rq.called_ae_title, options.ae_title, rq.calling_ae_title
            );
            framed
                .send(Pdu::AssociateRj { result: 1, source: 1, reason: 7 })
                .await
                .map_err(PacsError::into_network)?;
            return Err(PacsError::AssociationRejected {
                result: 1,
                source_code: 1,
                reason: 7,
            });
        }

        let supported: Vec<&str> = options.transfer_syntaxes.iter().map(String::as_str).collect();
        let mut results = Vec::with_capacity(rq.presentation_contexts.len());
        let mut contexts = Vec::new();
        for pc in &rq.presentation_contexts {
            match transfer_syntax::negotiate(&pc.transfer_syntaxes, &supported) {
                Some(ts) => {
                    results.push(PresentationContextResult {
                        id: pc.id,
                        reason: PresentationContextResultReason::Acceptance,
                        transfer_syntax: ts.to_string(),
                    });
                    contexts.push(PresentationContext {
                        id: pc.id,
                        abstract_syntax: pc.abstract_syntax.clone(),
                        transfer_syntax: ts.to_string(),
                    });
                }
                None => results.push(PresentationContextResult {
                    id: pc.id,
                    reason: PresentationContextResultReason::TransferSyntaxesNotSupported,
                    transfer_syntax: pc.transfer_syntaxes.first().cloned().unwrap_or_default(),
                }),
            }
        }

        let ac = AssociateAc {
            called_ae_title: rq.called_ae_title.clone(),
            calling_ae_title: rq.calling_ae_title.clone(),
            application_context: APPLICATION_CONTEXT_NAME.to_string(),
            presentation_contexts: results,
            user_variables: local_user_variables(options.max_pdu_length),
        };
        framed.send(Pdu::AssociateAc(ac)).await.map_err(PacsError::into_network)?;

        debug!(
            "接受关联: {} -> {}, 上下文 {} 个",
            rq.calling_ae_title,
            rq.called_ae_title,
            contexts.len()
        );

        let mut assoc = Self::from_parts(framed, options.acse_timeout, options.dimse_timeout);
        assoc.state = AssociationState::Established;
        assoc.calling_ae_title = rq.calling_ae_title;
        assoc.called_ae_title = rq.called_ae_title;
        assoc.peer_max_pdu_length = rq.user_variables.max_pdu_length;
        assoc.presentation_contexts = contexts;
        Ok(assoc)
    }

    fn from_parts(framed: Framed<S, PduCodec>, acse_timeout: Duration, dimse_timeout: Duration) -> Self {
        Self {
            framed,
            state: AssociationState::Idle,
            calling_ae_title: String::new(),
            called_ae_title: String::new(),
            peer_max_pdu_length: 0,
            presentation_contexts: Vec::new(),
            acse_timeout,
            dimse_timeout,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn calling_ae_title(&self) -> &str {
        &self.calling_ae_title
    }

    pub fn called_ae_title(&self) -> &str {
        &self.called_ae_title
    }

    pub fn presentation_contexts(&self) -> &[PresentationContext] {
        &self.presentation_contexts
    }

    /// 查找指定抽象语法已接受的表示上下文
    pub fn context_for(&self, abstract_syntax: &str) -> Result<&PresentationContext> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.abstract_syntax == abstract_syntax)
            .ok_or_else(|| PacsError::Protocol(format!("对端未接受抽象语法 {}", abstract_syntax)))
    }

    pub fn context_by_id(&self, id: u8) -> Result<&PresentationContext> {
        self.presentation_contexts
            .iter()
            .find(|pc| pc.id == id)
            .ok_or_else(|| PacsError::Protocol(format!("未协商的表示上下文 {}", id)))
    }

    fn ensure_established(&self) -> Result<()> {
        if self.state != AssociationState::Established {
            return Err(PacsError::Protocol(format!("关联状态为 {}，无法传输数据", self.state)));
        }
        Ok(())
    }

    /// 单个 PDV 可承载的最大数据长度
    fn max_fragment_len(&self) -> usize {
        match self.peer_max_pdu_length {
            // PDV 头 6 字节
            n if n > 6 => (n - 6) as usize,
            _ => usize::MAX,
        }
    }

    async fn send_fragments(&mut self, context_id: u8, data: &[u8], is_command: bool) -> Result<()> {
        let max = self.max_fragment_len();
        let mut chunks = data.chunks(max).peekable();
        if chunks.peek().is_none() {
            let pdv = PDataValue {
                presentation_context_id: context_id,
                is_command,
                is_last: true,
                data: Bytes::new(),
            };
            return self.framed.send(Pdu::PData(vec![pdv])).await.map_err(PacsError::into_network);
        }
        while let Some(chunk) = chunks.next() {
            let pdv = PDataValue {
                presentation_context_id: context_id,
                is_command,
                is_last: chunks.peek().is_none(),
                data: Bytes::copy_from_slice(chunk),
            };
            self.framed.send(Pdu::PData(vec![pdv])).await.map_err(PacsError::into_network)?;
        }
        Ok(())
    }

    /// 发送命令集及可选的已编码数据集
    pub async fn send_message(
        &mut self,
        context_id: u8,
        command: &InMemDicomObject,
        data: Option<&[u8]>,
    ) -> Result<()> {
        self.ensure_established()?;
        let command_bytes = dimse::encode_command(command)?;
        self.send_fragments(context_id, &command_bytes, true).await?;
        if let Some(data) = data {
            self.send_fragments(context_id, data, false).await?;
        }
        Ok(())
    }

    async fn next_pdu(&mut self) -> Result<Pdu> {
        let limit = self.dimse_timeout;
        let framed = &mut self.framed;
        with_timeout(limit, "等待DIMSE消息", async {
            framed
                .next()
                .await
                .unwrap_or_else(|| Err(PacsError::Protocol("对端意外关闭连接".to_string())))
        })
        .await
    }

    /// 接收下一条 DIMSE 消息
    ///
    /// 对端请求释放时回复 A-RELEASE-RP 并返回 `None`。
    pub async fn receive_message(&mut self) -> Result<Option<DimseMessage>> {
        self.ensure_established()?;

        let mut command_buf: Vec<u8> = Vec::new();
        let mut data_buf: Vec<u8> = Vec::new();
        let mut command: Option<CommandSet> = None;
        let mut context_id = 0u8;

        loop {
            let pdu = match self.next_pdu().await {
                Ok(pdu) => pdu,
                Err(e) => {
                    // 超时或解码失败时由本端发起中止
                    self.send_abort().await;
                    return Err(e);
                }
            };
            match pdu {
                Pdu::PData(values) => {
                    for pdv in values {
                        context_id = pdv.presentation_context_id;
                        if pdv.is_command {
                            command_buf.extend_from_slice(&pdv.data);
                            if pdv.is_last {
                                let parsed = dimse::decode_command(&command_buf)?;
                                if !parsed.has_dataset() {
                                    return Ok(Some(DimseMessage {
                                        presentation_context_id: context_id,
                                        command: parsed,
                                        data: None,
                                    }));
                                }
                                command = Some(parsed);
                            }
                        } else {
                            if command.is_none() {
                                return Err(PacsError::Protocol("数据片段先于命令集到达".to_string()));
                            }
                            data_buf.extend_from_slice(&pdv.data);
                            if pdv.is_last {
                                if let Some(command) = command.take() {
                                    return Ok(Some(DimseMessage {
                                        presentation_context_id: context_id,
                                        command,
                                        data: Some(std::mem::take(&mut data_buf)),
                                    }));
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRq => {
                    debug!("对端请求释放关联: {}", self.calling_ae_title);
                    self.framed.send(Pdu::ReleaseRp).await.map_err(PacsError::into_network)?;
                    self.state = AssociationState::Closed;
                    return Ok(None);
                }
                Pdu::Abort { source, reason } => {
                    self.state = AssociationState::Aborted;
                    return Err(PacsError::Protocol(format!(
                        "对端中止关联: source={}, reason={}",
                        source, reason
                    )));
                }
                other => {
                    return Err(PacsError::Protocol(format!("传输数据时收到意外的 {}", other.name())));
                }
            }
        }
    }

    /// 正常释放关联
    pub async fn release(mut self) -> Result<()> {
        self.ensure_established()?;
        self.state = AssociationState::Releasing;
        self.framed.send(Pdu::ReleaseRq).await.map_err(PacsError::into_network)?;

        let limit = self.acse_timeout;
        let framed = &mut self.framed;
        let reply = with_timeout(limit, "等待释放响应", async {
            framed
                .next()
                .await
                .unwrap_or_else(|| Err(PacsError::Protocol("释放过程中连接关闭".to_string())))
        })
        .await;

        match reply {
            Ok(Pdu::ReleaseRp) => {
                self.state = AssociationState::Closed;
                debug!("关闭DICOM关联: {} -> {}", self.calling_ae_title, self.called_ae_title);
                Ok(())
            }
            Ok(other) => {
                let message = format!("释放时收到意外的 {}", other.name());
                self.abort().await;
                Err(PacsError::Protocol(message))
            }
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    /// 中止关联，尽力发送 A-ABORT 后丢弃连接
    pub async fn abort(mut self) {
        self.send_abort().await;
    }

    async fn send_abort(&mut self) {
        if matches!(self.state, AssociationState::Closed | AssociationState::Aborted) {
            return;
        }
        if let Err(e) = self.framed.send(Pdu::Abort { source: 0, reason: 0 }).await {
            debug!("发送 A-ABORT 失败: {}", e);
        }
        self.state = AssociationState::Aborted;
        warn!("中止DICOM关联: {} -> {}", self.calling_ae_title, self.called_ae_title);
    }
}

fn local_user_variables(max_pdu_length: u32) -> UserVariables {
    UserVariables {
        max_pdu_length,
        implementation_class_uid: IMPLEMENTATION_CLASS_UID.to_string(),
        implementation_version_name: Some(IMPLEMENTATION_VERSION_NAME.to_string()),
    }
}

fn accepted_contexts(
    proposed: &[PresentationContextProposed],
    results: &[PresentationContextResult],
) -> Vec<PresentationContext> {
    results
        .iter()
        .filter(|r| r.reason == PresentationContextResultReason::Acceptance)
        .filter_map(|r| {
            proposed.iter().find(|p| p.id == r.id).map(|p| PresentationContext {
                id: r.id,
                abstract_syntax: p.abstract_syntax.clone(),
                transfer_syntax: r.transfer_syntax.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimse::{c_echo_rq, c_echo_rsp, CommandType, VERIFICATION};
    use crate::transfer_syntax::{QUERY_TRANSFER_SYNTAXES, STORAGE_TRANSFER_SYNTAXES};

    fn request_options(called: &str) -> RequestOptions {
        RequestOptions {
            calling_ae_title: "WMX01".to_string(),
            called_ae_title: called.to_string(),
            abstract_syntaxes: vec![VERIFICATION.to_string()],
            transfer_syntaxes: QUERY_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()).collect(),
            max_pdu_length: 16384,
            acse_timeout: Duration::from_secs(5),
            dimse_timeout: Duration::from_secs(5),
        }
    }

    fn accept_options() -> AcceptOptions {
        AcceptOptions {
            ae_title: "pacsFIR".to_string(),
            transfer_syntaxes: STORAGE_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()).collect(),
            max_pdu_length: 16384,
            acse_timeout: Duration::from_secs(5),
            dimse_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_echo_over_duplex() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let scp = tokio::spawn(async move {
            let mut assoc = Association::accept(server, &accept_options()).await.unwrap();
            let msg = assoc.receive_message().await.unwrap().unwrap();
            assert_eq!(msg.command.command_type(), CommandType::CEchoRq);
            assoc
                .send_message(msg.presentation_context_id, &c_echo_rsp(msg.command.message_id(), 0), None)
                .await
                .unwrap();
            assert!(assoc.receive_message().await.unwrap().is_none());
            assert_eq!(assoc.state(), AssociationState::Closed);
        });

        let mut assoc = Association::request(client, &request_options("pacsFIR")).await.unwrap();
        assert_eq!(assoc.state(), AssociationState::Established);
        let ctx = assoc.context_for(VERIFICATION).unwrap().clone();
        assert_eq!(ctx.transfer_syntax, QUERY_TRANSFER_SYNTAXES[0]);

        assoc.send_message(ctx.id, &c_echo_rq(1), None).await.unwrap();
        let rsp = assoc.receive_message().await.unwrap().unwrap();
        assert_eq!(rsp.command.command_type(), CommandType::CEchoRsp);
        assert_eq!(rsp.command.status(), Some(0));
        assoc.release().await.unwrap();
        scp.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_called_ae_is_rejected() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let scp = tokio::spawn(async move { Association::accept(server, &accept_options()).await });

        let err = Association::request(client, &request_options("OTHER")).await.unwrap_err();
        assert!(matches!(
            err,
            PacsError::AssociationRejected { result: 1, source_code: 1, reason: 7 }
        ));
        assert!(scp.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_large_dataset_is_fragmented() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut opts = accept_options();
        opts.max_pdu_length = 1024;

        let scp = tokio::spawn(async move {
            let mut assoc = Association::accept(server, &opts).await.unwrap();
            let msg = assoc.receive_message().await.unwrap().unwrap();
            msg.data.unwrap()
        });

        let mut ropts = request_options("pacsFIR");
        ropts.abstract_syntaxes = vec![crate::dimse::STUDY_ROOT_FIND.to_string()];
        let mut assoc = Association::request(client, &ropts).await.unwrap();
        let ctx = assoc.presentation_contexts()[0].id;
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        assoc
            .send_message(ctx, &crate::dimse::c_find_rq(1, crate::dimse::STUDY_ROOT_FIND), Some(&payload))
            .await
            .unwrap();

        assert_eq!(scp.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_peer_close_is_protocol_error() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let scp = tokio::spawn(async move {
            let assoc = Association::accept(server, &accept_options()).await.unwrap();
            drop(assoc);
        });
        let mut assoc = Association::request(client, &request_options("pacsFIR")).await.unwrap();
        scp.await.unwrap();
        assert!(assoc.receive_message().await.is_err());
        assert_eq!(assoc.state(), AssociationState::Aborted);
    }

    #[tokio::test]
    async fn test_dimse_timeout_sends_abort() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        // 对端关联成功后保持沉默，只等待本端的下一个 PDU
        let scp = tokio::spawn(async move {
            let mut assoc = Association::accept(server, &accept_options()).await.unwrap();
            let err = assoc.receive_message().await.unwrap_err();
            (err, assoc.state())
        });

        let mut opts = request_options("pacsFIR");
        opts.dimse_timeout = Duration::from_millis(200);
        let mut assoc = Association::request(client, &opts).await.unwrap();
        let err = assoc.receive_message().await.unwrap_err();
        assert!(matches!(&err, PacsError::Timeout(msg) if msg.contains("200ms")));
        assert_eq!(assoc.state(), AssociationState::Aborted);
        assoc.abort().await;

        let (peer_err, peer_state) = scp.await.unwrap();
        assert!(matches!(&peer_err, PacsError::Protocol(msg) if msg.contains("对端中止关联")));
        assert_eq!(peer_state, AssociationState::Aborted);
    }
}
