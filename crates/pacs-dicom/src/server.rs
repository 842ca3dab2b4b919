//! C-STORE 接收服务
//!
//! C-MOVE 的对象由 PACS 另行发起关联推送到本端。监听器长期运行，多个并发检索共享同一端口；
//! 对象按 StudyInstanceUID/SeriesInstanceUID 查找已登记的接收者，与入站连接无关。

use crate::association::{AcceptOptions, Association, DimseMessage};
use crate::dimse::{self, element_str, status, CommandType};
use crate::transfer_syntax::STORAGE_TRANSFER_SYNTAXES;
use dicom_dictionary_std::tags;
use dicom_object::FileMetaTableBuilder;
use pacs_core::utils::{is_valid_dicom_uid, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};
use pacs_core::{EndpointStore, PacsError, Result};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// C-STORE SCP 配置
#[derive(Debug, Clone)]
pub struct StoreScpConfig {
    pub bind_address: String,   // 监听地址
    pub port: u16,              // 监听端口，0 表示由系统分配
    pub max_pdu_length: u32,
    pub acse_timeout: Duration,
    pub dimse_timeout: Duration,
}

impl Default for StoreScpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 1103,
            max_pdu_length: crate::pdu::DEFAULT_MAX_PDU_LENGTH,
            acse_timeout: Duration::from_secs(30),
            dimse_timeout: Duration::from_secs(300),
        }
    }
}

/// 一个等待中的序列接收者
#[derive(Debug)]
struct Sink {
    id: u64,
    study_uid: String,
    dir: PathBuf,
    received: Mutex<HashSet<String>>, // 已落盘的 SOPInstanceUID
    notify: Notify,
}

impl Sink {
    fn received_count(&self) -> usize {
        self.received.lock().map(|set| set.len()).unwrap_or(0)
    }

    fn mark_received(&self, sop_instance_uid: &str) {
        if let Ok(mut set) = self.received.lock() {
            set.insert(sop_instance_uid.to_string());
        }
        self.notify.notify_waiters();
    }
}

/// 关联键 -> 接收者 的登记表
///
/// 同一序列可以同时登记多个接收者，入站对象会写入每一个接收者的目录。
#[derive(Debug, Default)]
pub struct ReceiverRegistry {
    next_id: AtomicU64,
    sinks: Mutex<HashMap<String, Vec<Arc<Sink>>>>,
}

impl ReceiverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 登记一个序列接收者，返回的句柄被丢弃时自动注销
    pub fn register(
        self: &Arc<Self>,
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        dir: impl Into<PathBuf>,
    ) -> SeriesReceiver {
        let series_uid = series_uid.into();
        let sink = Arc::new(Sink {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            study_uid: study_uid.into(),
            dir: dir.into(),
            received: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        });
        if let Ok(mut sinks) = self.sinks.lock() {
            sinks.entry(series_uid.clone()).or_default().push(sink.clone());
        }
        debug!("登记序列接收者: {} -> {:?}", series_uid, sink.dir);
        SeriesReceiver {
            registry: Arc::clone(self),
            series_uid,
            sink,
        }
    }

    fn route(&self, study_uid: &str, series_uid: &str) -> Vec<Arc<Sink>> {
        let Ok(sinks) = self.sinks.lock() else {
            return Vec::new();
        };
        sinks
            .get(series_uid)
            .map(|list| {
                list.iter()
                    .filter(|s| s.study_uid.is_empty() || s.study_uid == study_uid)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn unregister(&self, series_uid: &str, id: u64) {
        if let Ok(mut sinks) = self.sinks.lock() {
            if let Some(list) = sinks.get_mut(series_uid) {
                list.retain(|s| s.id != id);
                if list.is_empty() {
                    sinks.remove(series_uid);
                }
            }
        }
    }

    /// 当前登记的接收者数量
    pub fn active_count(&self) -> usize {
        self.sinks.lock().map(|s| s.values().map(Vec::len).sum()).unwrap_or(0)
    }
}

/// 单个序列的接收句柄
#[derive(Debug)]
pub struct SeriesReceiver {
    registry: Arc<ReceiverRegistry>,
    series_uid: String,
    sink: Arc<Sink>,
}

impl SeriesReceiver {
    pub fn dir(&self) -> &Path {
        &self.sink.dir
    }

    pub fn series_uid(&self) -> &str {
        &self.series_uid
    }

    /// 已落盘的不同实例数
    pub fn received_count(&self) -> usize {
        self.sink.received_count()
    }

    /// 等待收到 `expected` 个实例，最多等待 `grace`，返回实际收到的数量
    pub async fn wait_for(&self, expected: usize, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.sink.notify.notified();
            let count = self.received_count();
            if count >= expected {
                return count;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.received_count();
            }
        }
    }
}

impl Drop for SeriesReceiver {
    fn drop(&mut self) {
        self.registry.unregister(&self.series_uid, self.sink.id);
    }
}

/// C-STORE SCP
///
/// 每条入站关联在接受时读取端点快照中的 Calling AE 作为本端 AE 标题。
pub struct StoreScp {
    listener: TcpListener,
    config: StoreScpConfig,
    endpoints: EndpointStore,
    registry: Arc<ReceiverRegistry>,
}

impl StoreScp {
    pub async fn bind(config: StoreScpConfig, endpoints: EndpointStore, registry: Arc<ReceiverRegistry>) -> Result<Self> {
        let listener = TcpListener::bind((config.bind_address.as_str(), config.port))
            .await
            .map_err(PacsError::Network)?;
        Ok(Self {
            listener,
            config,
            endpoints,
            registry,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(PacsError::Network)
    }

    pub fn registry(&self) -> Arc<ReceiverRegistry> {
        self.registry.clone()
    }

    /// 在后台运行
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(cancel))
    }

    /// 接受连接直到取消
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(
            "C-STORE SCP 启动: AE={}, 地址={}",
            self.endpoints.snapshot().endpoint.calling_aet,
            addr
        );

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("C-STORE SCP 停止: {}", addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    debug!("接受连接: {}", remote_addr);
                    let options = AcceptOptions {
                        ae_title: self.endpoints.snapshot().endpoint.calling_aet.clone(),
                        transfer_syntaxes: STORAGE_TRANSFER_SYNTAXES.iter().map(|s| s.to_string()).collect(),
                        max_pdu_length: self.config.max_pdu_length,
                        acse_timeout: self.config.acse_timeout,
                        dimse_timeout: self.config.dimse_timeout,
                    };
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, remote_addr, options, registry).await {
                            warn!("处理入站关联失败 {}: {}", remote_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("接受连接失败: {}", e);
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    options: AcceptOptions,
    registry: Arc<ReceiverRegistry>,
) -> Result<()> {
    let mut assoc = Association::accept(stream, &options).await?;
    let calling_ae = assoc.calling_ae_title().to_string();
    let mut stored = 0usize;

    while let Some(msg) = assoc.receive_message().await? {
        let id = msg.command.message_id();
        match msg.command.command_type() {
            CommandType::CEchoRq => {
                assoc
                    .send_message(msg.presentation_context_id, &dimse::c_echo_rsp(id, status::SUCCESS), None)
                    .await?;
            }
            CommandType::CStoreRq => {
                let ts = assoc.context_by_id(msg.presentation_context_id)?.transfer_syntax.clone();
                let sop_class = msg.command.affected_sop_class_uid().unwrap_or_default();
                let sop_instance = msg.command.affected_sop_instance_uid().unwrap_or_default();
                let code = store_object(&registry, &msg, &ts, &calling_ae).await;
                if code == status::SUCCESS {
                    stored += 1;
                }
                assoc
                    .send_message(
                        msg.presentation_context_id,
                        &dimse::c_store_rsp(id, &sop_class, &sop_instance, code),
                        None,
                    )
                    .await?;
            }
            other => {
                warn!("{} 发送了不支持的命令 {:?}，中止关联", remote_addr, other);
                assoc.abort().await;
                return Err(PacsError::Protocol(format!("不支持的命令 {:?}", other)));
            }
        }
    }

    debug!("入站关联结束: {} ({}) 存储 {} 个对象", calling_ae, remote_addr, stored);
    Ok(())
}

/// 处理一次 C-STORE，返回响应状态
async fn store_object(registry: &ReceiverRegistry, msg: &DimseMessage, ts_uid: &str, source_ae: &str) -> u16 {
    let Some(data) = msg.data.as_deref() else {
        warn!("C-STORE 请求缺少数据集");
        return status::CANNOT_UNDERSTAND;
    };
    let dataset = match dimse::decode_dataset(data, ts_uid) {
        Ok(obj) => obj,
        Err(e) => {
            warn!("C-STORE 数据集无法解析: {}", e);
            return status::CANNOT_UNDERSTAND;
        }
    };

    let study_uid = element_str(&dataset, tags::STUDY_INSTANCE_UID).unwrap_or_default();
    let series_uid = element_str(&dataset, tags::SERIES_INSTANCE_UID).unwrap_or_default();
    let sop_class = msg
        .command
        .affected_sop_class_uid()
        .or_else(|| element_str(&dataset, tags::SOP_CLASS_UID))
        .unwrap_or_default();
    let sop_instance = msg
        .command
        .affected_sop_instance_uid()
        .or_else(|| element_str(&dataset, tags::SOP_INSTANCE_UID))
        .unwrap_or_default();
    if !is_valid_dicom_uid(&sop_instance) {
        warn!("C-STORE 对象的 SOPInstanceUID 非法: {:?}", sop_instance);
        return status::CANNOT_UNDERSTAND;
    }

    let sinks = registry.route(&study_uid, &series_uid);
    if sinks.is_empty() {
        warn!("未找到序列 {} 的接收者，拒绝对象 {}", series_uid, sop_instance);
        return status::CANNOT_UNDERSTAND;
    }

    let bytes = match part10_bytes(&sop_class, &sop_instance, ts_uid, source_ae, data) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("构造DICOM文件失败 {}: {}", sop_instance, e);
            return status::CANNOT_UNDERSTAND;
        }
    };

    let mut code = status::SUCCESS;
    for sink in sinks {
        match write_atomically(&sink.dir, &format!("{}.dcm", sop_instance), &bytes).await {
            Ok(()) => sink.mark_received(&sop_instance),
            Err(e) => {
                error!("写入 {:?} 失败: {}", sink.dir, e);
                code = status::OUT_OF_RESOURCES;
            }
        }
    }
    code
}

/// 组装 Part-10 文件: 128 字节前导 + 文件元信息 + 原样数据集
pub(crate) fn part10_bytes(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    ts_uid: &str,
    source_ae: &str,
    dataset: &[u8],
) -> Result<Vec<u8>> {
    let mut builder = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(ts_uid)
        .implementation_class_uid(IMPLEMENTATION_CLASS_UID)
        .implementation_version_name(IMPLEMENTATION_VERSION_NAME);
    if !source_ae.is_empty() {
        builder = builder.source_application_entity_title(source_ae);
    }
    let meta = builder
        .build()
        .map_err(|e| PacsError::Dicom(format!("文件元信息无效: {}", e)))?;

    let mut out = vec![0u8; 128];
    meta.write(&mut out)
        .map_err(|e| PacsError::Dicom(format!("文件元信息写入失败: {}", e)))?;
    out.extend_from_slice(dataset);
    Ok(out)
}

/// 先写临时文件再改名，避免留下半个文件
pub(crate) async fn write_atomically(dir: &Path, file_name: &str, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(file_name);
    let partial = dir.join(format!("{}.part", file_name));
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, &target).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{endpoint_store, instance, store_one};

    async fn start_scp() -> (u16, Arc<ReceiverRegistry>, CancellationToken) {
        let config = StoreScpConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..StoreScpConfig::default()
        };
        let registry = ReceiverRegistry::new();
        let scp = StoreScp::bind(config, endpoint_store(104, 1103), registry.clone()).await.unwrap();
        let port = scp.local_addr().unwrap().port();
        let cancel = CancellationToken::new();
        scp.spawn(cancel.clone());
        (port, registry, cancel)
    }

    #[tokio::test]
    async fn test_store_is_routed_by_series() {
        let (port, registry, cancel) = start_scp().await;
        let dir = tempfile::tempdir().unwrap();
        let receiver = registry.register("1.2.3", "1.2.3.1", dir.path().join("001_t2"));

        let obj = instance("1.2.3", "1.2.3.1", "1.2.3.1.1", 1, "t2");
        assert_eq!(store_one(port, "WMX01", &obj).await.unwrap(), 0);
        assert_eq!(receiver.wait_for(1, Duration::from_secs(2)).await, 1);

        let written = receiver.dir().join("1.2.3.1.1.dcm");
        assert!(written.exists());
        let file = dicom_object::open_file(&written).unwrap();
        assert_eq!(file.meta().media_storage_sop_instance_uid(), "1.2.3.1.1");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unmatched_object_is_refused() {
        let (port, _registry, cancel) = start_scp().await;
        let obj = instance("1.2.3", "9.9.9", "9.9.9.1", 1, "x");
        let err = store_one(port, "WMX01", &obj).await.unwrap_err();
        assert!(matches!(err, PacsError::DimseFailure { status: status::CANNOT_UNDERSTAND, .. }));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_receivers_share_objects() {
        let (port, registry, cancel) = start_scp().await;
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = registry.register("1.2.3", "1.2.3.1", a.path());
        let second = registry.register("1.2.3", "1.2.3.1", b.path());
        assert_eq!(registry.active_count(), 2);

        let obj = instance("1.2.3", "1.2.3.1", "1.2.3.1.7", 1, "t2");
        store_one(port, "WMX01", &obj).await.unwrap();
        assert_eq!(first.received_count(), 1);
        assert_eq!(second.received_count(), 1);

        drop(first);
        assert_eq!(registry.active_count(), 1);
        drop(second);
        assert_eq!(registry.active_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wait_for_times_out_with_partial_count() {
        let registry = ReceiverRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let receiver = registry.register("1.2.3", "1.2.3.1", dir.path());
        assert_eq!(receiver.wait_for(2, Duration::from_millis(20)).await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_instances_counted_once() {
        let (port, registry, cancel) = start_scp().await;
        let dir = tempfile::tempdir().unwrap();
        let receiver = registry.register("", "1.2.3.1", dir.path());
        let obj = instance("1.2.3", "1.2.3.1", "1.2.3.1.1", 1, "t2");
        store_one(port, "WMX01", &obj).await.unwrap();
        store_one(port, "WMX01", &obj).await.unwrap();
        assert_eq!(receiver.received_count(), 1);
        cancel.cancel();
    }
}
