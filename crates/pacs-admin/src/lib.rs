//! # PACS管理模块
//!
//! 负责配置加载、日志初始化，并把各模块组装成一个可运行的服务:
//! 端点存储、C-STORE 接收端、检索器、流水线和任务编排器。

pub mod config;
pub mod logging;

use anyhow::{Context, Result};
use pacs_classify::{Classifier, RuleConfig, RuleSetHandle};
use pacs_core::PacsEndpoint;
use pacs_dicom::{ExternalConverter, PacsClient, PacsRetriever, ReceiverRegistry, StoreScp, TemplateSet};
use pacs_workflow::{Orchestrator, Pipeline};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use self::config::{AppConfig, ConfigManager};
pub use self::logging::init_tracing;

/// 系统管理器
///
/// 集成所有运行时组件的统一入口点
pub struct SystemManager {
    /// 配置管理器
    config_manager: Arc<ConfigManager>,
    client: PacsClient,
    orchestrator: Arc<Orchestrator>,
    /// 尚未启动的接收端
    receiver: Option<StoreScp>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl SystemManager {
    /// 按配置组装各组件
    ///
    /// `bind_receiver` 为 false 时不监听 C-STORE 端口，适用于只处理上传文件的场景。
    pub async fn build(config_manager: Arc<ConfigManager>, bind_receiver: bool) -> Result<Self> {
        let config = config_manager.get_config().await;
        let endpoints = config_manager.endpoints();

        let templates = if config.paths.template_dir.is_dir() {
            TemplateSet::load_dir(&config.paths.template_dir)
                .with_context(|| format!("无法加载模板目录 {}", config.paths.template_dir.display()))?
        } else {
            info!("模板目录 {} 不存在，使用内置模板", config.paths.template_dir.display());
            TemplateSet::builtin()
        };

        let rules = match &config.paths.rules_path {
            Some(path) if path.exists() => RuleSetHandle::load(path)
                .with_context(|| format!("无法加载分类规则 {}", path.display()))?,
            Some(path) => {
                warn!("分类规则文件 {} 不存在，使用内置规则", path.display());
                RuleSetHandle::new(Classifier::new(RuleConfig::default())?)
            }
            None => RuleSetHandle::new(Classifier::new(RuleConfig::default())?),
        };

        let registry = ReceiverRegistry::new();
        let receiver = if bind_receiver {
            let scp_config = config.network.store_scp(config.pacs.calling_port);
            let scp = StoreScp::bind(scp_config, endpoints.clone(), registry.clone())
                .await
                .with_context(|| format!("无法监听 C-STORE 端口 {}", config.pacs.calling_port))?;
            info!("C-STORE 接收端监听于 {}", scp.local_addr()?);
            Some(scp)
        } else {
            None
        };

        let client = PacsClient::new(endpoints, config.network.options());
        let retriever = PacsRetriever::new(client.clone(), registry, config.retry.clone())
            .with_listener_port(config.pacs.calling_port)
            .with_receive_grace(config.network.receive_grace());

        let mut pipeline = Pipeline::new(Arc::new(retriever), Arc::new(templates), rules, config.paths.work_dir.clone());
        if let Some(command) = &config.conversion.external {
            info!("启用外部转换器: {}", command.program);
            pipeline = pipeline.with_external_converter(Arc::new(ExternalConverter::new(command.clone())));
        }
        let orchestrator = Arc::new(Orchestrator::new(pipeline, config.tasks.retention()));

        Ok(Self {
            config_manager,
            client,
            orchestrator,
            receiver,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// 启动后台服务: C-STORE 接收端和任务回收
    pub async fn start(&mut self) -> Result<()> {
        let config = self.config_manager.get_config().await;

        if let Some(receiver) = self.receiver.take() {
            let scp = receiver.spawn(self.shutdown.child_token());
            self.handles.push(tokio::spawn(async move {
                match scp.await {
                    Ok(Ok(())) => info!("C-STORE 接收端已停止"),
                    Ok(Err(e)) => tracing::error!("C-STORE 接收端异常退出: {}", e),
                    Err(e) => tracing::error!("C-STORE 接收端任务异常: {}", e),
                }
            }));
        }

        let eviction = self
            .orchestrator
            .spawn_eviction(config.tasks.eviction_interval(), self.shutdown.child_token());
        self.handles.push(eviction);

        info!("系统管理服务已启动");
        Ok(())
    }

    /// 停止后台服务并等待退出
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("系统管理服务已停止");
    }

    /// 获取配置管理器
    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn client(&self) -> &PacsClient {
        &self.client
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// 更新端点，只影响之后建立的关联
    pub async fn update_endpoint(&self, endpoint: PacsEndpoint) -> Result<u64> {
        self.config_manager.update_pacs_endpoint(endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacs_workflow::{JobOptions, JobRequest, OutputFormat, TaskState};

    async fn manager(dir: &std::path::Path) -> SystemManager {
        let config_path = dir.join("pacs.toml");
        std::fs::write(
            &config_path,
            format!(
                "[paths]\nwork_dir = {:?}\ntemplate_dir = {:?}\n",
                dir.join("results").to_string_lossy(),
                dir.join("templates").to_string_lossy()
            ),
        )
        .unwrap();
        let config_manager = ConfigManager::load_with_env(Some(config_path.as_path()), Default::default()).unwrap();
        SystemManager::build(Arc::new(config_manager), false).await.unwrap()
    }

    #[tokio::test]
    async fn test_build_without_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let mut system = manager(dir.path()).await;
        system.start().await.unwrap();

        // 未配置外部转换器时拒绝 NIfTI
        let options = JobOptions {
            output_format: OutputFormat::Nifti,
            ..JobOptions::default()
        };
        let request = JobRequest::Single {
            accession_number: "A001".to_string(),
        };
        assert!(system.orchestrator().submit(request, options).is_err());
        assert!(system.orchestrator().history().is_empty());

        system.stop().await;
    }

    #[tokio::test]
    async fn test_empty_upload_fails_task() {
        let dir = tempfile::tempdir().unwrap();
        let upload = dir.path().join("upload");
        std::fs::create_dir_all(&upload).unwrap();
        let system = manager(dir.path()).await;

        let id = system
            .orchestrator()
            .submit(JobRequest::Upload { path: upload }, JobOptions::default())
            .unwrap();
        let snapshot = system.orchestrator().wait(&id).await.unwrap();
        assert_eq!(snapshot.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_update_endpoint_through_manager() {
        let dir = tempfile::tempdir().unwrap();
        let system = manager(dir.path()).await;
        let mut endpoint = system.client().endpoints().snapshot().endpoint.clone();
        endpoint.pacs_port = 11112;
        let version = system.update_endpoint(endpoint).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(system.client().endpoints().snapshot().endpoint.pacs_port, 11112);
    }
}
