//! 检索流水线
//!
//! C-FIND 确认检查号并列出序列，再逐个序列发起 C-MOVE，最后核对磁盘上实际到达的序列。
//! 缺少部分序列不算失败，缺口记录在结果里。

use crate::client::PacsClient;
use crate::retry::{with_retry, IsRetryable, RetryConfig};
use crate::server::ReceiverRegistry;
use async_trait::async_trait;
use pacs_core::utils::series_folder_name;
use pacs_core::{PacsError, ProgressReporter, Result, SeriesIdentity};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 单个已检索的序列
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedSeries {
    pub identity: SeriesIdentity,
    pub directory: PathBuf,
    pub received: usize,         // 本地落盘实例数
    pub reported_completed: u32, // PACS 报告的成功子操作数
    pub reported_failed: u32,
}

/// 检索缺口
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalShortfall {
    pub expected_series: usize,
    pub received_series: usize,
    pub missing_series: Vec<String>,
}

impl RetrievalShortfall {
    pub fn missing_count(&self) -> usize {
        self.expected_series.saturating_sub(self.received_series)
    }
}

/// 一个检查号的检索结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalOutcome {
    pub accession_number: String,
    pub series: Vec<RetrievedSeries>,
    pub shortfall: Option<RetrievalShortfall>,
}

impl RetrievalOutcome {
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn file_count(&self) -> usize {
        self.series.iter().map(|s| s.received).sum()
    }
}

/// 检索一个检查号到本地目录
#[async_trait]
pub trait StudyRetriever: Send + Sync {
    async fn retrieve(
        &self,
        accession_number: &str,
        destination: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome>;
}

/// 基于 C-FIND/C-MOVE 的检索器
pub struct PacsRetriever {
    client: PacsClient,
    registry: Arc<ReceiverRegistry>,
    listener_port: Option<u16>,
    retry: RetryConfig,
    receive_grace: Duration,
}

impl PacsRetriever {
    pub fn new(client: PacsClient, registry: Arc<ReceiverRegistry>, retry: RetryConfig) -> Self {
        Self {
            client,
            registry,
            listener_port: None,
            retry,
            receive_grace: Duration::from_secs(5),
        }
    }

    /// 记录监听器实际端口，用于发现与 CALLING_PORT 不一致的配置
    pub fn with_listener_port(mut self, port: u16) -> Self {
        self.listener_port = Some(port);
        self
    }

    /// C-MOVE 结束后等待迟到对象的时间
    pub fn with_receive_grace(mut self, grace: Duration) -> Self {
        self.receive_grace = grace;
        self
    }

    pub fn client(&self) -> &PacsClient {
        &self.client
    }

    fn check_listener_port(&self, reporter: &dyn ProgressReporter) {
        let calling_port = self.client.endpoints().snapshot().endpoint.calling_port;
        if let Some(port) = self.listener_port {
            if port != calling_port {
                reporter.warning(&format!(
                    "接收端口 {} 与配置的 CALLING_PORT {} 不一致，PACS 可能无法推送对象",
                    port, calling_port
                ));
            }
        }
    }

    async fn move_one(
        &self,
        identity: &SeriesIdentity,
        directory: PathBuf,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RetrievedSeries> {
        let receiver = self
            .registry
            .register(&identity.study_uid, &identity.series_uid, directory.clone());
        let label = format!(
            "C-MOVE 序列 {}",
            identity.series_description.as_deref().unwrap_or(&identity.series_uid)
        );

        let outcome = with_retry(&self.retry, reporter, cancel, &label, |attempt| {
            debug!("{} 第 {} 次尝试", label, attempt);
            self.client
                .move_series(&identity.study_uid, &identity.series_uid, |counts| {
                    debug!(
                        "C-MOVE 进度: 完成 {} 失败 {} 剩余 {}",
                        counts.completed, counts.failed, counts.remaining
                    );
                })
        })
        .await?;

        let expected = (outcome.sub_operations.completed as usize).max(identity.instance_count.unwrap_or(0) as usize);
        let received = receiver.wait_for(expected, self.receive_grace).await;
        if received < expected {
            reporter.warning(&format!(
                "序列 {} 预期 {} 个实例，实际收到 {} 个",
                identity.series_uid, expected, received
            ));
        }

        Ok(RetrievedSeries {
            identity: identity.clone(),
            directory,
            received,
            reported_completed: outcome.sub_operations.completed as u32,
            reported_failed: outcome.sub_operations.failed as u32,
        })
    }
}

fn unique_folder(used: &mut HashSet<String>, identity: &SeriesIdentity, index: usize) -> String {
    let base = series_folder_name(identity.series_number, index, identity.series_description.as_deref());
    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{}_{}", base, n);
        n += 1;
    }
    name
}

#[async_trait]
impl StudyRetriever for PacsRetriever {
    async fn retrieve(
        &self,
        accession_number: &str,
        destination: &Path,
        reporter: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome> {
        if cancel.is_cancelled() {
            return Err(PacsError::Cancelled);
        }
        reporter.info(&format!("查询检查号 {}", accession_number));
        let found = with_retry(&self.retry, reporter, cancel, "C-FIND", |_| {
            self.client.find_series(accession_number)
        })
        .await?;

        if found.is_empty() {
            return Err(PacsError::NotFound(format!("PACS 中没有检查号 {}", accession_number)));
        }
        reporter.info(&format!("检查号 {} 共 {} 个序列", accession_number, found.len()));
        self.check_listener_port(reporter);

        let total = found.len();
        let mut used = HashSet::new();
        let mut series = Vec::new();
        let mut missing = Vec::new();
        reporter.advance(0, total);

        for (index, identity) in found.iter().enumerate() {
            if cancel.is_cancelled() {
                reporter.warning("检索已取消，停止发起新的 C-MOVE");
                return Err(PacsError::Cancelled);
            }

            let directory = destination.join(unique_folder(&mut used, identity, index));
            match self.move_one(identity, directory, reporter, cancel).await {
                Ok(retrieved) if retrieved.received > 0 => {
                    reporter.info(&format!(
                        "序列 {}/{} 已接收 {} 个实例",
                        index + 1,
                        total,
                        retrieved.received
                    ));
                    series.push(retrieved);
                }
                Ok(_) => {
                    reporter.warning(&format!("序列 {} 未收到任何实例", identity.series_uid));
                    missing.push(identity.series_uid.clone());
                }
                Err(PacsError::Cancelled) => return Err(PacsError::Cancelled),
                Err(e) if e.is_retryable() => {
                    reporter.error(&format!("序列 {} 检索失败: {}", identity.series_uid, e));
                    missing.push(identity.series_uid.clone());
                }
                Err(e) => return Err(e),
            }
            reporter.advance(index + 1, total);
        }

        if series.is_empty() {
            return Err(PacsError::NotFound(format!("检查号 {} 没有接收到任何文件", accession_number)));
        }

        let shortfall = if missing.is_empty() {
            None
        } else {
            warn!("检查号 {} 缺少 {} 个序列", accession_number, missing.len());
            reporter.warning(&format!("检索不完整: 预期 {} 个序列，收到 {} 个", total, series.len()));
            Some(RetrievalShortfall {
                expected_series: total,
                received_series: series.len(),
                missing_series: missing,
            })
        };

        info!(
            "检查号 {} 检索完成: {} 个序列, {} 个文件",
            accession_number,
            series.len(),
            series.iter().map(|s| s.received).sum::<usize>()
        );
        Ok(RetrievalOutcome {
            accession_number: accession_number.to_string(),
            series,
            shortfall,
        })
    }
}
