//! PACS 检索与分类命令行程序

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use pacs_admin::{init_tracing, ConfigManager, SystemManager};
use pacs_classify::{Classifier, RuleSetHandle};
use pacs_core::SeriesRecord;
use pacs_dicom::extractor::extract_series_blocking;
use pacs_dicom::TemplateSet;
use pacs_workflow::{JobOptions, JobRequest, OutputFormat, TaskState};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "pacs-server")]
#[command(about = "从 PACS 检索检查，提取元数据并对 MR 序列分类")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "./config/pacs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 按检查号检索单个检查
    Retrieve {
        accession_number: String,
        #[command(flatten)]
        options: PipelineArgs,
    },
    /// 批量检索，检查号来自参数或文本文件 (每行一个)
    Batch {
        #[arg(short, long)]
        file: Option<PathBuf>,
        accession_numbers: Vec<String>,
        #[command(flatten)]
        options: PipelineArgs,
    },
    /// 处理本地 ZIP 文件或 DICOM 目录
    Upload {
        path: PathBuf,
        #[command(flatten)]
        options: PipelineArgs,
    },
    /// 用 C-ECHO 测试 PACS 连通性
    Echo,
    /// 离线分类: 序列目录的父目录，或 SeriesRecord 数组 JSON 文件
    Classify {
        input: PathBuf,
        /// 规则文件，缺省时使用配置中的规则
        #[arg(short, long)]
        rules: Option<PathBuf>,
    },
    /// 查看或修改 PACS 端点
    Endpoint {
        #[arg(long)]
        pacs_ip: Option<String>,
        #[arg(long)]
        pacs_port: Option<u16>,
        #[arg(long)]
        calling_aet: Option<String>,
        #[arg(long)]
        called_aet: Option<String>,
        #[arg(long)]
        calling_port: Option<u16>,
    },
}

#[derive(clap::Args, Debug)]
struct PipelineArgs {
    /// 跳过体数据转换
    #[arg(long)]
    no_convert: bool,
    /// 跳过序列分类
    #[arg(long)]
    no_classify: bool,
    #[arg(long, value_enum, default_value_t = FormatArg::Npy)]
    format: FormatArg,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Npy,
    Nifti,
}

impl From<&PipelineArgs> for JobOptions {
    fn from(args: &PipelineArgs) -> Self {
        JobOptions {
            convert: !args.no_convert,
            classify: !args.no_classify,
            output_format: match args.format {
                FormatArg::Npy => OutputFormat::Npy,
                FormatArg::Nifti => OutputFormat::Nifti,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_manager = Arc::new(ConfigManager::load(Some(args.config.as_path()))?);
    let config = config_manager.get_config().await;
    init_tracing(&config.logging)?;

    match args.command {
        Command::Retrieve { accession_number, options } => {
            run_job(config_manager, JobRequest::Single { accession_number }, (&options).into(), true).await
        }
        Command::Batch {
            file,
            accession_numbers,
            options,
        } => {
            let request = match file {
                Some(path) => {
                    let text = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("无法读取检查号文件 {}", path.display()))?;
                    JobRequest::batch_from_text(&text)
                }
                None => JobRequest::Batch { accession_numbers },
            };
            run_job(config_manager, request, (&options).into(), true).await
        }
        Command::Upload { path, options } => {
            run_job(config_manager, JobRequest::Upload { path }, (&options).into(), false).await
        }
        Command::Echo => {
            let system = SystemManager::build(config_manager, false).await?;
            let endpoint = system.client().endpoints().snapshot();
            system.client().c_echo().await?;
            println!(
                "C-ECHO 成功: {} ({})",
                endpoint.endpoint.address(),
                endpoint.endpoint.called_aet
            );
            Ok(())
        }
        Command::Classify { input, rules } => classify_offline(&config_manager, &input, rules.as_deref()).await,
        Command::Endpoint {
            pacs_ip,
            pacs_port,
            calling_aet,
            called_aet,
            calling_port,
        } => {
            let mut endpoint = config_manager.endpoints().snapshot().endpoint.clone();
            let changed = pacs_ip.is_some()
                || pacs_port.is_some()
                || calling_aet.is_some()
                || called_aet.is_some()
                || calling_port.is_some();
            if changed {
                endpoint.pacs_ip = pacs_ip.unwrap_or(endpoint.pacs_ip);
                endpoint.pacs_port = pacs_port.unwrap_or(endpoint.pacs_port);
                endpoint.calling_aet = calling_aet.unwrap_or(endpoint.calling_aet);
                endpoint.called_aet = called_aet.unwrap_or(endpoint.called_aet);
                endpoint.calling_port = calling_port.unwrap_or(endpoint.calling_port);
                let version = config_manager.update_pacs_endpoint(endpoint).await?;
                info!("端点配置已保存，版本 {}", version);
            }
            let current = config_manager.endpoints().snapshot();
            println!("{}", serde_json::to_string_pretty(&current.endpoint)?);
            Ok(())
        }
    }
}

/// 提交任务并打印进度，Ctrl-C 取消任务
async fn run_job(config_manager: Arc<ConfigManager>, request: JobRequest, options: JobOptions, bind_receiver: bool) -> Result<()> {
    let mut system = SystemManager::build(config_manager, bind_receiver).await?;
    system.start().await?;

    let orchestrator = system.orchestrator().clone();
    let id = orchestrator.submit(request, options)?;
    info!("任务已提交: {}", id);

    let state = follow(&orchestrator, id).await?;
    let outcome = match state {
        TaskState::Completed => print_result(&orchestrator, id),
        TaskState::Cancelled => {
            println!("任务已取消");
            Ok(())
        }
        other => {
            let snapshot = orchestrator.get_status(&id)?;
            let reason = snapshot
                .logs
                .iter()
                .rev()
                .find(|l| l.level == pacs_core::LogLevel::Error)
                .map(|l| l.message.clone())
                .unwrap_or_default();
            Err(anyhow::anyhow!("任务结束于 {} 状态: {}", other, reason))
        }
    };

    system.stop().await;
    outcome
}

async fn follow(orchestrator: &pacs_workflow::Orchestrator, id: Uuid) -> Result<TaskState> {
    let mut subscription = orchestrator.subscribe(&id)?;
    let mut last_state = TaskState::Pending;
    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                for entry in &event.logs {
                    println!("[{}] [{}] {}", entry.timestamp.format("%H:%M:%S"), entry.level, entry.message);
                }
                println!("进度 {:>3}% {}", event.progress, event.current_step);
                last_state = event.status;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，正在取消任务");
                orchestrator.cancel(&id)?;
            }
        }
    }
    Ok(last_state)
}

fn print_result(orchestrator: &pacs_workflow::Orchestrator, id: Uuid) -> Result<()> {
    let Some(result) = orchestrator.take_result(&id)? else {
        bail!("任务 {} 没有结果", id);
    };
    println!("输出目录: {}", result.output_dir.display());
    for study in &result.studies {
        println!(
            "检查 {}: {} 个序列, {} 个文件, 已分类 {}, 体数据 {}",
            study.accession_number,
            study.series_count,
            study.file_count,
            study.classified_count(),
            study.volume_count()
        );
        for series in &study.series {
            let label = series
                .classification
                .as_ref()
                .map(|c| c.sequence_class.as_str())
                .unwrap_or("-");
            println!("  {:<40} {}", series.folder, label);
        }
    }
    if result.missing_series() > 0 {
        println!("警告: {} 个序列未能完整检索", result.missing_series());
    }
    for failure in &result.failures {
        println!("失败 {}: {}", failure.accession_number, failure.error);
    }
    Ok(())
}

/// 对已有数据离线分类，结果以 JSON 输出
async fn classify_offline(config_manager: &ConfigManager, input: &Path, rules: Option<&Path>) -> Result<()> {
    let config = config_manager.get_config().await;
    let handle = match rules.or(config.paths.rules_path.as_deref()) {
        Some(path) if path.exists() => RuleSetHandle::load(path)?,
        _ => RuleSetHandle::new(Classifier::new(Default::default())?),
    };

    let records: Vec<SeriesRecord> = if input.is_file() {
        let text = tokio::fs::read_to_string(input).await?;
        serde_json::from_str(&text).context("序列元数据 JSON 格式无效")?
    } else {
        let templates = if config.paths.template_dir.is_dir() {
            TemplateSet::load_dir(&config.paths.template_dir)?
        } else {
            TemplateSet::builtin()
        };
        let dir = input.to_path_buf();
        tokio::task::spawn_blocking(move || extract_dir(&dir, &templates)).await??
    };
    if records.is_empty() {
        bail!("{} 中没有可分类的序列", input.display());
    }

    let classification = handle.current().classify_study(&records);
    for warning in &classification.warnings {
        warn!("{}", warning);
    }
    println!("{}", serde_json::to_string_pretty(&classification.results)?);
    Ok(())
}

fn extract_dir(dir: &Path, templates: &TemplateSet) -> Result<Vec<SeriesRecord>> {
    let mut folders: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("无法读取目录 {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    folders.sort();

    let mut records = Vec::new();
    for folder in folders {
        match extract_series_blocking(&folder, templates) {
            Ok(record) => records.push(record),
            Err(e) => warn!("跳过 {}: {}", folder.display(), e),
        }
    }
    Ok(records)
}
