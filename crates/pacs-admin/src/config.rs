//! 配置管理
//!
//! 加载顺序: 内置默认值 -> TOML 文件 (可选) -> `PACS_*` 环境变量 (`__` 分隔层级)
//! -> 扁平的 `PACS_IP`/`PACS_PORT`/`CALLING_AET`/`CALLED_AET`/`CALLING_PORT`。
//! 加载后立即校验，非法配置直接失败。

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat, Map};
use pacs_core::{EndpointStore, PacsEndpoint};
use pacs_dicom::{ExternalCommand, NetworkOptions, RetryConfig, StoreScpConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// 扁平环境变量与配置键的对应关系
const FLAT_ENDPOINT_VARS: &[(&str, &str)] = &[
    ("PACS_IP", "pacs.pacs_ip"),
    ("PACS_PORT", "pacs.pacs_port"),
    ("CALLING_AET", "pacs.calling_aet"),
    ("CALLED_AET", "pacs.called_aet"),
    ("CALLING_PORT", "pacs.calling_port"),
];

/// 应用完整配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// PACS 端点
    pub pacs: PacsEndpoint,
    pub network: NetworkConfig,
    pub retry: RetryConfig,
    pub paths: PathsConfig,
    pub conversion: ConversionConfig,
    pub tasks: TaskConfig,
    pub logging: LoggingConfig,
}

/// 网络与接收端配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub connect_timeout_secs: u64,
    pub acse_timeout_secs: u64,
    pub dimse_timeout_secs: u64,
    pub max_pdu_length: u32,
    /// C-STORE 接收端监听地址，端口取 `pacs.calling_port`
    pub bind_address: String,
    /// C-MOVE 结束后等待迟到对象的秒数
    pub receive_grace_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let options = NetworkOptions::default();
        Self {
            connect_timeout_secs: options.connect_timeout_secs,
            acse_timeout_secs: options.acse_timeout_secs,
            dimse_timeout_secs: options.dimse_timeout_secs,
            max_pdu_length: options.max_pdu_length,
            bind_address: "0.0.0.0".to_string(),
            receive_grace_secs: 5,
        }
    }
}

impl NetworkConfig {
    pub fn options(&self) -> NetworkOptions {
        NetworkOptions {
            connect_timeout_secs: self.connect_timeout_secs,
            acse_timeout_secs: self.acse_timeout_secs,
            dimse_timeout_secs: self.dimse_timeout_secs,
            max_pdu_length: self.max_pdu_length,
        }
    }

    pub fn store_scp(&self, port: u16) -> StoreScpConfig {
        StoreScpConfig {
            bind_address: self.bind_address.clone(),
            port,
            max_pdu_length: self.max_pdu_length,
            acse_timeout: Duration::from_secs(self.acse_timeout_secs),
            dimse_timeout: Duration::from_secs(self.dimse_timeout_secs),
        }
    }

    pub fn receive_grace(&self) -> Duration {
        Duration::from_secs(self.receive_grace_secs)
    }
}

/// 目录配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// 任务输出根目录
    pub work_dir: PathBuf,
    /// `<modality>.json` 模板目录
    pub template_dir: PathBuf,
    /// 分类规则文件，不存在时使用内置规则
    pub rules_path: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./results"),
            template_dir: PathBuf::from("./config/templates"),
            rules_path: Some(PathBuf::from("./config/mr_clean_config.json")),
        }
    }
}

/// 格式转换配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ConversionConfig {
    /// 外部转换命令；未配置时不能输出 NIfTI
    pub external: Option<ExternalCommand>,
}

/// 任务保留配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskConfig {
    pub retention_hours: u64,
    pub eviction_interval_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            eviction_interval_secs: 600,
        }
    }
}

impl TaskConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别，`RUST_LOG` 优先
    pub level: String,
    /// compact / pretty / full
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    field_path: &'static str,
    validator: fn(&AppConfig) -> Result<()>,
}

impl ConfigValidator {
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "pacs",
                validator: |config| config.pacs.validate().map_err(anyhow::Error::from),
            },
            ValidationRule {
                field_path: "network",
                validator: |config| {
                    let n = &config.network;
                    if n.connect_timeout_secs == 0 || n.acse_timeout_secs == 0 || n.dimse_timeout_secs == 0 {
                        anyhow::bail!("超时时间必须大于 0");
                    }
                    if n.max_pdu_length < 4096 {
                        anyhow::bail!("max_pdu_length 不能小于 4096");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "retry",
                validator: |config| {
                    if config.retry.max_attempts == 0 {
                        anyhow::bail!("max_attempts 至少为 1");
                    }
                    if config.retry.backoff_multiplier < 1.0 {
                        anyhow::bail!("backoff_multiplier 不能小于 1.0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "conversion.external",
                validator: |config| match &config.conversion.external {
                    Some(command) if command.program.trim().is_empty() => anyhow::bail!("外部转换程序不能为空"),
                    Some(command) if command.timeout_secs == 0 => anyhow::bail!("外部转换超时必须大于 0"),
                    _ => Ok(()),
                },
            },
            ValidationRule {
                field_path: "tasks.retention_hours",
                validator: |config| {
                    if config.tasks.retention_hours == 0 {
                        anyhow::bail!("任务保留时间必须大于 0");
                    }
                    Ok(())
                },
            },
            ValidationRule {
                field_path: "logging",
                validator: |config| {
                    let level = config.logging.level.to_lowercase();
                    if !["trace", "debug", "info", "warn", "error"].contains(&level.as_str()) {
                        anyhow::bail!("未知的日志级别 {}", config.logging.level);
                    }
                    if !["compact", "pretty", "full"].contains(&config.logging.format.as_str()) {
                        anyhow::bail!("未知的日志格式 {}", config.logging.format);
                    }
                    Ok(())
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &AppConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("配置校验失败 [{}]: {}", rule.field_path, e);
                return Err(e.context(format!("配置项 {} 无效", rule.field_path)));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// 规范化端点: 去掉首尾空白，主叫AE转大写
pub fn normalize_endpoint(endpoint: PacsEndpoint) -> PacsEndpoint {
    PacsEndpoint {
        pacs_ip: endpoint.pacs_ip.trim().to_string(),
        calling_aet: endpoint.calling_aet.trim().to_uppercase(),
        called_aet: endpoint.called_aet.trim().to_string(),
        ..endpoint
    }
}

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: Option<PathBuf>,
    validator: ConfigValidator,
    endpoints: EndpointStore,
}

impl ConfigManager {
    /// 使用进程环境变量加载
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(config_path, std::env::vars().collect())
    }

    /// 使用给定的环境变量表加载
    pub fn load_with_env(config_path: Option<&Path>, env: Map<String, String>) -> Result<Self> {
        let mut config = Self::load_config(config_path, &env)?;
        config.pacs = normalize_endpoint(config.pacs);
        let validator = ConfigValidator::new();
        validator.validate(&config)?;

        let endpoints = EndpointStore::new(config.pacs.clone()).context("PACS 端点配置无效")?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: config_path.map(Path::to_path_buf),
            validator,
            endpoints,
        })
    }

    fn load_config(config_path: Option<&Path>, env: &Map<String, String>) -> Result<AppConfig> {
        // 缺省字段由 serde 默认值补齐
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
                info!("加载配置文件: {}", path.display());
            } else {
                warn!("配置文件 {} 不存在，使用默认值", path.display());
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("PACS")
                .prefix_separator("_")
                .separator("__")
                .source(Some(env.clone())),
        );

        for (var, key) in FLAT_ENDPOINT_VARS {
            if let Some(value) = env.get(*var) {
                let value = value.trim();
                if key.ends_with("_port") {
                    let port: u16 = value
                        .parse()
                        .with_context(|| format!("{} 必须是 1-65535 之间的整数", var))?;
                    builder = builder.set_override(*key, i64::from(port))?;
                } else {
                    builder = builder.set_override(*key, value.to_string())?;
                }
            }
        }

        let settings = builder.build().context("配置加载失败")?;
        settings.try_deserialize().context("配置反序列化失败")
    }

    /// 获取配置
    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// 进程共享的端点存储
    pub fn endpoints(&self) -> EndpointStore {
        self.endpoints.clone()
    }

    /// 更新 PACS 端点
    ///
    /// 校验后发布新版本，只影响之后建立的关联；配置了文件路径时同时写回文件。
    pub async fn update_pacs_endpoint(&self, endpoint: PacsEndpoint) -> Result<u64> {
        let endpoint = normalize_endpoint(endpoint);
        endpoint.validate().context("PACS 端点配置无效")?;
        let version = self.endpoints.update(endpoint.clone())?;
        {
            let mut config = self.config.write().await;
            config.pacs = endpoint;
        }
        self.save_config().await?;
        Ok(version)
    }

    /// 保存配置到文件
    async fn save_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let config = self.config.read().await;
        let mut value = toml::Value::try_from(&*config).context("配置序列化失败")?;
        // 端点键统一写成小写，与环境变量覆盖使用的键一致
        if let Some(pacs) = value.get_mut("pacs").and_then(toml::Value::as_table_mut) {
            *pacs = std::mem::take(pacs)
                .into_iter()
                .map(|(key, v)| (key.to_lowercase(), v))
                .collect();
        }
        let content = toml::to_string_pretty(&value).context("配置序列化失败")?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content)
            .await
            .with_context(|| format!("无法写入配置文件 {}", path.display()))?;
        info!("配置已保存到 {}", path.display());
        Ok(())
    }

    /// 验证当前配置
    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}
