//! 运行配置
//!
//! 来源优先级（后者覆盖前者）：内置默认值 → TOML 文件 → `SCHEDULE_SYNC_*` 环境变量。
//! 嵌套字段用 `__` 分隔，例如 `SCHEDULE_SYNC_REMOTE__PROJECT_ID`。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::remote::RemoteStoreConfig;
use crate::session::{StaticSession, UserSession};
use crate::sync::{OrchestratorConfig, SchedulerConfig, UploaderConfig};

pub const ENV_PREFIX: &str = "SCHEDULE_SYNC";
/// 当前目录下的默认配置文件名（不含扩展名）
pub const DEFAULT_CONFIG_NAME: &str = "schedule-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("schedule-sync")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub uid: Option<String>,
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub interval_secs: u64,
    pub debounce_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            debounce_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderSection {
    pub chunk_size: usize,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub inter_chunk_delay_ms: u64,
}

impl Default for UploaderSection {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_retries: 3,
            initial_backoff_ms: 2000,
            inter_chunk_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_batch_size: usize,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_batch_size: crate::remote::DEFAULT_MAX_BATCH_SIZE,
            max_retries: 3,
            initial_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherSection {
    /// 文件事件之外的兜底探测间隔
    pub fallback_poll_secs: u64,
}

impl Default for WatcherSection {
    fn default() -> Self {
        Self {
            fallback_poll_secs: 60,
        }
    }
}

/// 完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 本地数据库所在目录
    pub data_dir: PathBuf,
    /// 外部消息库（UDB）路径；未配置时不上传消息
    pub udb_path: Option<PathBuf>,
    pub remote: RemoteStoreConfig,
    pub session: SessionSection,
    pub scheduler: SchedulerSection,
    pub uploader: UploaderSection,
    pub orchestrator: OrchestratorSection,
    pub watcher: WatcherSection,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            udb_path: None,
            remote: RemoteStoreConfig::default(),
            session: SessionSection::default(),
            scheduler: SchedulerSection::default(),
            uploader: UploaderSection::default(),
            orchestrator: OrchestratorSection::default(),
            watcher: WatcherSection::default(),
        }
    }
}

impl SyncConfig {
    /// 读取 `.env`、配置文件与环境变量
    ///
    /// 显式传入的文件必须存在；未传入时尝试当前目录下的 `schedule-sync.toml`。
    pub fn from_env_and_file(file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        match file {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::MissingFile(path.to_path_buf()));
                }
                info!("[Config] Loading {}", path.display());
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                builder = builder
                    .add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false));
            }
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: SyncConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        debug!("[Config] data_dir={}", loaded.data_dir.display());
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uploader.chunk_size == 0 {
            return Err(ConfigError::Invalid("uploader.chunk_size must be > 0".into()));
        }
        if self.orchestrator.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.max_batch_size must be > 0".into(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.interval_secs must be > 0".into(),
            ));
        }
        if self.watcher.fallback_poll_secs == 0 {
            return Err(ConfigError::Invalid(
                "watcher.fallback_poll_secs must be > 0".into(),
            ));
        }
        self.remote.validate().map_err(ConfigError::Invalid)
    }

    /// 配置中的登录态（uid 与令牌都存在时视为已登录）
    pub fn session(&self) -> StaticSession {
        let user = match (&self.session.uid, &self.session.id_token) {
            (Some(uid), Some(token)) if !uid.is_empty() && !token.is_empty() => {
                Some(UserSession::new(uid.clone(), token.clone()))
            }
            _ => None,
        };
        StaticSession::new(user)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.scheduler.interval_secs),
            debounce: Duration::from_secs(self.scheduler.debounce_secs),
        }
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig {
            chunk_size: self.uploader.chunk_size,
            max_retries: self.uploader.max_retries,
            initial_backoff: Duration::from_millis(self.uploader.initial_backoff_ms),
            inter_chunk_delay: Duration::from_millis(self.uploader.inter_chunk_delay_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_batch_size: self.orchestrator.max_batch_size,
            max_retries: self.orchestrator.max_retries,
            initial_backoff: Duration::from_millis(self.orchestrator.initial_backoff_ms),
        }
    }

    pub fn watcher_fallback_interval(&self) -> Duration {
        Duration::from_secs(self.watcher.fallback_poll_secs)
    }
}
