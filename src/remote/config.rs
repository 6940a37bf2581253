//! 远端存储配置

use serde::{Deserialize, Serialize};

use super::traits::DEFAULT_MAX_BATCH_SIZE;

/// Firestore 单次 commit 的硬上限
pub const FIRESTORE_COMMIT_LIMIT: usize = 500;

/// 远端存储提供商
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProvider {
    /// Firestore REST
    #[default]
    Firestore,
    /// 进程内存储（离线或测试）
    Memory,
}

impl std::fmt::Display for RemoteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteProvider::Firestore => write!(f, "Firestore"),
            RemoteProvider::Memory => write!(f, "Memory"),
        }
    }
}

fn default_api_base() -> String {
    "https://firestore.googleapis.com/v1".to_string()
}

fn default_page_size() -> usize {
    300
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_timeout_secs() -> u64 {
    30
}

/// 远端存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreConfig {
    #[serde(default)]
    pub provider: RemoteProvider,
    /// Firestore 项目 ID
    #[serde(default)]
    pub project_id: String,
    /// REST API 根地址
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// runQuery 分页大小
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            provider: RemoteProvider::default(),
            project_id: String::new(),
            api_base: default_api_base(),
            page_size: default_page_size(),
            max_batch_size: default_max_batch_size(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RemoteStoreConfig {
    /// 验证配置是否完整
    pub fn validate(&self) -> Result<(), String> {
        if self.max_batch_size == 0 || self.max_batch_size > FIRESTORE_COMMIT_LIMIT {
            return Err(format!(
                "max_batch_size 必须在 1..={} 之间",
                FIRESTORE_COMMIT_LIMIT
            ));
        }
        match self.provider {
            RemoteProvider::Firestore => {
                if self.project_id.trim().is_empty() {
                    return Err("Firestore project_id 不能为空".into());
                }
                if url::Url::parse(self.api_base.trim()).is_err() {
                    return Err(format!("无效的 api_base: {}", self.api_base));
                }
                if self.page_size == 0 {
                    return Err("page_size 不能为 0".into());
                }
                Ok(())
            }
            RemoteProvider::Memory => Ok(()),
        }
    }
}
