//! RemoteStore trait 定义
//!
//! 多设备共享的远端存储接口。所有调用都以 [`UserSession`] 限定作用域，
//! 文档位于 `users/{uid}/{collection}` 下。

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Message, ScheduleItem, Timestamp};
use crate::session::UserSession;

/// 日程集合
pub const EVENTS_COLLECTION: &str = "events";
/// 消息集合
pub const MESSAGES_COLLECTION: &str = "messages";

/// 默认单批写入上限（Firestore 单次 commit 上限为 500）
pub const DEFAULT_MAX_BATCH_SIZE: usize = 450;

/// 远端适配层错误
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// 认证失败（401/403）
    #[error("Remote authentication failed: {0}")]
    Auth(String),

    /// 可重试的网络或服务端错误
    #[error("Transient remote failure: {0}")]
    Transient(String),

    /// 不可重试的拒绝
    #[error("Remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// 响应无法解析
    #[error("Failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// 旧版集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LegacyCollection {
    Todos,
    Schedules,
}

impl LegacyCollection {
    pub fn collection_id(&self) -> &'static str {
        match self {
            LegacyCollection::Todos => "todos",
            LegacyCollection::Schedules => "schedules",
        }
    }
}

/// 统一的远端存储访问 trait
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 获取后端名称（用于日志）
    fn provider_name(&self) -> &'static str;

    /// 单批写入上限
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH_SIZE
    }

    /// 读取日程条目
    ///
    /// `updated_after` 为 None 时返回全部条目，否则只返回 `updatedAt` 严格大于它的条目。
    async fn query_items(
        &self,
        user: &UserSession,
        updated_after: Option<Timestamp>,
    ) -> Result<Vec<ScheduleItem>>;

    /// 批量写入日程条目（整批成功或整批失败）
    async fn batch_write(&self, user: &UserSession, items: &[ScheduleItem]) -> Result<()>;

    /// 按 id 降序读取最新消息
    async fn query_latest_messages(&self, user: &UserSession, limit: usize)
        -> Result<Vec<Message>>;

    /// 批量写入消息（以 id 为文档键）
    async fn batch_write_messages(&self, user: &UserSession, messages: &[Message]) -> Result<()>;

    /// 读取旧版集合原始记录
    async fn query_legacy(
        &self,
        user: &UserSession,
        collection: LegacyCollection,
    ) -> Result<Vec<serde_json::Value>>;
}
