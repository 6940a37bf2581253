//! 本地存储适配层
//!
//! 定义本地日程存储与同步水位线存储的接口，以及基于 SQLite 的默认实现。

mod sqlite;

pub use sqlite::{ScheduleDatabase, SchedulePool, SchedulePooledConnection};

use crate::models::{DateRange, ScheduleItem, Timestamp};
use async_trait::async_trait;
use thiserror::Error;

/// 数据库文件名
pub const DATABASE_FILENAME: &str = "schedules.db";

/// 水位线在 `sync_state` 表中的键
pub const LAST_SYNC_TIME_KEY: &str = "LastSyncTime";

/// 本地存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite 错误
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// 连接池错误
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 条目不存在
    #[error("Item not found: {0}")]
    NotFound(String),

    /// 试图用更旧的 updatedAt 覆盖
    #[error("Stale update for {id}: stored {stored} is newer than {incoming}")]
    Stale {
        id: String,
        stored: String,
        incoming: String,
    },

    /// 条目不满足不变量
    #[error("Invalid item: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 本地日程存储
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// 按日期范围列出条目（包含软删除条目）
    async fn list_items(&self, range: DateRange) -> StoreResult<Vec<ScheduleItem>>;

    /// 按日期范围列出未删除条目
    async fn list_visible_items(&self, range: DateRange) -> StoreResult<Vec<ScheduleItem>> {
        Ok(self
            .list_items(range)
            .await?
            .into_iter()
            .filter(|item| !item.deleted)
            .collect())
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<ScheduleItem>>;

    async fn create_item(&self, item: ScheduleItem) -> StoreResult<ScheduleItem>;

    /// 整条替换
    async fn update_item(&self, id: &str, item: ScheduleItem) -> StoreResult<ScheduleItem>;

    async fn soft_delete_item(&self, id: &str) -> StoreResult<()>;
}

/// 同步水位线存储
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn load_last_sync_time(&self) -> StoreResult<Option<Timestamp>>;

    async fn save_last_sync_time(&self, t: Timestamp) -> StoreResult<()>;
}
