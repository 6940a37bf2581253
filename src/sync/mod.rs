//! 同步模块
//!
//! - `conflict`: 按 `updatedAt` 的整条记录 LWW 判定
//! - `orchestrator`: 一次完整的拉取 / 判定 / 推送对账
//! - `uploader`: 消息日志的分块上传
//! - `engine`: 应用层的一次同步（水位线、通知、消息上传、状态发布）
//! - `scheduler`: 定时、去抖与手动触发，保证同一时间只有一次同步
//! - `migration`: 旧版 `todos` / `schedules` 集合迁移

pub mod conflict;
pub mod emitter;
pub mod engine;
pub mod migration;
pub mod orchestrator;
pub mod progress;
pub mod scheduler;
pub mod uploader;

pub use conflict::{plan_reconciliation, resolve, ReconcilePlan, Resolution};
pub use emitter::ProgressEmitter;
pub use engine::{EngineDeps, PassMode, PassReport, SyncEngine, SyncStatus};
pub use migration::migrate_legacy_collections;
pub use orchestrator::{ItemFailure, OrchestratorConfig, ReconcileOutcome, SyncOrchestrator};
pub use progress::{SpeedCalculator, SyncPhase, SyncProgress};
pub use scheduler::{SchedulerConfig, SchedulerHandle, SyncRunner, TriggerScheduler};
pub use uploader::{ChunkedUploader, ProgressFn, UploadOutcome, UploaderConfig};

use thiserror::Error;

use crate::database::StoreError;
use crate::message_source::SourceError;
use crate::remote::RemoteError;

/// 同步错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 未登录或令牌被拒绝
    #[error("Not authenticated: {0}")]
    Auth(String),

    /// 重试后仍失败的网络错误
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// 单条目写入本地失败（不会中止同步）
    #[error("Failed to apply item {id}: {reason}")]
    ItemApply { id: String, reason: String },

    /// 批量提交失败；`committed` 为此前已提交的记录数
    #[error("Batch commit failed after {committed} committed records: {cause}")]
    BatchCommit { committed: usize, cause: String },

    /// 不可重试的远端拒绝
    #[error("Remote rejected request: {0}")]
    Remote(String),

    #[error("Local store error: {0}")]
    Local(#[from] StoreError),

    #[error("Message source error: {0}")]
    Source(String),

    /// 已有同步在运行
    #[error("A sync pass is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Auth(msg) => SyncError::Auth(msg),
            RemoteError::Transient(msg) => SyncError::TransientNetwork(msg),
            other @ (RemoteError::Rejected { .. } | RemoteError::Decode(_)) => {
                SyncError::Remote(other.to_string())
            }
        }
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        SyncError::Source(err.to_string())
    }
}

impl SyncError {
    /// 将批次失败的远端错误映射为同步错误（认证失败保持原样）
    pub(crate) fn batch_failure(committed: usize, err: RemoteError) -> Self {
        match err {
            RemoteError::Auth(msg) => SyncError::Auth(msg),
            other => SyncError::BatchCommit {
                committed,
                cause: other.to_string(),
            },
        }
    }
}
