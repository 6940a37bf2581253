//! 消息日志分块上传
//!
//! 只做本地 → 远端的单向推送。远端已存的最大消息 id 即水位线，
//! 因此中途失败后再次调用会从远端水位线继续，不会重复上传。

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::SyncError;
use crate::message_source::MessageSource;
use crate::models::Message;
use crate::remote::{RemoteError, RemoteStore};
use crate::session::SessionProvider;

/// 进度回调：(已处理, 总数)
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// 上传配置
#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// 每块条数
    pub chunk_size: usize,
    /// 每块最大重试次数
    pub max_retries: usize,
    /// 首次重试等待（之后指数翻倍）
    pub initial_backoff: Duration,
    /// 块间间隔
    pub inter_chunk_delay: Duration,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            inter_chunk_delay: Duration::from_secs(2),
        }
    }
}

/// 上传结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOutcome {
    /// 开始前远端的最大消息 id
    pub start_after: Option<i64>,
    pub uploaded: u64,
    pub total: u64,
    pub chunks: usize,
}

/// 分块上传器
pub struct ChunkedUploader {
    source: Arc<dyn MessageSource>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
    config: UploaderConfig,
}

impl ChunkedUploader {
    pub fn new(
        source: Arc<dyn MessageSource>,
        remote: Arc<dyn RemoteStore>,
        session: Arc<dyn SessionProvider>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            source,
            remote,
            session,
            config,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.initial_backoff)
            .with_max_times(self.config.max_retries)
    }

    fn chunk_size(&self) -> usize {
        self.config
            .chunk_size
            .min(self.remote.max_batch_size())
            .max(1)
    }

    /// 推送远端尚未存储的新消息
    pub async fn push_new_messages(
        &self,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<UploadOutcome, SyncError> {
        let user = self
            .session
            .current_user()
            .ok_or_else(|| SyncError::Auth("no signed-in user".into()))?;
        let chunk_size = self.chunk_size();

        let remote = &self.remote;
        let user_ref = &user;
        let latest = (|| async move { remote.query_latest_messages(user_ref, 1).await })
            .retry(&self.backoff())
            .when(RemoteError::is_transient)
            .notify(|err: &RemoteError, dur: Duration| {
                warn!("[Uploader] Watermark query failed, retrying in {:?}: {}", dur, err);
            })
            .await?;
        let watermark = latest.first().map(|m| m.id);

        let first_page = self.source.read_messages(watermark, chunk_size, 0).await?;
        let total = first_page.total_count.max(0) as u64;
        let mut outcome = UploadOutcome {
            start_after: watermark,
            total,
            ..Default::default()
        };

        if total == 0 {
            debug!("[Uploader] No new messages after {:?}", watermark);
            on_progress(0, 0);
            return Ok(outcome);
        }
        info!(
            "[Uploader] Uploading {} messages after id {:?} in chunks of {}",
            total, watermark, chunk_size
        );

        let mut page: Vec<Message> = first_page.messages;
        loop {
            if page.is_empty() {
                // 计数快照已过期：仍给调用方一个终止信号
                if outcome.chunks == 0 {
                    debug!("[Uploader] Count was {} but no rows were returned", total);
                    on_progress(0, total);
                }
                break;
            }
            let chunk_len = page.len();
            let chunk = page.as_slice();
            (|| async move { remote.batch_write_messages(user_ref, chunk).await })
                .retry(&self.backoff())
                .when(RemoteError::is_transient)
                .notify(|err: &RemoteError, dur: Duration| {
                    warn!("[Uploader] Chunk failed, retrying in {:?}: {}", dur, err);
                })
                .await
                .map_err(|e| SyncError::batch_failure(outcome.uploaded as usize, e))?;

            outcome.uploaded += chunk_len as u64;
            outcome.chunks += 1;
            on_progress(outcome.uploaded, total);

            if chunk_len < chunk_size || outcome.uploaded >= total {
                break;
            }
            tokio::time::sleep(self.config.inter_chunk_delay).await;
            page = self
                .source
                .read_messages(watermark, chunk_size, outcome.uploaded as usize)
                .await?
                .messages;
        }

        info!(
            "[Uploader] Uploaded {}/{} messages in {} chunks",
            outcome.uploaded, total, outcome.chunks
        );
        Ok(outcome)
    }
}
