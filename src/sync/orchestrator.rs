//! 对账编排
//!
//! 一次对账：读取本地全集 → 拉取远端增量 → 逐条判定并写入本地 → 分批推送本地变更。
//! 新水位线取对账开始时刻，只有整个对账成功后才由调用方持久化。

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::conflict::plan_reconciliation;
use super::emitter::ProgressEmitter;
use super::progress::SyncProgress;
use super::SyncError;
use crate::database::LocalStore;
use crate::models::{now_millis, ts, DateRange, ScheduleItem, Timestamp};
use crate::remote::{RemoteError, RemoteStore, DEFAULT_MAX_BATCH_SIZE};
use crate::session::{SessionProvider, UserSession};

/// 编排器配置
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// 单批推送上限（同时受远端上限约束）
    pub max_batch_size: usize,
    /// 可重试错误的最大重试次数
    pub max_retries: usize,
    /// 首次重试等待
    pub initial_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

/// 写入本地失败的条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub id: String,
    pub reason: String,
}

/// 一次对账的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    /// 新水位线（对账开始时刻）
    #[serde(with = "ts")]
    pub new_sync_time: Timestamp,
    /// 拉取到的远端条目数
    pub pulled: usize,
    /// 成功写入本地的条目数
    pub applied: usize,
    /// 推送到远端的条目数
    pub pushed: usize,
    /// 提交的批次数
    pub batches: usize,
    pub failed_items: Vec<ItemFailure>,
    /// 两端一致而跳过的条目数
    pub skipped_equal: usize,
}

/// 对账编排器
pub struct SyncOrchestrator {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
    config: OrchestratorConfig,
    emitter: Option<ProgressEmitter>,
}

impl SyncOrchestrator {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        session: Arc<dyn SessionProvider>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            local,
            remote,
            session,
            config,
            emitter: None,
        }
    }

    pub fn with_emitter(mut self, emitter: ProgressEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.initial_backoff)
            .with_max_times(self.config.max_retries)
    }

    fn batch_size(&self) -> usize {
        self.config
            .max_batch_size
            .min(self.remote.max_batch_size())
            .max(1)
    }

    fn emit(&self, progress: SyncProgress) {
        if let Some(emitter) = &self.emitter {
            emitter.emit(progress);
        }
    }

    /// 执行一次对账
    ///
    /// # 错误
    /// * `SyncError::Auth` - 未登录或令牌被拒绝
    /// * `SyncError::TransientNetwork` - 拉取重试后仍失败
    /// * `SyncError::BatchCommit` - 推送批次重试后仍失败
    pub async fn run_reconciliation(
        &self,
        last_sync_time: Option<Timestamp>,
    ) -> Result<ReconcileOutcome, SyncError> {
        let user = self
            .session
            .current_user()
            .ok_or_else(|| SyncError::Auth("no signed-in user".into()))?;
        let started_at = now_millis();

        info!(
            "[Sync] Reconciliation started (since={})",
            last_sync_time
                .map(crate::models::format_timestamp)
                .unwrap_or_else(|| "<none>".into())
        );

        let local_items = self.local.list_items(DateRange::all()).await?;

        self.emit(SyncProgress::pulling());
        let remote_items = self.pull(&user, last_sync_time).await?;

        let plan = plan_reconciliation(&local_items, &remote_items, last_sync_time);
        debug!(
            "[Sync] Plan: local={} pulled={} apply={} push={} equal={}",
            local_items.len(),
            remote_items.len(),
            plan.to_apply.len(),
            plan.to_push.len(),
            plan.skipped_equal
        );

        let local_ids: HashSet<&str> = local_items.iter().map(|i| i.id.as_str()).collect();
        let total_apply = plan.to_apply.len() as u64;
        let mut applied = 0;
        let mut failed_items = Vec::new();
        for (index, item) in plan.to_apply.iter().enumerate() {
            match self.apply_remote(item, local_ids.contains(item.id.as_str())).await {
                Ok(()) => applied += 1,
                Err(SyncError::ItemApply { id, reason }) => {
                    warn!("[Sync] Failed to apply {} locally (skipped): {}", id, reason);
                    failed_items.push(ItemFailure { id, reason });
                }
                Err(other) => return Err(other),
            }
            self.emit(
                SyncProgress::applying(index as u64 + 1, total_apply).with_current_item(&item.id),
            );
        }

        let (pushed, batches) = self.push(&user, &plan.to_push).await?;

        let outcome = ReconcileOutcome {
            new_sync_time: started_at,
            pulled: remote_items.len(),
            applied,
            pushed,
            batches,
            failed_items,
            skipped_equal: plan.skipped_equal,
        };
        info!(
            "[Sync] Reconciliation finished: pulled={} applied={} pushed={} batches={} failed={}",
            outcome.pulled,
            outcome.applied,
            outcome.pushed,
            outcome.batches,
            outcome.failed_items.len()
        );
        Ok(outcome)
    }

    async fn pull(
        &self,
        user: &UserSession,
        last_sync_time: Option<Timestamp>,
    ) -> Result<Vec<ScheduleItem>, SyncError> {
        let remote = &self.remote;
        let items = (|| async move { remote.query_items(user, last_sync_time).await })
            .retry(&self.backoff())
            .when(RemoteError::is_transient)
            .notify(|err: &RemoteError, dur: Duration| {
                warn!("[Sync] Pull failed, retrying in {:?}: {}", dur, err);
            })
            .await?;
        Ok(items)
    }

    async fn apply_remote(&self, item: &ScheduleItem, exists_locally: bool) -> Result<(), SyncError> {
        let result = if exists_locally {
            self.local.update_item(&item.id, item.clone()).await
        } else {
            self.local.create_item(item.clone()).await
        };
        result.map(|_| ()).map_err(|e| SyncError::ItemApply {
            id: item.id.clone(),
            reason: e.to_string(),
        })
    }

    /// 分批推送，返回 (推送条数, 批次数)
    async fn push(
        &self,
        user: &UserSession,
        items: &[ScheduleItem],
    ) -> Result<(usize, usize), SyncError> {
        if items.is_empty() {
            return Ok((0, 0));
        }

        let total = items.len() as u64;
        let mut committed = 0;
        let mut batches = 0;
        for chunk in items.chunks(self.batch_size()) {
            let remote = &self.remote;
            (|| async move { remote.batch_write(user, chunk).await })
                .retry(&self.backoff())
                .when(RemoteError::is_transient)
                .notify(|err: &RemoteError, dur: Duration| {
                    warn!("[Sync] Batch commit failed, retrying in {:?}: {}", dur, err);
                })
                .await
                .map_err(|e| SyncError::batch_failure(committed, e))?;

            committed += chunk.len();
            batches += 1;
            self.emit(SyncProgress::pushing(committed as u64, total));
        }
        Ok((committed, batches))
    }
}
