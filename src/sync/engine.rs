//! 同步引擎
//!
//! 应用视角的一次完整同步：
//! 1. 读取水位线
//! 2. 对账
//! 3. 持久化新水位线
//! 4. 发出带 `self` 标记的 `schedule-changed`
//! 5. 上传新消息（配置了消息源时）
//! 6. 将状态快照写入共享状态存储

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use super::emitter::ProgressEmitter;
use super::orchestrator::{OrchestratorConfig, ReconcileOutcome, SyncOrchestrator};
use super::progress::{SpeedCalculator, SyncProgress};
use super::uploader::{ChunkedUploader, ProgressFn, UploadOutcome, UploaderConfig};
use super::SyncError;
use crate::database::{LocalStore, WatermarkStore};
use crate::events::{EventPayload, NotificationBus, SCHEDULE_CHANGED, SELF_SOURCE};
use crate::message_source::MessageSource;
use crate::models::{ts, Timestamp};
use crate::remote::RemoteStore;
use crate::session::SessionProvider;
use crate::state_store::{StateStore, SYNC_STATUS_KEY};

/// 同步方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassMode {
    /// 自动触发：失败只记日志
    Silent,
    /// 用户触发：进度与错误返回给调用方
    Manual,
}

/// 发布到状态存储的同步状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub syncing: bool,
    #[serde(default, with = "ts::option")]
    pub last_sync_time: Option<Timestamp>,
    pub last_error: Option<String>,
    pub last_outcome: Option<ReconcileOutcome>,
    pub last_upload: Option<UploadOutcome>,
}

/// 一次同步的结果
#[derive(Debug, Clone)]
pub struct PassReport {
    pub reconcile: ReconcileOutcome,
    pub upload: Option<UploadOutcome>,
}

/// 引擎依赖
pub struct EngineDeps {
    pub local: Arc<dyn LocalStore>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub session: Arc<dyn SessionProvider>,
    pub bus: Arc<dyn NotificationBus>,
    pub state: Arc<StateStore>,
    pub source: Option<Arc<dyn MessageSource>>,
}

pub struct SyncEngine {
    orchestrator: SyncOrchestrator,
    uploader: Option<ChunkedUploader>,
    watermarks: Arc<dyn WatermarkStore>,
    bus: Arc<dyn NotificationBus>,
    state: Arc<StateStore>,
    emitter: ProgressEmitter,
    status: Mutex<SyncStatus>,
}

impl SyncEngine {
    pub fn new(deps: EngineDeps, orchestrator: OrchestratorConfig, uploader: UploaderConfig) -> Self {
        let emitter = ProgressEmitter::new(Arc::clone(&deps.bus));
        let uploader = deps.source.map(|source| {
            ChunkedUploader::new(
                source,
                Arc::clone(&deps.remote),
                Arc::clone(&deps.session),
                uploader,
            )
        });
        Self {
            orchestrator: SyncOrchestrator::new(deps.local, deps.remote, deps.session, orchestrator)
                .with_emitter(emitter.clone()),
            uploader,
            watermarks: deps.watermarks,
            bus: deps.bus,
            state: deps.state,
            emitter,
            status: Mutex::new(SyncStatus::default()),
        }
    }

    /// 当前状态快照
    pub fn status(&self) -> SyncStatus {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut status);
            status.clone()
        };
        if let Err(e) = self.state.set(SYNC_STATUS_KEY, &snapshot) {
            error!("[Sync] Failed to publish sync status: {}", e);
        }
    }

    /// 执行一次完整同步
    ///
    /// 手动模式下 `on_progress` 会收到消息上传进度。
    pub async fn run_pass(
        &self,
        mode: PassMode,
        on_progress: Option<ProgressFn>,
    ) -> Result<PassReport, SyncError> {
        self.update_status(|s| s.syncing = true);
        self.emitter.emit_preparing();

        let result = self.run_inner(mode, on_progress).await;

        match &result {
            Ok(report) => {
                self.emitter.emit_completed();
                self.update_status(|s| {
                    s.syncing = false;
                    s.last_error = None;
                    s.last_upload = report.upload.clone();
                });
            }
            Err(e) => {
                match mode {
                    PassMode::Silent => warn!("[Sync] Silent sync failed: {}", e),
                    PassMode::Manual => error!("[Sync] Manual sync failed: {}", e),
                }
                self.emitter.emit_failed(e.to_string());
                let message = e.to_string();
                self.update_status(|s| {
                    s.syncing = false;
                    s.last_error = Some(message);
                });
            }
        }
        result
    }

    async fn run_inner(
        &self,
        mode: PassMode,
        on_progress: Option<ProgressFn>,
    ) -> Result<PassReport, SyncError> {
        let last_sync_time = self.watermarks.load_last_sync_time().await?;
        let reconcile = self.orchestrator.run_reconciliation(last_sync_time).await?;

        self.watermarks
            .save_last_sync_time(reconcile.new_sync_time)
            .await?;
        self.update_status(|s| {
            s.last_sync_time = Some(reconcile.new_sync_time);
            s.last_outcome = Some(reconcile.clone());
        });

        self.bus.emit(
            SCHEDULE_CHANGED,
            EventPayload::from_source(SELF_SOURCE).with_data(json!({
                "applied": reconcile.applied,
                "pushed": reconcile.pushed,
            })),
        );

        let upload = match &self.uploader {
            Some(uploader) => {
                let emitter = self.emitter.clone();
                let speed = Mutex::new(SpeedCalculator::default_window());
                let caller = match mode {
                    PassMode::Manual => on_progress,
                    PassMode::Silent => None,
                };
                let forward = move |current: u64, total: u64| {
                    let mut progress = SyncProgress::uploading_messages(current, total);
                    {
                        let mut calc = speed.lock().unwrap_or_else(|p| p.into_inner());
                        calc.add_sample(current);
                        if let Some(rate) = calc.calculate_rate() {
                            progress = progress
                                .with_rate(rate, calc.calculate_eta(total.saturating_sub(current)));
                        }
                    }
                    emitter.emit(progress);
                    if let Some(cb) = &caller {
                        cb(current, total);
                    }
                };
                Some(uploader.push_new_messages(&forward).await?)
            }
            None => None,
        };

        info!(
            "[Sync] Pass complete: applied={} pushed={} messages={}",
            reconcile.applied,
            reconcile.pushed,
            upload.as_ref().map_or(0, |u| u.uploaded)
        );
        Ok(PassReport { reconcile, upload })
    }
}
