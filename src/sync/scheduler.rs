//! 同步触发调度
//!
//! 状态只有 Idle / Running 两种，同一时间最多一次同步：
//! - 定时器触发：Idle 时静默同步，Running 时丢弃
//! - 外部变更信号：去抖后静默同步（每次信号重置同一个定时句柄）
//! - `schedule-changed` 通知：`source == "self"` 时忽略，否则视为外部变更
//! - 手动请求：Idle 时立即执行并返回结果，Running 时返回 `AlreadyRunning`（不排队）

use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{PassMode, SyncEngine};
use super::uploader::ProgressFn;
use super::SyncError;
use crate::events::{
    EventPayload, NotificationBus, Subscription, MESSAGE_SOURCE_CHANGED, SCHEDULE_CHANGED,
};

/// 可被调度的同步执行者
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self, mode: PassMode, on_progress: Option<ProgressFn>) -> Result<(), SyncError>;
}

#[async_trait]
impl SyncRunner for SyncEngine {
    async fn run(&self, mode: PassMode, on_progress: Option<ProgressFn>) -> Result<(), SyncError> {
        self.run_pass(mode, on_progress).await.map(|_| ())
    }
}

/// 调度配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 定时同步间隔
    pub interval: Duration,
    /// 外部变更去抖时长
    pub debounce: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            debounce: Duration::from_secs(5),
        }
    }
}

// 离开作用域时恢复 Idle
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TriggerScheduler {
    runner: Arc<dyn SyncRunner>,
    config: SchedulerConfig,
    running: AtomicBool,
    debounce: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TriggerScheduler {
    pub fn new(runner: Arc<dyn SyncRunner>, config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            runner,
            config,
            running: AtomicBool::new(false),
            debounce: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> Option<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(&self.running))
    }

    /// 静默同步；Running 时丢弃，返回是否实际执行
    pub async fn trigger_silent(&self) -> bool {
        let Some(_guard) = self.try_acquire() else {
            debug!("[Scheduler] Sync already running, dropping automatic trigger");
            return false;
        };
        if let Err(e) = self.runner.run(PassMode::Silent, None).await {
            warn!("[Scheduler] Automatic sync failed: {}", e);
        }
        true
    }

    /// 手动同步
    pub async fn request_manual(&self, on_progress: Option<ProgressFn>) -> Result<(), SyncError> {
        let Some(_guard) = self.try_acquire() else {
            return Err(SyncError::AlreadyRunning);
        };
        info!("[Scheduler] Manual sync requested");
        self.runner.run(PassMode::Manual, on_progress).await
    }

    /// 外部变更信号：重置去抖定时器
    pub fn notify_external_change(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();
        let delay = self.config.debounce;

        let mut slot = self.debounce.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // 同步放到独立任务中，重新去抖时 abort 不会中断进行中的同步
                    tokio::spawn(async move {
                        scheduler.trigger_silent().await;
                    });
                }
            }
        }));
    }

    /// 处理 `schedule-changed` 通知
    pub fn handle_schedule_changed(self: &Arc<Self>, payload: &EventPayload) {
        if payload.is_self() {
            debug!("[Scheduler] Ignoring self-originated schedule change");
            return;
        }
        self.notify_external_change();
    }

    /// 启动定时器与总线监听
    pub fn start(self: &Arc<Self>, bus: &dyn NotificationBus) -> SchedulerHandle {
        let mut tasks = Vec::new();
        tasks.push(self.spawn_timer());
        // 先订阅再启动任务，避免错过启动后的第一条通知
        tasks.push(self.spawn_listener(bus.subscribe(SCHEDULE_CHANGED)));
        tasks.push(self.spawn_listener(bus.subscribe(MESSAGE_SOURCE_CHANGED)));
        info!(
            "[Scheduler] Started (interval={:?}, debounce={:?})",
            self.config.interval, self.config.debounce
        );
        SchedulerHandle {
            scheduler: Arc::clone(self),
            tasks,
        }
    }

    fn spawn_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        debug!("[Scheduler] Periodic trigger");
                        scheduler.trigger_silent().await;
                    }
                }
            }
        })
    }

    fn spawn_listener(self: &Arc<Self>, mut subscription: Subscription) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let cancel = self.cancel.clone();
        let is_schedule_topic = subscription.topic() == SCHEDULE_CHANGED;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    payload = subscription.recv() => match payload {
                        Some(payload) if is_schedule_topic => {
                            scheduler.handle_schedule_changed(&payload);
                        }
                        Some(_) => scheduler.notify_external_change(),
                        None => break,
                    },
                }
            }
        })
    }

    fn shutdown_inner(&self) {
        self.cancel.cancel();
        if let Some(pending) = self
            .debounce
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            pending.abort();
        }
    }
}

/// 运行中的调度器句柄
pub struct SchedulerHandle {
    scheduler: Arc<TriggerScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &Arc<TriggerScheduler> {
        &self.scheduler
    }

    /// 停止定时器、去抖句柄与总线监听（不会中断正在进行的同步）
    pub async fn shutdown(self) {
        self.scheduler.shutdown_inner();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("[Scheduler] Task ended abnormally: {}", e);
                }
            }
        }
        info!("[Scheduler] Stopped");
    }
}
