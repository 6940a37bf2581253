//! 消息源监视
//!
//! 监听消息库 `-wal` 文件的创建与修改事件，事件到达时探测最新 id；另有一个
//! 较长的兜底间隔定期探测，覆盖文件事件丢失或无法注册监听的情况。
//! 首次成功探测作为基线，之后出现更大的 id 时在总线上发出 `message-source-changed`。

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{EventPayload, NotificationBus, MESSAGE_SOURCE_CHANGED};
use crate::message_source::MessageSource;

/// 事件来源标记
pub const WATCHER_SOURCE: &str = "watcher";

/// 消息库对应的 WAL 文件路径（`<udb>-wal`）
pub fn wal_path_for(udb_path: &Path) -> PathBuf {
    let mut raw = OsString::from(udb_path.as_os_str());
    raw.push("-wal");
    PathBuf::from(raw)
}

/// 文件事件是否表示 WAL 文件被创建或写入
///
/// 离线时 WAL 文件可能不存在，此时的事件一律忽略。
pub fn is_wal_change(event: &Event, wal_path: &Path) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }
    let Some(wal_name) = wal_path.file_name() else {
        return false;
    };
    event
        .paths
        .iter()
        .any(|p| p == wal_path || p.file_name() == Some(wal_name))
        && wal_path.exists()
}

/// 监听 WAL 所在目录，事件转发到 tokio 通道
///
/// 监听目录而非文件本身，WAL 被删除后重新创建时仍能收到事件。
fn watch_wal_dir(
    wal_path: &Path,
    tx: UnboundedSender<Event>,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.send(event);
        }
        Err(e) => warn!("[Watcher] File watch error: {}", e),
    })?;
    let dir = wal_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

pub struct MessageSourceWatcher {
    source: Arc<dyn MessageSource>,
    bus: Arc<dyn NotificationBus>,
    fallback_interval: Duration,
    wal_path: Option<PathBuf>,
    /// None = 尚未成功探测
    baseline: Mutex<Option<Option<i64>>>,
}

impl MessageSourceWatcher {
    pub fn new(
        source: Arc<dyn MessageSource>,
        bus: Arc<dyn NotificationBus>,
        fallback_interval: Duration,
    ) -> Self {
        Self {
            source,
            bus,
            fallback_interval,
            wal_path: None,
            baseline: Mutex::new(None),
        }
    }

    /// 监听该消息库的 WAL 文件
    pub fn with_wal_of(mut self, udb_path: &Path) -> Self {
        self.wal_path = Some(wal_path_for(udb_path));
        self
    }

    /// 探测一次，返回是否发出了变更事件
    pub async fn probe(&self) -> bool {
        let latest = match self.source.latest_message_id().await {
            Ok(latest) => latest,
            Err(e) => {
                debug!("[Watcher] Probe failed (ignored): {}", e);
                return false;
            }
        };

        let changed = {
            let mut baseline = self.baseline.lock().unwrap_or_else(|p| p.into_inner());
            match *baseline {
                None => {
                    *baseline = Some(latest);
                    false
                }
                Some(known) if latest > known => {
                    *baseline = Some(latest);
                    true
                }
                Some(_) => false,
            }
        };

        if changed {
            info!("[Watcher] New messages detected (latest id {:?})", latest);
            self.bus.emit(
                MESSAGE_SOURCE_CHANGED,
                EventPayload::from_source(WATCHER_SOURCE)
                    .with_data(serde_json::json!({ "latestId": latest })),
            );
        }
        changed
    }

    /// 后台监视，直到 `cancel` 被触发
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // tx 在循环期间保持存活，未注册文件监听时通道不会关闭
            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            let _fs_watcher = self.wal_path.as_deref().and_then(|wal| {
                match watch_wal_dir(wal, tx.clone()) {
                    Ok(watcher) => {
                        info!("[Watcher] Watching {}", wal.display());
                        Some(watcher)
                    }
                    Err(e) => {
                        warn!(
                            "[Watcher] Cannot watch {} ({}), falling back to polling",
                            wal.display(),
                            e
                        );
                        None
                    }
                }
            });

            let mut ticker = tokio::time::interval(self.fallback_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe().await;
                    }
                    Some(event) = rx.recv() => {
                        let relevant = self
                            .wal_path
                            .as_deref()
                            .is_some_and(|wal| is_wal_change(&event, wal));
                        if relevant {
                            // 一次写入通常产生多个事件，合并为一次探测
                            while rx.try_recv().is_ok() {}
                            self.probe().await;
                        }
                    }
                }
            }
            drop(tx);
            warn!("[Watcher] Stopped");
        })
    }
}
