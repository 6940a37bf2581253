//! 进度事件发射器
//!
//! 将同步进度发布到通知总线的 `sync-progress` 主题，支持节流以避免过于频繁的更新。

use super::progress::{SyncPhase, SyncProgress};
use crate::events::{EventPayload, NotificationBus, SELF_SOURCE, SYNC_PROGRESS};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// 节流间隔（毫秒）
const THROTTLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ThrottleState {
    last_emit: Option<Instant>,
    last_phase: Option<SyncPhase>,
}

/// 进度发射器
///
/// 阶段变化或进入终止状态时强制发送，其余情况按节流间隔限流。
#[derive(Clone)]
pub struct ProgressEmitter {
    bus: Arc<dyn NotificationBus>,
    state: Arc<Mutex<ThrottleState>>,
}

impl ProgressEmitter {
    pub fn new(bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            bus,
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    /// 发射进度事件（带节流），返回是否实际发出
    pub fn emit(&self, progress: SyncProgress) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let phase_changed = state.last_phase.map_or(true, |p| p != progress.phase);
        let throttled = match state.last_emit {
            Some(last) => now.duration_since(last) < THROTTLE_INTERVAL,
            None => false,
        };
        if !phase_changed && !progress.phase.is_terminal() && throttled {
            return false;
        }

        state.last_emit = Some(now);
        state.last_phase = Some(progress.phase);
        drop(state);
        self.do_emit(&progress);
        true
    }

    pub fn emit_preparing(&self) {
        self.emit(SyncProgress::preparing());
    }

    pub fn emit_completed(&self) {
        self.emit(SyncProgress::completed());
    }

    pub fn emit_failed(&self, error: impl Into<String>) {
        self.emit(SyncProgress::failed(error));
    }

    fn do_emit(&self, progress: &SyncProgress) {
        match serde_json::to_value(progress) {
            Ok(data) => {
                self.bus.emit(
                    SYNC_PROGRESS,
                    EventPayload::from_source(SELF_SOURCE).with_data(data),
                );
                tracing::trace!(
                    "[sync_emitter] 进度事件: phase={:?}, percent={:.1}%, current={}/{}",
                    progress.phase,
                    progress.percent,
                    progress.current,
                    progress.total
                );
            }
            Err(e) => tracing::error!("[sync_emitter] 序列化进度事件失败: {}", e),
        }
    }
}
