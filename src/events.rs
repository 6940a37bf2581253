//! 进程内通知总线
//!
//! 基于 `tokio::sync::broadcast` 的发布/订阅。事件携带可选的 `source` 标记，
//! 同步引擎自身发出的事件标记为 [`SELF_SOURCE`]，调度器据此忽略自己触发的通知。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// 日程数据已变化
pub const SCHEDULE_CHANGED: &str = "schedule-changed";
/// 外部消息源有新数据
pub const MESSAGE_SOURCE_CHANGED: &str = "message-source-changed";
/// 同步进度
pub const SYNC_PROGRESS: &str = "sync-progress";
/// 共享状态已更新
pub const STATE_CHANGED: &str = "state-changed";

/// 同步引擎自身发出的事件来源标记
pub const SELF_SOURCE: &str = "self";

const DEFAULT_CAPACITY: usize = 256;

/// 事件负载
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl EventPayload {
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// 是否由同步引擎自身发出
    pub fn is_self(&self) -> bool {
        self.source.as_deref() == Some(SELF_SOURCE)
    }
}

/// 总线上传递的事件
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: EventPayload,
}

/// 事件处理函数
pub type EventHandler = Box<dyn Fn(EventPayload) + Send + Sync>;

/// 单主题订阅
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<Event>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 等待下一条本主题事件；总线关闭时返回 None
    pub async fn recv(&mut self) -> Option<EventPayload> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.topic == self.topic => return Some(event.payload),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "[Events] Subscriber of '{}' lagged, {} events dropped",
                        self.topic, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// 非阻塞读取
    pub fn try_recv(&mut self) -> Option<EventPayload> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if event.topic == self.topic => return Some(event.payload),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// 通知总线
pub trait NotificationBus: Send + Sync {
    fn emit(&self, topic: &str, payload: EventPayload);

    fn subscribe(&self, topic: &str) -> Subscription;

    /// 订阅并在后台任务中逐条调用 handler
    fn subscribe_with(&self, topic: &str, handler: EventHandler) -> JoinHandle<()> {
        let mut subscription = self.subscribe(topic);
        tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                handler(payload);
            }
        })
    }
}

/// 基于 broadcast channel 的总线
pub struct BroadcastBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationBus for BroadcastBus {
    fn emit(&self, topic: &str, payload: EventPayload) {
        let event = Event {
            topic: topic.to_string(),
            payload,
        };
        if self.tx.send(event).is_err() {
            trace!("[Events] No subscribers for '{}'", topic);
        }
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            topic: topic.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscription_filters_topics() {
        let bus = BroadcastBus::default();
        let mut sub = bus.subscribe(SCHEDULE_CHANGED);

        bus.emit(SYNC_PROGRESS, EventPayload::default());
        bus.emit(
            SCHEDULE_CHANGED,
            EventPayload::from_source(SELF_SOURCE).with_data(json!({ "n": 1 })),
        );

        let payload = sub.recv().await.unwrap();
        assert!(payload.is_self());
        assert_eq!(payload.data, Some(json!({ "n": 1 })));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_ok() {
        let bus = BroadcastBus::new(4);
        bus.emit(SCHEDULE_CHANGED, EventPayload::default());
    }

    #[tokio::test]
    async fn test_subscribe_with_handler() {
        let bus = BroadcastBus::default();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let handle = bus.subscribe_with(
            MESSAGE_SOURCE_CHANGED,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit(MESSAGE_SOURCE_CHANGED, EventPayload::from_source("watcher"));
        bus.emit(MESSAGE_SOURCE_CHANGED, EventPayload::from_source("watcher"));

        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        handle.abort();
    }
}
