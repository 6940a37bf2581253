//! 共享状态存储
//!
//! 各窗口 / 组件共享的键值状态，写入时在总线上广播 `state-changed`。

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::events::{EventPayload, NotificationBus, Subscription, STATE_CHANGED};

/// 同步状态快照的键
pub const SYNC_STATUS_KEY: &str = "syncStatus";

const STATE_SOURCE: &str = "state";

pub struct StateStore {
    values: RwLock<HashMap<String, Value>>,
    bus: Arc<dyn NotificationBus>,
}

impl StateStore {
    pub fn new(bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(key)
            .cloned()
    }

    /// 读取并反序列化
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    /// 写入并广播 `state-changed`
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.values
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), value);
        self.bus.emit(
            STATE_CHANGED,
            EventPayload::from_source(STATE_SOURCE).with_data(json!({ "key": key })),
        );
        Ok(())
    }

    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe(STATE_CHANGED)
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
