//! 进程内远端存储
//!
//! 与 Firestore 实现语义一致：按用户隔离、以 id 为文档键的整批写入、
//! 超过批量上限的写入会被拒绝。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::traits::{
    LegacyCollection, RemoteError, RemoteStore, Result, DEFAULT_MAX_BATCH_SIZE,
};
use crate::models::{Message, ScheduleItem, Timestamp};
use crate::session::UserSession;

#[derive(Default)]
struct UserData {
    items: BTreeMap<String, ScheduleItem>,
    messages: BTreeMap<i64, Message>,
    legacy: HashMap<LegacyCollection, Vec<serde_json::Value>>,
}

/// 内存远端存储
pub struct MemoryRemoteStore {
    users: Mutex<HashMap<String, UserData>>,
    max_batch_size: usize,
    item_batches: AtomicUsize,
    message_batches: AtomicUsize,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::with_max_batch_size(DEFAULT_MAX_BATCH_SIZE)
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_batch_size(max_batch_size: usize) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            max_batch_size: max_batch_size.max(1),
            item_batches: AtomicUsize::new(0),
            message_batches: AtomicUsize::new(0),
        }
    }

    fn with_user<T>(&self, uid: &str, f: impl FnOnce(&mut UserData) -> T) -> T {
        let mut users = self.users.lock().unwrap_or_else(|p| p.into_inner());
        f(users.entry(uid.to_string()).or_default())
    }

    /// 直接写入条目（不计入批次统计）
    pub fn seed_items(&self, uid: &str, items: impl IntoIterator<Item = ScheduleItem>) {
        self.with_user(uid, |data| {
            for item in items {
                data.items.insert(item.id.clone(), item);
            }
        });
    }

    pub fn seed_legacy(
        &self,
        uid: &str,
        collection: LegacyCollection,
        records: Vec<serde_json::Value>,
    ) {
        self.with_user(uid, |data| {
            data.legacy.entry(collection).or_default().extend(records);
        });
    }

    /// 当前全部条目（按 id 排序）
    pub fn items(&self, uid: &str) -> Vec<ScheduleItem> {
        self.with_user(uid, |data| data.items.values().cloned().collect())
    }

    pub fn item(&self, uid: &str, id: &str) -> Option<ScheduleItem> {
        self.with_user(uid, |data| data.items.get(id).cloned())
    }

    /// 当前全部消息（按 id 升序）
    pub fn messages(&self, uid: &str) -> Vec<Message> {
        self.with_user(uid, |data| data.messages.values().cloned().collect())
    }

    /// 已提交的日程批次数
    pub fn item_batch_count(&self) -> usize {
        self.item_batches.load(Ordering::SeqCst)
    }

    /// 已提交的消息批次数
    pub fn message_batch_count(&self) -> usize {
        self.message_batches.load(Ordering::SeqCst)
    }

    fn check_batch(&self, len: usize) -> Result<()> {
        if len > self.max_batch_size {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!(
                    "batch of {} exceeds limit {}",
                    len, self.max_batch_size
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn query_items(
        &self,
        user: &UserSession,
        updated_after: Option<Timestamp>,
    ) -> Result<Vec<ScheduleItem>> {
        let mut items: Vec<ScheduleItem> = self.with_user(&user.uid, |data| {
            data.items
                .values()
                .filter(|item| updated_after.map_or(true, |t| item.updated_at > t))
                .cloned()
                .collect()
        });
        items.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn batch_write(&self, user: &UserSession, items: &[ScheduleItem]) -> Result<()> {
        self.check_batch(items.len())?;
        self.with_user(&user.uid, |data| {
            for item in items {
                data.items.insert(item.id.clone(), item.clone());
            }
        });
        self.item_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_latest_messages(
        &self,
        user: &UserSession,
        limit: usize,
    ) -> Result<Vec<Message>> {
        Ok(self.with_user(&user.uid, |data| {
            data.messages.values().rev().take(limit).cloned().collect()
        }))
    }

    async fn batch_write_messages(&self, user: &UserSession, messages: &[Message]) -> Result<()> {
        self.check_batch(messages.len())?;
        self.with_user(&user.uid, |data| {
            for message in messages {
                data.messages.insert(message.id, message.clone());
            }
        });
        self.message_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_legacy(
        &self,
        user: &UserSession,
        collection: LegacyCollection,
    ) -> Result<Vec<serde_json::Value>> {
        Ok(self.with_user(&user.uid, |data| {
            data.legacy.get(&collection).cloned().unwrap_or_default()
        }))
    }
}
