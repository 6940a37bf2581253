//! 集成测试公共工具
#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use schedule_sync_lib::database::ScheduleDatabase;
use schedule_sync_lib::models::{parse_timestamp, Message, ScheduleItem, Timestamp};
use schedule_sync_lib::remote::{LegacyCollection, MemoryRemoteStore, RemoteError, RemoteStore};
use schedule_sync_lib::session::{StaticSession, UserSession};
use schedule_sync_lib::sync::{OrchestratorConfig, UploaderConfig};

pub const UID: &str = "user-1";

pub fn ts(raw: &str) -> Timestamp {
    parse_timestamp(raw).unwrap()
}

pub fn user() -> UserSession {
    UserSession::new(UID, "id-token")
}

pub fn signed_in() -> Arc<StaticSession> {
    Arc::new(StaticSession::signed_in(UID, "id-token"))
}

/// 固定 id 与时间戳的待办
pub fn item(id: &str, title: &str, updated: &str) -> ScheduleItem {
    let mut item = ScheduleItem::manual_todo(title, None);
    item.id = id.to_string();
    item.created_at = ts("2023-01-01T00:00:00.000Z");
    item.updated_at = ts(updated);
    item
}

pub fn message(id: i64) -> Message {
    Message {
        id,
        sender: format!("sender-{id}"),
        content: format!("message body {id}"),
        received_at: Some("2024-03-01 09:00:00".into()),
        attachment_paths: vec![],
    }
}

pub fn temp_db() -> (TempDir, Arc<ScheduleDatabase>) {
    let dir = tempfile::tempdir().unwrap();
    let db = ScheduleDatabase::open(dir.path()).unwrap();
    (dir, Arc::new(db))
}

pub fn fast_orchestrator(max_batch_size: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_batch_size,
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
    }
}

pub fn fast_uploader(chunk_size: usize) -> UploaderConfig {
    UploaderConfig {
        chunk_size,
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        inter_chunk_delay: Duration::from_millis(1),
    }
}

/// 写入失败注入
#[derive(Debug, Clone, Copy)]
pub enum WriteFault {
    /// 前 n 次写入返回可重试错误
    TransientTimes(usize),
    /// 前 n 次写入成功，之后一律拒绝
    RejectAfter(usize),
    /// 所有写入返回认证失败
    Auth,
}

/// 包装内存远端，按需注入写入失败
pub struct FlakyRemote {
    pub inner: Arc<MemoryRemoteStore>,
    fault: WriteFault,
    attempts: AtomicUsize,
}

impl FlakyRemote {
    pub fn new(inner: Arc<MemoryRemoteStore>, fault: WriteFault) -> Self {
        Self {
            inner,
            fault,
            attempts: AtomicUsize::new(0),
        }
    }

    /// 写入尝试次数（含失败）
    pub fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), RemoteError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            WriteFault::TransientTimes(n) if attempt < n => {
                Err(RemoteError::Transient("503 Service Unavailable".into()))
            }
            WriteFault::RejectAfter(n) if attempt >= n => Err(RemoteError::Rejected {
                status: 400,
                message: "quota exceeded".into(),
            }),
            WriteFault::Auth => Err(RemoteError::Auth("token expired".into())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    fn provider_name(&self) -> &'static str {
        "flaky"
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    async fn query_items(
        &self,
        user: &UserSession,
        updated_after: Option<Timestamp>,
    ) -> Result<Vec<ScheduleItem>, RemoteError> {
        self.inner.query_items(user, updated_after).await
    }

    async fn batch_write(
        &self,
        user: &UserSession,
        items: &[ScheduleItem],
    ) -> Result<(), RemoteError> {
        self.gate()?;
        self.inner.batch_write(user, items).await
    }

    async fn query_latest_messages(
        &self,
        user: &UserSession,
        limit: usize,
    ) -> Result<Vec<Message>, RemoteError> {
        self.inner.query_latest_messages(user, limit).await
    }

    async fn batch_write_messages(
        &self,
        user: &UserSession,
        messages: &[Message],
    ) -> Result<(), RemoteError> {
        self.gate()?;
        self.inner.batch_write_messages(user, messages).await
    }

    async fn query_legacy(
        &self,
        user: &UserSession,
        collection: LegacyCollection,
    ) -> Result<Vec<serde_json::Value>, RemoteError> {
        self.inner.query_legacy(user, collection).await
    }
}
