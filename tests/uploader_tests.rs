//! 消息分块上传集成测试

mod common;

use assert_matches::assert_matches;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use common::*;
use schedule_sync_lib::message_source::{MessageSource, SourceResult, VecMessageSource};
use schedule_sync_lib::models::PaginatedMessages;
use schedule_sync_lib::remote::{MemoryRemoteStore, RemoteStore};
use schedule_sync_lib::session::StaticSession;
use schedule_sync_lib::sync::{ChunkedUploader, SyncError, UploaderConfig};

fn uploader(
    source: Arc<dyn MessageSource>,
    remote: Arc<dyn RemoteStore>,
    config: UploaderConfig,
) -> ChunkedUploader {
    ChunkedUploader::new(source, remote, signed_in(), config)
}

/// 记录所有进度回调
#[derive(Default)]
struct ProgressLog(Mutex<Vec<(u64, u64)>>);

impl ProgressLog {
    fn record(&self, current: u64, total: u64) {
        self.0.lock().unwrap().push((current, total));
    }

    fn calls(&self) -> Vec<(u64, u64)> {
        self.0.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn test_three_new_messages_single_write() {
    let source = Arc::new(VecMessageSource::new((1..=3).map(message).collect()));
    let remote = Arc::new(MemoryRemoteStore::new());
    let log = ProgressLog::default();

    let outcome = uploader(source, remote.clone(), fast_uploader(50))
        .push_new_messages(&|c, t| log.record(c, t))
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, 3);
    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.chunks, 1);
    assert_eq!(outcome.start_after, None);
    assert_eq!(remote.message_batch_count(), 1);
    assert_eq!(log.calls(), vec![(3, 3)]);
    assert_eq!(
        remote.messages(UID).iter().map(|m| m.id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn test_nothing_new_reports_zero() {
    let source = Arc::new(VecMessageSource::new((1..=3).map(message).collect()));
    let remote = Arc::new(MemoryRemoteStore::new());
    let seeded: Vec<_> = (1..=3).map(message).collect();
    remote.batch_write_messages(&user(), &seeded).await.unwrap();
    let log = ProgressLog::default();

    let outcome = uploader(source, remote.clone(), fast_uploader(50))
        .push_new_messages(&|c, t| log.record(c, t))
        .await
        .unwrap();

    assert_eq!(outcome.start_after, Some(3));
    assert_eq!(outcome.uploaded, 0);
    assert_eq!(log.calls(), vec![(0, 0)]);
    assert_eq!(remote.message_batch_count(), 1);
}

#[tokio::test]
async fn test_only_messages_after_remote_watermark_are_pushed() {
    let source = Arc::new(VecMessageSource::new((1..=10).map(message).collect()));
    let remote = Arc::new(MemoryRemoteStore::new());
    let seeded: Vec<_> = (1..=4).map(message).collect();
    remote.batch_write_messages(&user(), &seeded).await.unwrap();

    let outcome = uploader(source, remote.clone(), fast_uploader(50))
        .push_new_messages(&|_, _| {})
        .await
        .unwrap();

    assert_eq!(outcome.start_after, Some(4));
    assert_eq!(outcome.uploaded, 6);
    assert_eq!(remote.messages(UID).len(), 10);
}

#[tokio::test]
async fn test_chunked_progress_is_monotonic() {
    let source = Arc::new(VecMessageSource::new((1..=12).map(message).collect()));
    let remote = Arc::new(MemoryRemoteStore::new());
    let log = ProgressLog::default();

    let outcome = uploader(source, remote.clone(), fast_uploader(5))
        .push_new_messages(&|c, t| log.record(c, t))
        .await
        .unwrap();

    assert_eq!(outcome.chunks, 3);
    assert_eq!(remote.message_batch_count(), 3);
    assert_eq!(log.calls(), vec![(5, 12), (10, 12), (12, 12)]);
}

#[tokio::test]
async fn test_upload_resumes_after_failure() {
    let source = Arc::new(VecMessageSource::new((1..=12).map(message).collect()));
    let inner = Arc::new(MemoryRemoteStore::new());
    let failing = Arc::new(FlakyRemote::new(inner.clone(), WriteFault::RejectAfter(1)));

    let err = uploader(source.clone(), failing, fast_uploader(5))
        .push_new_messages(&|_, _| {})
        .await
        .unwrap_err();
    assert_matches!(err, SyncError::BatchCommit { committed: 5, .. });
    assert_eq!(inner.messages(UID).len(), 5);

    // 再次上传从远端水位线继续，不重复
    let outcome = uploader(source, inner.clone(), fast_uploader(5))
        .push_new_messages(&|_, _| {})
        .await
        .unwrap();
    assert_eq!(outcome.start_after, Some(5));
    assert_eq!(outcome.uploaded, 7);
    assert_eq!(
        inner.messages(UID).iter().map(|m| m.id).collect::<Vec<_>>(),
        (1..=12).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_transient_chunk_failure_is_retried() {
    let source = Arc::new(VecMessageSource::new((1..=3).map(message).collect()));
    let inner = Arc::new(MemoryRemoteStore::new());
    let flaky = Arc::new(FlakyRemote::new(inner.clone(), WriteFault::TransientTimes(3)));

    let outcome = uploader(source, flaky.clone(), fast_uploader(50))
        .push_new_messages(&|_, _| {})
        .await
        .unwrap();

    assert_eq!(outcome.uploaded, 3);
    assert_eq!(flaky.write_attempts(), 4);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let source = Arc::new(VecMessageSource::new((1..=3).map(message).collect()));
    let inner = Arc::new(MemoryRemoteStore::new());
    let flaky = Arc::new(FlakyRemote::new(inner.clone(), WriteFault::TransientTimes(10)));

    let err = uploader(source, flaky.clone(), fast_uploader(50))
        .push_new_messages(&|_, _| {})
        .await
        .unwrap_err();

    assert_matches!(err, SyncError::BatchCommit { committed: 0, .. });
    // 首次尝试 + 3 次重试
    assert_eq!(flaky.write_attempts(), 4);
    assert!(inner.messages(UID).is_empty());
}

#[tokio::test]
async fn test_signed_out_upload_fails() {
    let source = Arc::new(VecMessageSource::new((1..=3).map(message).collect()));
    let remote = Arc::new(MemoryRemoteStore::new());
    let uploader = ChunkedUploader::new(
        source,
        remote,
        Arc::new(StaticSession::new(None)),
        fast_uploader(50),
    );
    let err = uploader.push_new_messages(&|_, _| {}).await.unwrap_err();
    assert_matches!(err, SyncError::Auth(_));
}

/// 计数报告有新消息，但分页读取为空（计数与读取之间消息被清理）
struct StaleCountSource;

#[async_trait]
impl MessageSource for StaleCountSource {
    async fn read_messages(
        &self,
        _min_id: Option<i64>,
        _limit: usize,
        _offset: usize,
    ) -> SourceResult<PaginatedMessages> {
        Ok(PaginatedMessages {
            messages: vec![],
            total_count: 3,
        })
    }

    async fn latest_message_id(&self) -> SourceResult<Option<i64>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_stale_count_still_reports_progress() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let log = ProgressLog::default();

    let outcome = uploader(Arc::new(StaleCountSource), remote.clone(), fast_uploader(50))
        .push_new_messages(&|c, t| log.record(c, t))
        .await
        .unwrap();

    assert_eq!(outcome.total, 3);
    assert_eq!(outcome.uploaded, 0);
    assert_eq!(outcome.chunks, 0);
    assert_eq!(log.calls(), vec![(0, 3)]);
    assert_eq!(remote.message_batch_count(), 0);
}
