//! 对账编排集成测试（SQLite 本地存储 + 内存远端）

mod common;

use assert_matches::assert_matches;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use schedule_sync_lib::database::{LocalStore, ScheduleDatabase};
use schedule_sync_lib::models::{DateRange, ScheduleItem, Timestamp};
use schedule_sync_lib::remote::{MemoryRemoteStore, RemoteStore};
use schedule_sync_lib::session::{SessionProvider, StaticSession};
use schedule_sync_lib::sync::{OrchestratorConfig, ReconcileOutcome, SyncError, SyncOrchestrator};

fn orchestrator(
    db: &Arc<ScheduleDatabase>,
    remote: Arc<dyn RemoteStore>,
    config: OrchestratorConfig,
) -> SyncOrchestrator {
    SyncOrchestrator::new(db.clone(), remote, signed_in(), config)
}

async fn seed_local(db: &ScheduleDatabase, items: impl IntoIterator<Item = ScheduleItem>) {
    for item in items {
        db.create_item(item).await.unwrap();
    }
}

async fn run(orch: &SyncOrchestrator, since: Option<Timestamp>) -> ReconcileOutcome {
    orch.run_reconciliation(since).await.unwrap()
}

#[tokio::test]
async fn test_remote_newer_overwrites_local() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(&db, [item("X", "A", "2024-01-01T00:00:00.000Z")]).await;
    remote.seed_items(UID, [item("X", "B", "2024-01-02T00:00:00.000Z")]);

    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let outcome = run(&orch, None).await;

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.pushed, 0);
    assert_eq!(db.get_item("X").await.unwrap().unwrap().title, "B");
    assert_eq!(remote.item(UID, "X").unwrap().title, "B");
    assert_eq!(remote.item_batch_count(), 0);
}

#[tokio::test]
async fn test_local_newer_is_pushed() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(&db, [item("X", "local edit", "2024-01-03T00:00:00.000Z")]).await;
    remote.seed_items(UID, [item("X", "remote", "2024-01-02T00:00:00.000Z")]);

    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let outcome = run(&orch, None).await;

    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.pushed, 1);
    assert_eq!(remote.item(UID, "X").unwrap().title, "local edit");
    assert_eq!(db.get_item("X").await.unwrap().unwrap().title, "local edit");
}

#[tokio::test]
async fn test_one_sided_items_are_created_on_the_other_side() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(&db, [item("L", "local only", "2024-02-01T00:00:00.000Z")]).await;
    remote.seed_items(UID, [item("R", "remote only", "2024-02-02T00:00:00.000Z")]);

    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let outcome = run(&orch, None).await;

    assert_eq!(outcome.pulled, 1);
    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.pushed, 1);
    assert!(db.get_item("R").await.unwrap().is_some());
    assert!(remote.item(UID, "L").is_some());
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(
        &db,
        [
            item("A", "a", "2024-01-01T00:00:00.000Z"),
            item("C", "c", "2024-01-05T00:00:00.000Z"),
        ],
    )
    .await;
    remote.seed_items(
        UID,
        [
            item("B", "b", "2024-01-02T00:00:00.000Z"),
            item("C", "c", "2024-01-05T00:00:00.000Z"),
        ],
    );

    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let first = run(&orch, None).await;
    assert_eq!(first.skipped_equal, 1);
    assert_eq!(first.pushed, 1);
    assert_eq!(first.applied, 1);
    let batches_after_first = remote.item_batch_count();
    let local_after_first = db.list_items(DateRange::all()).await.unwrap();

    let second = run(&orch, Some(first.new_sync_time)).await;
    assert_eq!(second.pulled, 0);
    assert_eq!(second.applied, 0);
    assert_eq!(second.pushed, 0);
    assert_eq!(second.batches, 0);
    assert_eq!(remote.item_batch_count(), batches_after_first);
    assert_eq!(db.list_items(DateRange::all()).await.unwrap(), local_after_first);
}

#[tokio::test]
async fn test_no_ping_pong_after_remote_win() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(&db, [item("X", "A", "2024-01-01T00:00:00.000Z")]).await;
    remote.seed_items(UID, [item("X", "B", "2024-01-02T00:00:00.000Z")]);

    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let first = run(&orch, None).await;
    // 已采用远端版本的条目不会在同一轮或下一轮被推回
    assert_eq!(first.pushed, 0);

    let second = run(&orch, Some(first.new_sync_time)).await;
    assert_eq!(second.pushed, 0);
    assert_eq!(second.applied, 0);
    assert_eq!(remote.item_batch_count(), 0);
}

#[tokio::test]
async fn test_watermark_limits_dirty_set() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(
        &db,
        [
            item("old", "old", "2024-01-01T00:00:00.000Z"),
            item("new", "new", "2024-06-01T00:00:00.000Z"),
        ],
    )
    .await;

    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let outcome = run(&orch, Some(ts("2024-03-01T00:00:00.000Z"))).await;

    assert_eq!(outcome.pushed, 1);
    assert!(remote.item(UID, "new").is_some());
    assert!(remote.item(UID, "old").is_none());
}

#[tokio::test]
async fn test_soft_deleted_items_propagate() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(&db, [item("X", "to delete", "2024-01-01T00:00:00.000Z")]).await;
    let orch = orchestrator(&db, remote.clone(), OrchestratorConfig::default());
    let first = run(&orch, None).await;
    assert!(!remote.item(UID, "X").unwrap().deleted);

    tokio::time::sleep(Duration::from_millis(5)).await;
    db.soft_delete_item("X").await.unwrap();
    let second = run(&orch, Some(first.new_sync_time)).await;
    assert_eq!(second.pushed, 1);
    assert!(remote.item(UID, "X").unwrap().deleted);
    assert!(db.list_visible_items(DateRange::all()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_push_is_chunked_by_batch_size() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    seed_local(
        &db,
        (0..120).map(|i| item(&format!("item-{i:03}"), "bulk", "2024-01-01T00:00:00.000Z")),
    )
    .await;

    let orch = orchestrator(&db, remote.clone(), fast_orchestrator(50));
    let outcome = run(&orch, None).await;

    assert_eq!(outcome.pushed, 120);
    assert_eq!(outcome.batches, 3);
    assert_eq!(remote.item_batch_count(), 3);
    assert_eq!(remote.items(UID).len(), 120);
}

#[tokio::test]
async fn test_batch_size_is_capped_by_remote_limit() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::with_max_batch_size(10));
    seed_local(
        &db,
        (0..25).map(|i| item(&format!("item-{i:02}"), "bulk", "2024-01-01T00:00:00.000Z")),
    )
    .await;

    let orch = orchestrator(&db, remote.clone(), fast_orchestrator(450));
    let outcome = run(&orch, None).await;
    assert_eq!(outcome.batches, 3);
    assert_eq!(remote.items(UID).len(), 25);
}

#[tokio::test]
async fn test_failed_batch_reports_committed_count() {
    let (_dir, db) = temp_db();
    let inner = Arc::new(MemoryRemoteStore::new());
    let remote = Arc::new(FlakyRemote::new(inner.clone(), WriteFault::RejectAfter(1)));
    seed_local(
        &db,
        (0..120).map(|i| item(&format!("item-{i:03}"), "bulk", "2024-01-01T00:00:00.000Z")),
    )
    .await;

    let orch = orchestrator(&db, remote, fast_orchestrator(50));
    let err = orch.run_reconciliation(None).await.unwrap_err();

    assert_matches!(err, SyncError::BatchCommit { committed: 50, .. });
    assert_eq!(inner.items(UID).len(), 50);
}

#[tokio::test]
async fn test_transient_batch_failure_is_retried() {
    let (_dir, db) = temp_db();
    let inner = Arc::new(MemoryRemoteStore::new());
    let remote = Arc::new(FlakyRemote::new(inner.clone(), WriteFault::TransientTimes(2)));
    seed_local(&db, [item("X", "x", "2024-01-01T00:00:00.000Z")]).await;

    let orch = orchestrator(&db, remote.clone(), fast_orchestrator(50));
    let outcome = run(&orch, None).await;

    assert_eq!(outcome.pushed, 1);
    assert_eq!(remote.write_attempts(), 3);
    assert!(inner.item(UID, "X").is_some());
}

#[tokio::test]
async fn test_auth_failure_during_push() {
    let (_dir, db) = temp_db();
    let inner = Arc::new(MemoryRemoteStore::new());
    let remote = Arc::new(FlakyRemote::new(inner, WriteFault::Auth));
    seed_local(&db, [item("X", "x", "2024-01-01T00:00:00.000Z")]).await;

    let orch = orchestrator(&db, remote.clone(), fast_orchestrator(50));
    let err = orch.run_reconciliation(None).await.unwrap_err();
    assert_matches!(err, SyncError::Auth(_));
    // 认证错误不重试
    assert_eq!(remote.write_attempts(), 1);
}

#[tokio::test]
async fn test_signed_out_fails_before_any_io() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    let session = Arc::new(StaticSession::new(None));
    assert!(session.current_user().is_none());

    let orch = SyncOrchestrator::new(db, remote.clone(), session, OrchestratorConfig::default());
    let err = orch.run_reconciliation(None).await.unwrap_err();
    assert_matches!(err, SyncError::Auth(_));
    assert_eq!(remote.item_batch_count(), 0);
}

#[tokio::test]
async fn test_invalid_remote_item_does_not_abort_pass() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    let mut broken = item("broken", "bad range", "2024-01-02T00:00:00.000Z");
    broken.start_date = Some(ts("2024-05-02T00:00:00.000Z"));
    broken.end_date = Some(ts("2024-05-01T00:00:00.000Z"));
    remote.seed_items(
        UID,
        [broken, item("good", "fine", "2024-01-03T00:00:00.000Z")],
    );

    let orch = orchestrator(&db, remote, OrchestratorConfig::default());
    let outcome = run(&orch, None).await;

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.failed_items.len(), 1);
    assert_eq!(outcome.failed_items[0].id, "broken");
    assert!(db.get_item("good").await.unwrap().is_some());
    assert!(db.get_item("broken").await.unwrap().is_none());
}

#[tokio::test]
async fn test_new_sync_time_is_pass_start() {
    let (_dir, db) = temp_db();
    let remote = Arc::new(MemoryRemoteStore::new());
    let before = schedule_sync_lib::models::now_millis();
    let orch = orchestrator(&db, remote, OrchestratorConfig::default());
    let outcome = run(&orch, None).await;
    let after = schedule_sync_lib::models::now_millis();
    assert!(outcome.new_sync_time >= before);
    assert!(outcome.new_sync_time <= after);
}
