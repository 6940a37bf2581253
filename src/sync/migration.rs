//! 旧版集合迁移
//!
//! 将 `todos` / `schedules` 集合转换为统一的 `events` 集合。
//! 以 id 为文档键写入，重复执行结果相同；`events` 中已有更新版本的条目不会被覆盖。

use std::collections::HashMap;
use tracing::{info, warn};

use super::SyncError;
use crate::models::{LegacySchedule, LegacyTodo, ScheduleItem};
use crate::remote::{LegacyCollection, RemoteStore};
use crate::session::UserSession;

fn convert(collection: LegacyCollection, record: serde_json::Value) -> Option<ScheduleItem> {
    let converted = match collection {
        LegacyCollection::Todos => {
            serde_json::from_value::<LegacyTodo>(record).map(LegacyTodo::into_schedule_item)
        }
        LegacyCollection::Schedules => serde_json::from_value::<LegacySchedule>(record)
            .map(LegacySchedule::into_schedule_item),
    };
    match converted {
        Ok(item) if !item.id.trim().is_empty() => Some(item),
        Ok(_) => {
            warn!("[Migration] Skipping {} record without id", collection.collection_id());
            None
        }
        Err(e) => {
            warn!(
                "[Migration] Skipping malformed {} record: {}",
                collection.collection_id(),
                e
            );
            None
        }
    }
}

/// 迁移旧版集合，返回写入 `events` 的条目数
pub async fn migrate_legacy_collections(
    remote: &dyn RemoteStore,
    user: &UserSession,
) -> Result<usize, SyncError> {
    let existing: HashMap<String, ScheduleItem> = remote
        .query_items(user, None)
        .await?
        .into_iter()
        .map(|item| (item.id.clone(), item))
        .collect();

    let mut items = Vec::new();
    for collection in [LegacyCollection::Todos, LegacyCollection::Schedules] {
        let records = remote.query_legacy(user, collection).await?;
        let before = items.len();
        items.extend(
            records
                .into_iter()
                .filter_map(|r| convert(collection, r))
                .filter(|item| {
                    existing
                        .get(&item.id)
                        .map_or(true, |current| current.updated_at < item.updated_at)
                }),
        );
        info!(
            "[Migration] {} records to migrate from {}",
            items.len() - before,
            collection.collection_id()
        );
    }

    let mut committed = 0;
    for chunk in items.chunks(remote.max_batch_size().max(1)) {
        remote
            .batch_write(user, chunk)
            .await
            .map_err(|e| SyncError::batch_failure(committed, e))?;
        committed += chunk.len();
    }

    info!("[Migration] Migrated {} legacy records into events", committed);
    Ok(committed)
}
