//! 冲突解决（Last-Write-Wins）
//!
//! 以 `updatedAt` 为唯一依据的整条记录级别判定：
//! - 远端更新 → 使用远端
//! - 本地更新 → 保留本地并推送
//! - 相同 → 不处理
//!
//! 已知限制：两端在同一条目的不同字段上的并发修改，较旧一方的修改会整体丢失。

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{ScheduleItem, Timestamp};

/// 单条判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// 远端版本覆盖本地
    UseRemote,
    /// 本地版本推送到远端
    KeepLocal,
    /// 两端一致
    InSync,
}

/// 判定同一 id 的本地与远端版本
pub fn resolve(local: Option<&ScheduleItem>, remote: Option<&ScheduleItem>) -> Resolution {
    match (local, remote) {
        (Some(l), Some(r)) => match compare_timestamps(l.updated_at, r.updated_at) {
            Ordering::Less => Resolution::UseRemote,
            Ordering::Greater => Resolution::KeepLocal,
            Ordering::Equal => Resolution::InSync,
        },
        (None, Some(_)) => Resolution::UseRemote,
        (Some(_), None) => Resolution::KeepLocal,
        (None, None) => Resolution::InSync,
    }
}

fn compare_timestamps(local: Timestamp, remote: Timestamp) -> Ordering {
    local.cmp(&remote)
}

/// 一次对账的计划
#[derive(Debug, Default)]
pub struct ReconcilePlan {
    /// 需要写入本地的远端版本
    pub to_apply: Vec<ScheduleItem>,
    /// 需要推送的本地版本
    pub to_push: Vec<ScheduleItem>,
    /// 两端一致而跳过的条目数
    pub skipped_equal: usize,
}

/// 根据本地全集、拉取到的远端增量与水位线生成计划
///
/// 推送集合 = 本地 `updatedAt` > 水位线的条目（无水位线时为全部），
/// 排除拉取结果中 `updatedAt` ≥ 本地的 id。
pub fn plan_reconciliation(
    local: &[ScheduleItem],
    remote: &[ScheduleItem],
    last_sync_time: Option<Timestamp>,
) -> ReconcilePlan {
    let local_by_id: HashMap<&str, &ScheduleItem> =
        local.iter().map(|item| (item.id.as_str(), item)).collect();
    let remote_by_id: HashMap<&str, &ScheduleItem> =
        remote.iter().map(|item| (item.id.as_str(), item)).collect();

    let mut plan = ReconcilePlan::default();

    for remote_item in remote_by_id.values().copied() {
        let local_item = local_by_id.get(remote_item.id.as_str()).copied();
        match resolve(local_item, Some(remote_item)) {
            Resolution::UseRemote => plan.to_apply.push(remote_item.clone()),
            Resolution::InSync => plan.skipped_equal += 1,
            Resolution::KeepLocal => {}
        }
    }

    for local_item in local {
        let dirty = last_sync_time.map_or(true, |t| local_item.updated_at > t);
        if !dirty {
            continue;
        }
        let remote_item = remote_by_id.get(local_item.id.as_str()).copied();
        if resolve(Some(local_item), remote_item) == Resolution::KeepLocal {
            plan.to_push.push(local_item.clone());
        }
    }

    // 稳定顺序，便于日志与测试
    plan.to_apply.sort_by(|a, b| a.id.cmp(&b.id));
    plan
}
