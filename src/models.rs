//! 同步实体模型
//!
//! 日程条目（ScheduleItem）、消息记录（Message）以及旧版集合记录的定义。
//!
//! ## 时间戳约定
//! 所有时间戳统一截断到毫秒，并以 `YYYY-MM-DDTHH:MM:SS.mmmZ` 格式序列化：
//! - 字符串顺序与时间顺序一致（远端按 `updatedAt > ?` 过滤依赖这一点）
//! - 写入后再读回的值与原值严格相等（冲突判定的幂等性依赖这一点）

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type Timestamp = DateTime<Utc>;

/// 当前时间（毫秒精度）
pub fn now_millis() -> Timestamp {
    truncate_millis(Utc::now())
}

/// 截断到毫秒
pub fn truncate_millis(t: Timestamp) -> Timestamp {
    let nanos = t.nanosecond() / 1_000_000 * 1_000_000;
    t.with_nanosecond(nanos).unwrap_or(t)
}

/// 序列化为 ISO-8601（毫秒 + `Z`）
pub fn format_timestamp(t: Timestamp) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 宽松解析时间戳
///
/// 接受 RFC3339、无时区的 `YYYY-MM-DDTHH:MM:SS[.fff]`（按 UTC）、
/// SQLite `datetime('now')` 风格以及纯日期 `YYYY-MM-DD`（UTC 零点）。
/// 空字符串视为缺失。
pub fn parse_timestamp(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(truncate_millis(t.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(truncate_millis(Utc.from_utc_datetime(&naive)));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// serde 辅助：`Timestamp` <-> ISO 字符串
pub mod ts {
    use super::{format_timestamp, parse_timestamp, Timestamp};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Timestamp, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    /// `Option<Timestamp>`，空字符串与 null 均视为 None
    pub mod option {
        use super::super::{format_timestamp, parse_timestamp, Timestamp};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<Timestamp>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_some(&format_timestamp(*t)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Timestamp>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            match raw {
                None => Ok(None),
                Some(s) if s.trim().is_empty() => Ok(None),
                Some(s) => parse_timestamp(&s)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {s}"))),
            }
        }
    }
}

/// 日程类型（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// 手动待办
    ManualTodo,
    /// 跨日期区间的日程
    PeriodSchedule,
    /// 由消息派生的任务
    MessageTask,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::ManualTodo => "manual_todo",
            ScheduleKind::PeriodSchedule => "period_schedule",
            ScheduleKind::MessageTask => "message_task",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual_todo" => Some(ScheduleKind::ManualTodo),
            "period_schedule" => Some(ScheduleKind::PeriodSchedule),
            "message_task" => Some(ScheduleKind::MessageTask),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 日程条目
///
/// 线上格式（远端文档 / JSON）沿用 camelCase 字段名，`kind` 对应 `type`。
/// `updated_at` 是唯一的冲突判定依据，任何修改都必须刷新它。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ScheduleKind,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, with = "ts::option")]
    pub start_date: Option<Timestamp>,
    #[serde(default, with = "ts::option")]
    pub end_date: Option<Timestamp>,
    #[serde(rename = "isAllDay", default)]
    pub all_day: bool,
    /// 仅对 MessageTask 有意义；只是查找键，不是所有权指针
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(rename = "isCompleted", default)]
    pub completed: bool,
    #[serde(with = "ts")]
    pub created_at: Timestamp,
    #[serde(with = "ts")]
    pub updated_at: Timestamp,
    #[serde(rename = "isDeleted", default)]
    pub deleted: bool,
}

impl ScheduleItem {
    /// 创建新条目（生成 UUID，created_at = updated_at = now）
    pub fn new(kind: ScheduleKind, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            title: title.into(),
            content: None,
            start_date: None,
            end_date: None,
            all_day: false,
            reference_id: None,
            color: None,
            completed: false,
            created_at: now,
            updated_at: now,
            deleted: false,
        }
    }

    /// 手动待办，deadline 同时作为起止时间
    pub fn manual_todo(title: impl Into<String>, deadline: Option<Timestamp>) -> Self {
        let mut item = Self::new(ScheduleKind::ManualTodo, title);
        item.start_date = deadline;
        item.end_date = deadline;
        item
    }

    /// 区间日程
    pub fn period(title: impl Into<String>, start: Timestamp, end: Timestamp) -> Self {
        let mut item = Self::new(ScheduleKind::PeriodSchedule, title);
        item.start_date = Some(start);
        item.end_date = Some(end);
        item.all_day = true;
        item
    }

    /// 将消息转换为任务
    pub fn from_message(message: &Message, date: Timestamp, title: impl Into<String>) -> Self {
        let mut item = Self::new(ScheduleKind::MessageTask, title);
        item.content = Some(message.content.clone());
        item.start_date = Some(date);
        item.end_date = Some(date);
        item.reference_id = Some(message.id.to_string());
        item
    }

    /// 刷新 updated_at（保证单调不减）
    pub fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    /// 软删除
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.touch();
    }

    /// 校验不变量
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("id 不能为空".into());
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(format!(
                    "startDate ({}) 晚于 endDate ({})",
                    format_timestamp(start),
                    format_timestamp(end)
                ));
            }
        }
        if self.updated_at < self.created_at {
            return Err("updatedAt 早于 createdAt".into());
        }
        Ok(())
    }

    /// 解析消息引用（仅 MessageTask 且 referenceId 为数字时有效）
    pub fn message_reference(&self) -> Option<i64> {
        match self.kind {
            ScheduleKind::MessageTask => self
                .reference_id
                .as_deref()
                .and_then(|r| r.trim().parse::<i64>().ok()),
            ScheduleKind::ManualTodo | ScheduleKind::PeriodSchedule => None,
        }
    }

    /// 显示分类（不检查消息是否仍可解析）
    pub fn display_kind(&self) -> DisplayKind {
        self.display_kind_with(|_| true)
    }

    /// 显示分类
    ///
    /// 孤立引用（缺失、非数字、或 `resolves` 返回 false）的 MessageTask 按手动待办显示。
    /// 这是显示策略而非数据损坏。
    pub fn display_kind_with(&self, resolves: impl Fn(i64) -> bool) -> DisplayKind {
        match self.kind {
            ScheduleKind::ManualTodo => DisplayKind::ManualTodo {
                deadline: self.start_date,
            },
            ScheduleKind::PeriodSchedule => DisplayKind::PeriodSchedule {
                start: self.start_date,
                end: self.end_date,
            },
            ScheduleKind::MessageTask => match self.message_reference() {
                Some(message_id) if resolves(message_id) => DisplayKind::MessageTask { message_id },
                _ => DisplayKind::ManualTodo {
                    deadline: self.start_date,
                },
            },
        }
    }
}

/// 面向显示层的分类结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayKind {
    ManualTodo { deadline: Option<Timestamp> },
    PeriodSchedule {
        start: Option<Timestamp>,
        end: Option<Timestamp>,
    },
    MessageTask { message_id: i64 },
}

/// 日期范围查询；两端为 None 时不做日期过滤（包含无日期条目）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl DateRange {
    /// 全范围
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// 消息记录（只追加，同步方向：本地源 → 远端）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub sender: String,
    pub content: String,
    #[serde(default)]
    pub received_at: Option<String>,
    #[serde(default)]
    pub attachment_paths: Vec<String>,
}

/// 分页消息读取结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedMessages {
    pub messages: Vec<Message>,
    /// 满足条件的总数（快照值，可能已过期）
    pub total_count: i64,
}

// ============================================================================
// 旧版集合（todos / schedules）
// ============================================================================

/// 旧版 `todos` 集合记录
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacyTodo {
    pub id: String,
    pub content: Option<String>,
    pub deadline: Option<String>,
    pub calendar_title: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub is_deleted: Option<bool>,
}

/// 旧版 `schedules` 集合记录
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LegacySchedule {
    pub id: String,
    pub content: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub calendar_title: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub is_deleted: Option<bool>,
}

const LEGACY_TODO_TITLE: &str = "할 일";
const LEGACY_SCHEDULE_TITLE: &str = "일정";

fn legacy_title(calendar_title: &Option<String>, content: &Option<String>, fallback: &str) -> String {
    calendar_title
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| content.as_deref().filter(|s| !s.trim().is_empty()))
        .unwrap_or(fallback)
        .to_string()
}

fn legacy_audit(created_at: &Option<String>, updated_at: &Option<String>) -> (Timestamp, Timestamp) {
    let updated = updated_at.as_deref().and_then(parse_timestamp);
    let created = created_at
        .as_deref()
        .and_then(parse_timestamp)
        .or(updated)
        .unwrap_or_else(now_millis);
    (created, updated.unwrap_or(created).max(created))
}

impl LegacyTodo {
    pub fn into_schedule_item(self) -> ScheduleItem {
        let (created_at, updated_at) = legacy_audit(&self.created_at, &self.updated_at);
        let deadline = self.deadline.as_deref().and_then(parse_timestamp);
        ScheduleItem {
            title: legacy_title(&self.calendar_title, &self.content, LEGACY_TODO_TITLE),
            id: self.id,
            kind: ScheduleKind::ManualTodo,
            content: Some(self.content.unwrap_or_default()),
            start_date: deadline,
            end_date: deadline,
            all_day: false,
            reference_id: None,
            color: None,
            completed: false,
            created_at,
            updated_at,
            deleted: self.is_deleted.unwrap_or(false),
        }
    }
}

impl LegacySchedule {
    pub fn into_schedule_item(self) -> ScheduleItem {
        let (created_at, updated_at) = legacy_audit(&self.created_at, &self.updated_at);
        let start = self.start_date.as_deref().and_then(parse_timestamp);
        let end = self.end_date.as_deref().and_then(parse_timestamp);
        // 旧数据可能起止颠倒
        let (start, end) = match (start, end) {
            (Some(s), Some(e)) if s > e => (Some(e), Some(s)),
            other => other,
        };
        ScheduleItem {
            title: legacy_title(&self.calendar_title, &self.content, LEGACY_SCHEDULE_TITLE),
            id: self.id,
            kind: ScheduleKind::PeriodSchedule,
            content: Some(self.content.unwrap_or_default()),
            start_date: start,
            end_date: end,
            all_day: false,
            reference_id: None,
            color: None,
            completed: false,
            created_at,
            updated_at,
            deleted: self.is_deleted.unwrap_or(false),
        }
    }
}
