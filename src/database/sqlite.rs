//! SQLite 日程数据库
//!
//! 使用 r2d2 连接池，WAL 模式。时间戳以毫秒精度 ISO 字符串存储，
//! 因此 SQL 中的字符串比较与时间比较等价。

use super::{
    LocalStore, StoreError, StoreResult, WatermarkStore, DATABASE_FILENAME, LAST_SYNC_TIME_KEY,
};
use crate::models::{
    format_timestamp, parse_timestamp, DateRange, ScheduleItem, ScheduleKind, Timestamp,
};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// SQLite 连接池类型
pub type SchedulePool = Pool<SqliteConnectionManager>;

/// SQLite 池化连接类型
pub type SchedulePooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tbl_schedules (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT,
    start_date TEXT,
    end_date TEXT,
    is_all_day INTEGER NOT NULL DEFAULT 0,
    reference_id TEXT,
    color TEXT,
    is_completed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_schedules_updated_at ON tbl_schedules(updated_at);
CREATE INDEX IF NOT EXISTS idx_schedules_start_date ON tbl_schedules(start_date);
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const SELECT_COLUMNS: &str = "SELECT id, type, title, content, start_date, end_date, is_all_day, \
     reference_id, color, is_completed, created_at, updated_at, is_deleted FROM tbl_schedules";

// 单边范围的哨兵值，按字符串比较可覆盖全部合法时间戳
const RANGE_FLOOR: &str = "0000-01-01T00:00:00.000Z";
const RANGE_CEIL: &str = "9999-12-31T23:59:59.999Z";

/// 日程数据库
///
/// 同时实现 [`LocalStore`] 与 [`WatermarkStore`]，水位线与日程位于同一个数据库文件。
pub struct ScheduleDatabase {
    pool: SchedulePool,
    db_path: Option<PathBuf>,
}

impl ScheduleDatabase {
    /// 在数据目录下打开（或创建）数据库
    pub fn open(data_dir: &Path) -> StoreResult<Self> {
        info!("[Store] Opening schedule database in: {}", data_dir.display());
        fs::create_dir_all(data_dir)?;
        Self::open_file(&data_dir.join(DATABASE_FILENAME))
    }

    /// 打开指定路径的数据库文件
    pub fn open_file(db_path: &Path) -> StoreResult<Self> {
        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            // 使用 WAL 模式提升并发性能
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            // 设置 busy_timeout 避免无界等待（3秒）
            conn.pragma_update(None, "busy_timeout", 3000i64)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(1))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)
            .map_err(|e| StoreError::Pool(format!("Failed to create connection pool: {}", e)))?;

        let db = Self {
            pool,
            db_path: Some(db_path.to_path_buf()),
        };
        db.init_schema()?;
        debug!("[Store] Schedule database ready: {}", db_path.display());
        Ok(db)
    }

    /// 内存数据库（单连接，保证所有操作看到同一个库）
    pub fn in_memory() -> StoreResult<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())
            .map_err(|e| StoreError::Pool(format!("Failed to create connection pool: {}", e)))?;
        let db = Self {
            pool,
            db_path: None,
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.get_conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// 获取数据库连接
    pub fn get_conn(&self) -> StoreResult<SchedulePooledConnection> {
        self.pool
            .get()
            .map_err(|e| StoreError::Pool(format!("Failed to get connection: {}", e)))
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn query_range(&self, range: DateRange) -> StoreResult<Vec<ScheduleItem>> {
        let conn = self.get_conn()?;
        let items = if range.is_unbounded() {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY created_at, id"))?;
            let rows = stmt.query_map([], row_to_item)?;
            rows.collect::<Result<Vec<_>, _>>()?
        } else {
            let start = range
                .start
                .map(format_timestamp)
                .unwrap_or_else(|| RANGE_FLOOR.to_string());
            let end = range
                .end
                .map(format_timestamp)
                .unwrap_or_else(|| RANGE_CEIL.to_string());
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE (start_date BETWEEN ?1 AND ?2) \
                 OR (end_date BETWEEN ?1 AND ?2) \
                 OR (start_date <= ?1 AND end_date >= ?2) \
                 ORDER BY start_date, id"
            ))?;
            let rows = stmt.query_map(params![start, end], row_to_item)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        Ok(items)
    }

    fn query_one(&self, id: &str) -> StoreResult<Option<ScheduleItem>> {
        let conn = self.get_conn()?;
        let item = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id],
                row_to_item,
            )
            .optional()?;
        Ok(item)
    }
}

fn invalid_column(idx: usize, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid value: {raw}").into(),
    )
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| invalid_column(idx, &raw))
}

fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(s) if !s.trim().is_empty() => parse_timestamp(&s)
            .map(Some)
            .ok_or_else(|| invalid_column(idx, &s)),
        _ => Ok(None),
    }
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ScheduleItem> {
    let kind_raw: String = row.get(1)?;
    let kind = ScheduleKind::from_str(&kind_raw).ok_or_else(|| invalid_column(1, &kind_raw))?;
    Ok(ScheduleItem {
        id: row.get(0)?,
        kind,
        title: row.get(2)?,
        content: row.get(3)?,
        start_date: optional_timestamp_column(row, 4)?,
        end_date: optional_timestamp_column(row, 5)?,
        all_day: row.get(6)?,
        reference_id: row.get(7)?,
        color: row.get(8)?,
        completed: row.get(9)?,
        created_at: timestamp_column(row, 10)?,
        updated_at: timestamp_column(row, 11)?,
        deleted: row.get(12)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl LocalStore for ScheduleDatabase {
    async fn list_items(&self, range: DateRange) -> StoreResult<Vec<ScheduleItem>> {
        self.query_range(range)
    }

    async fn get_item(&self, id: &str) -> StoreResult<Option<ScheduleItem>> {
        self.query_one(id)
    }

    async fn create_item(&self, item: ScheduleItem) -> StoreResult<ScheduleItem> {
        item.validate().map_err(StoreError::Invalid)?;
        let conn = self.get_conn()?;
        let result = conn.execute(
            "INSERT INTO tbl_schedules (id, type, title, content, start_date, end_date, is_all_day, \
             reference_id, color, is_completed, created_at, updated_at, is_deleted) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                item.id,
                item.kind.as_str(),
                item.title,
                item.content,
                item.start_date.map(format_timestamp),
                item.end_date.map(format_timestamp),
                item.all_day,
                item.reference_id,
                item.color,
                item.completed,
                format_timestamp(item.created_at),
                format_timestamp(item.updated_at),
                item.deleted,
            ],
        );
        match result {
            Ok(_) => Ok(item),
            Err(e) if is_unique_violation(&e) => {
                Err(StoreError::Invalid(format!("duplicate id: {}", item.id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_item(&self, id: &str, item: ScheduleItem) -> StoreResult<ScheduleItem> {
        if item.id != id {
            return Err(StoreError::Invalid(format!(
                "id mismatch: path {} vs body {}",
                id, item.id
            )));
        }
        item.validate().map_err(StoreError::Invalid)?;

        let incoming = format_timestamp(item.updated_at);
        let changed = {
            let conn = self.get_conn()?;
            conn.execute(
                "UPDATE tbl_schedules SET type = ?1, title = ?2, content = ?3, start_date = ?4, \
                 end_date = ?5, is_all_day = ?6, reference_id = ?7, color = ?8, is_completed = ?9, \
                 created_at = ?10, updated_at = ?11, is_deleted = ?12 \
                 WHERE id = ?13 AND updated_at <= ?11",
                params![
                    item.kind.as_str(),
                    item.title,
                    item.content,
                    item.start_date.map(format_timestamp),
                    item.end_date.map(format_timestamp),
                    item.all_day,
                    item.reference_id,
                    item.color,
                    item.completed,
                    format_timestamp(item.created_at),
                    incoming,
                    item.deleted,
                    id,
                ],
            )?
        };

        if changed == 1 {
            return Ok(item);
        }
        match self.query_one(id)? {
            None => Err(StoreError::NotFound(id.to_string())),
            Some(stored) => {
                warn!(
                    "[Store] Refusing stale update for {}: stored={} incoming={}",
                    id,
                    format_timestamp(stored.updated_at),
                    incoming
                );
                Err(StoreError::Stale {
                    id: id.to_string(),
                    stored: format_timestamp(stored.updated_at),
                    incoming,
                })
            }
        }
    }

    async fn soft_delete_item(&self, id: &str) -> StoreResult<()> {
        let mut item = self
            .query_one(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        item.mark_deleted();
        self.update_item(id, item).await?;
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for ScheduleDatabase {
    async fn load_last_sync_time(&self) -> StoreResult<Option<Timestamp>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![LAST_SYNC_TIME_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().and_then(|s| {
            let parsed = parse_timestamp(s);
            if parsed.is_none() {
                // 损坏的水位线按首次同步处理
                warn!("[Store] Ignoring unparsable {}: {}", LAST_SYNC_TIME_KEY, s);
            }
            parsed
        }))
    }

    async fn save_last_sync_time(&self, t: Timestamp) -> StoreResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO sync_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_SYNC_TIME_KEY, format_timestamp(t)],
        )?;
        Ok(())
    }
}
