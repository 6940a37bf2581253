//! 消息源适配层
//!
//! 外部消息日志（UDB 文件中的 `tbl_recv` 表）的只读访问。
//! 同步引擎只关心按 id 升序的分页读取与最新 id 探测。

use crate::models::{Message, PaginatedMessages};
use async_trait::async_trait;
use base64::Engine;
use flate2::read::ZlibDecoder;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, Row};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

/// 消息表名
pub const MESSAGE_TABLE: &str = "tbl_recv";

/// 消息正文压缩前缀
const COMP_PREFIX: &str = "{COMP}";

const DECODE_FAILED_TEXT: &str = "압축 해제 실패";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Message table {0} not found")]
    MissingTable(String),

    #[error("Message source unavailable: {0}")]
    Unavailable(String),
}

pub type SourceResult<T> = Result<T, SourceError>;

/// 外部消息日志
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// 读取 id > `min_id` 的消息（按 id 升序）
    ///
    /// `total_count` 为满足 `id > min_id` 的总条数，与分页参数无关。
    async fn read_messages(
        &self,
        min_id: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> SourceResult<PaginatedMessages>;

    /// 当前最大消息 id
    async fn latest_message_id(&self) -> SourceResult<Option<i64>>;
}

/// 解码 `{COMP}` 正文：base64 → zlib → UTF-16LE
pub fn decode_comp_body(b64: &str) -> Result<String, String> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(b64.trim())
        .map_err(|e| format!("base64 decode failed: {}", e))?;
    let mut out = Vec::new();
    ZlibDecoder::new(&data[..])
        .read_to_end(&mut out)
        .map_err(|e| format!("zlib inflate failed: {}", e))?;
    if out.len() % 2 != 0 {
        return Err("odd UTF-16LE length".into());
    }
    let units: Vec<u16> = out
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| format!("UTF-16LE decode failed: {}", e))
}

/// 解析 FilePath 字段，取 `|` 分隔后第 4、7、10… 个元素作为附件名
pub fn parse_attachment_paths(raw: &str) -> Vec<String> {
    raw.split('|')
        .skip(4)
        .step_by(3)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 读取正文，优先使用 MessageBody 中的压缩内容
fn resolve_content(text: ValueRef<'_>, body: ValueRef<'_>, id: i64) -> String {
    let text_value = match text {
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Some(decode_blob_body(b, id)),
        _ => None,
    };

    let mut prefer_body = false;
    let body_value = match body {
        ValueRef::Text(t) => {
            let s = String::from_utf8_lossy(t).into_owned();
            match s.strip_prefix(COMP_PREFIX) {
                Some(rest) => {
                    prefer_body = true;
                    decode_comp_body(rest).unwrap_or_else(|e| {
                        warn!("[Source] Failed to decode body of message {}: {}", id, e);
                        DECODE_FAILED_TEXT.to_string()
                    })
                }
                None => s,
            }
        }
        ValueRef::Blob(b) => {
            prefer_body = true;
            decode_blob_body(b, id)
        }
        _ => String::new(),
    };

    match text_value {
        Some(t) if !prefer_body && !t.is_empty() => t,
        _ => body_value,
    }
}

/// 解压 brotli 压缩的二进制正文
pub fn decompress_brotli(compressed: &[u8]) -> std::io::Result<String> {
    let mut decompressed = Vec::new();
    brotli::Decompressor::new(compressed, 4096).read_to_end(&mut decompressed)?;
    Ok(String::from_utf8_lossy(&decompressed).into_owned())
}

fn decode_blob_body(bytes: &[u8], id: i64) -> String {
    decompress_brotli(bytes).unwrap_or_else(|e| {
        warn!(
            "[Source] Failed to decompress body of message {} ({} bytes): {}",
            id,
            bytes.len(),
            e
        );
        DECODE_FAILED_TEXT.to_string()
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let id: i64 = row.get(0)?;
    let sender: Option<String> = row.get(1)?;
    let content = resolve_content(row.get_ref(2)?, row.get_ref(3)?, id);
    let received_at: Option<String> = row.get(4)?;
    let file_path: Option<String> = row.get(5)?;
    Ok(Message {
        id,
        sender: sender.unwrap_or_default(),
        content,
        received_at,
        attachment_paths: parse_attachment_paths(&file_path.unwrap_or_default()),
    })
}

/// UDB 文件消息源（只读打开）
pub struct UdbMessageSource {
    path: PathBuf,
}

impl UdbMessageSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在阻塞线程池上打开文件并执行查询
    async fn with_connection<T, F>(&self, f: F) -> SourceResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> SourceResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || f(&open_read_only(&path)?))
            .await
            .map_err(|e| SourceError::Unavailable(format!("read task failed: {}", e)))?
    }
}

fn open_read_only(path: &Path) -> SourceResult<Connection> {
    if !path.exists() {
        return Err(SourceError::Unavailable(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(3))?;
    let exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 LIMIT 1")?
        .exists(params![MESSAGE_TABLE])?;
    if !exists {
        return Err(SourceError::MissingTable(MESSAGE_TABLE.to_string()));
    }
    Ok(conn)
}

fn query_page(
    conn: &Connection,
    min_id: Option<i64>,
    limit: usize,
    offset: usize,
) -> SourceResult<PaginatedMessages> {
    let floor = min_id.unwrap_or(i64::MIN);

    let total_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tbl_recv WHERE MessageKey > ?1",
        params![floor],
        |row| row.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT MessageKey, Sender, MessageText, MessageBody, ReceiveDate, FilePath \
         FROM tbl_recv WHERE MessageKey > ?1 ORDER BY MessageKey ASC LIMIT ?2 OFFSET ?3",
    )?;
    let messages = stmt
        .query_map(params![floor, limit as i64, offset as i64], row_to_message)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PaginatedMessages {
        messages,
        total_count,
    })
}

#[async_trait]
impl MessageSource for UdbMessageSource {
    async fn read_messages(
        &self,
        min_id: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> SourceResult<PaginatedMessages> {
        self.with_connection(move |conn| query_page(conn, min_id, limit, offset))
            .await
    }

    async fn latest_message_id(&self) -> SourceResult<Option<i64>> {
        self.with_connection(|conn| {
            let id: Option<i64> =
                conn.query_row("SELECT MAX(MessageKey) FROM tbl_recv", [], |row| row.get(0))?;
            Ok(id)
        })
        .await
    }
}

/// 内存消息源
#[derive(Default)]
pub struct VecMessageSource {
    messages: Mutex<Vec<Message>>,
}

impl VecMessageSource {
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.id);
        Self {
            messages: Mutex::new(messages),
        }
    }

    /// 追加消息（模拟外部写入）
    pub fn push(&self, message: Message) {
        let mut guard = self.messages.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(message);
        guard.sort_by_key(|m| m.id);
    }
}

#[async_trait]
impl MessageSource for VecMessageSource {
    async fn read_messages(
        &self,
        min_id: Option<i64>,
        limit: usize,
        offset: usize,
    ) -> SourceResult<PaginatedMessages> {
        let guard = self.messages.lock().unwrap_or_else(|p| p.into_inner());
        let floor = min_id.unwrap_or(i64::MIN);
        let matching: Vec<&Message> = guard.iter().filter(|m| m.id > floor).collect();
        Ok(PaginatedMessages {
            total_count: matching.len() as i64,
            messages: matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
        })
    }

    async fn latest_message_id(&self) -> SourceResult<Option<i64>> {
        let guard = self.messages.lock().unwrap_or_else(|p| p.into_inner());
        Ok(guard.iter().map(|m| m.id).max())
    }
}
