//! Firestore REST 存储实现
//!
//! 基于 reqwest 的 Firestore v1 REST 客户端：
//! - 读取：`POST .../documents/users/{uid}:runQuery`，按 `updatedAt`、`__name__` 排序并以 `startAt` 游标分页
//! - 写入：`POST .../documents:commit`，每批一个原子 commit
//!
//! 文档字段与 JSON 之间的转换见 [`encode_value`] / [`decode_value`]。

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Map, Number, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::config::RemoteStoreConfig;
use super::traits::{
    LegacyCollection, RemoteError, RemoteStore, Result, EVENTS_COLLECTION, MESSAGES_COLLECTION,
};
use crate::models::{format_timestamp, Message, ScheduleItem, Timestamp};
use crate::session::UserSession;

const NAME_FIELD: &str = "__name__";
const UPDATED_AT_FIELD: &str = "updatedAt";

// ============================================================================
// 值编码
// ============================================================================

/// JSON 值 → Firestore `Value`
pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(values) => json!({
            "arrayValue": { "values": values.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        Value::Object(map) => json!({ "mapValue": { "fields": encode_fields(map) } }),
    }
}

/// JSON 对象 → Firestore `fields`
pub fn encode_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), encode_value(v)))
        .collect()
}

/// Firestore `Value` → JSON 值
///
/// `timestampValue` / `referenceValue` / `bytesValue` 解码为字符串。
pub fn decode_value(value: &Value) -> Result<Value> {
    let obj = value
        .as_object()
        .ok_or_else(|| RemoteError::Decode(format!("expected Firestore value, got {value}")))?;
    let (kind, inner) = obj
        .iter()
        .next()
        .ok_or_else(|| RemoteError::Decode("empty Firestore value".into()))?;

    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => Ok(Value::Bool(inner.as_bool().unwrap_or(false))),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed
                .map(|i| Value::Number(i.into()))
                .ok_or_else(|| RemoteError::Decode(format!("invalid integerValue: {inner}")))
        }
        "doubleValue" => Ok(inner
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => {
            Ok(Value::String(inner.as_str().unwrap_or_default().to_string()))
        }
        "arrayValue" => {
            let values = inner
                .get("values")
                .and_then(Value::as_array)
                .map(|vs| vs.iter().map(decode_value).collect::<Result<Vec<_>>>())
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Array(values))
        }
        "mapValue" => {
            let fields = inner
                .get("fields")
                .and_then(Value::as_object)
                .map(decode_fields)
                .transpose()?
                .unwrap_or_default();
            Ok(Value::Object(fields))
        }
        "geoPointValue" => Ok(inner.clone()),
        other => Err(RemoteError::Decode(format!("unsupported Firestore value type: {other}"))),
    }
}

/// Firestore `fields` → JSON 对象
pub fn decode_fields(fields: &Map<String, Value>) -> Result<Map<String, Value>> {
    fields
        .iter()
        .map(|(k, v)| decode_value(v).map(|v| (k.clone(), v)))
        .collect()
}

// ============================================================================
// 文档
// ============================================================================

#[derive(Debug, Deserialize)]
struct RunQueryEntry {
    #[serde(default)]
    document: Option<Document>,
}

/// runQuery 返回的文档
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub name: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// 文档 ID（name 的最后一段）
    pub fn doc_id(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or_default()
    }

    fn cursor_values(&self, order_fields: &[&str]) -> Vec<Value> {
        order_fields
            .iter()
            .map(|field| {
                if *field == NAME_FIELD {
                    json!({ "referenceValue": self.name })
                } else {
                    self.fields
                        .get(*field)
                        .cloned()
                        .unwrap_or_else(|| json!({ "nullValue": null }))
                }
            })
            .collect()
    }

    /// 解码为 JSON 对象，缺少 `id` 字段时用文档 ID 补齐
    pub fn to_json(&self) -> Result<Value> {
        let mut map = decode_fields(&self.fields)?;
        if !map.contains_key("id") {
            map.insert("id".into(), Value::String(self.doc_id().to_string()));
        }
        Ok(Value::Object(map))
    }
}

fn decode_item(doc: &Document) -> Option<ScheduleItem> {
    let decoded = doc
        .to_json()
        .and_then(|v| serde_json::from_value(v).map_err(|e| RemoteError::Decode(e.to_string())));
    match decoded {
        Ok(item) => Some(item),
        Err(e) => {
            warn!("[Remote] Skipping malformed document {}: {}", doc.name, e);
            None
        }
    }
}

fn decode_message(doc: &Document) -> Option<Message> {
    let mut value = match doc.to_json() {
        Ok(v) => v,
        Err(e) => {
            warn!("[Remote] Skipping malformed message {}: {}", doc.name, e);
            return None;
        }
    };
    // 文档 ID 为字符串形式的消息 id
    if let Some(Value::String(s)) = value.get("id") {
        if let Ok(id) = s.parse::<i64>() {
            value["id"] = Value::Number(id.into());
        }
    }
    match serde_json::from_value(value) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!("[Remote] Skipping malformed message {}: {}", doc.name, e);
            None
        }
    }
}

// ============================================================================
// 错误映射
// ============================================================================

fn map_transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Transient(e.to_string())
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

/// HTTP 状态码 → 适配层错误
pub fn classify_status(status: StatusCode, body: &str) -> RemoteError {
    let message = extract_error_message(body);
    match status.as_u16() {
        401 | 403 => RemoteError::Auth(message),
        408 | 429 => RemoteError::Transient(format!("HTTP {}: {}", status.as_u16(), message)),
        s if s >= 500 => RemoteError::Transient(format!("HTTP {}: {}", s, message)),
        s => RemoteError::Rejected { status: s, message },
    }
}

// ============================================================================
// 存储实现
// ============================================================================

/// Firestore REST 存储
pub struct FirestoreStore {
    http: Client,
    api_base: String,
    project_id: String,
    page_size: usize,
    max_batch_size: usize,
}

impl FirestoreStore {
    pub fn new(config: &RemoteStoreConfig) -> Result<Self> {
        let api_base = config.api_base.trim().trim_end_matches('/').to_string();
        Url::parse(&api_base).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: format!("invalid api_base {}: {}", api_base, e),
        })?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RemoteError::Rejected {
                status: 0,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            api_base,
            project_id: config.project_id.trim().to_string(),
            page_size: config.page_size.max(1),
            max_batch_size: config.max_batch_size.max(1),
        })
    }

    fn database_path(&self) -> String {
        format!("projects/{}/databases/(default)", self.project_id)
    }

    fn documents_path(&self) -> String {
        format!("{}/documents", self.database_path())
    }

    fn document_name(&self, uid: &str, collection: &str, doc_id: &str) -> String {
        format!(
            "{}/users/{}/{}/{}",
            self.documents_path(),
            uid,
            collection,
            doc_id
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        Url::parse(&format!("{}/{}", self.api_base, path)).map_err(|e| RemoteError::Rejected {
            status: 0,
            message: format!("invalid endpoint {}: {}", path, e),
        })
    }

    async fn post(&self, user: &UserSession, url: Url, body: &Value) -> Result<Value> {
        debug!("[Remote] POST {}", url.path());
        let response = self
            .http
            .post(url)
            .bearer_auth(&user.id_token)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn run_query(&self, user: &UserSession, structured_query: Value) -> Result<Vec<Document>> {
        let url = self.endpoint(&format!(
            "{}/users/{}:runQuery",
            self.documents_path(),
            user.uid
        ))?;
        let value = self
            .post(user, url, &json!({ "structuredQuery": structured_query }))
            .await?;
        let entries: Vec<RunQueryEntry> =
            serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(entries.into_iter().filter_map(|e| e.document).collect())
    }

    /// 分页读取整个集合
    async fn run_query_paged(
        &self,
        user: &UserSession,
        collection: &str,
        filter: Option<Value>,
        order_fields: &[&str],
    ) -> Result<Vec<Document>> {
        let order_by: Vec<Value> = order_fields
            .iter()
            .map(|f| json!({ "field": { "fieldPath": f }, "direction": "ASCENDING" }))
            .collect();

        let mut documents = Vec::new();
        let mut cursor: Option<Vec<Value>> = None;
        loop {
            let mut query = json!({
                "from": [{ "collectionId": collection }],
                "orderBy": order_by,
                "limit": self.page_size,
            });
            if let Some(filter) = &filter {
                query["where"] = filter.clone();
            }
            if let Some(values) = &cursor {
                query["startAt"] = json!({ "values": values, "before": false });
            }

            let page = self.run_query(user, query).await?;
            let page_len = page.len();
            cursor = page.last().map(|doc| doc.cursor_values(order_fields));
            documents.extend(page);

            if page_len < self.page_size || cursor.is_none() {
                break;
            }
        }
        debug!(
            "[Remote] Read {} documents from users/{}/{}",
            documents.len(),
            user.uid,
            collection
        );
        Ok(documents)
    }

    fn update_write(&self, name: String, value: Value) -> Result<Value> {
        match value {
            Value::Object(map) => Ok(json!({
                "update": { "name": name, "fields": encode_fields(&map) }
            })),
            other => Err(RemoteError::Decode(format!(
                "document body must be an object, got {other}"
            ))),
        }
    }

    async fn commit(&self, user: &UserSession, writes: Vec<Value>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        if writes.len() > self.max_batch_size {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!(
                    "batch of {} exceeds limit {}",
                    writes.len(),
                    self.max_batch_size
                ),
            });
        }
        let url = self.endpoint(&format!("{}/documents:commit", self.database_path()))?;
        self.post(user, url, &json!({ "writes": writes })).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FirestoreStore {
    fn provider_name(&self) -> &'static str {
        "firestore"
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn query_items(
        &self,
        user: &UserSession,
        updated_after: Option<Timestamp>,
    ) -> Result<Vec<ScheduleItem>> {
        let filter = updated_after.map(|t| {
            json!({
                "fieldFilter": {
                    "field": { "fieldPath": UPDATED_AT_FIELD },
                    "op": "GREATER_THAN",
                    "value": { "stringValue": format_timestamp(t) }
                }
            })
        });
        let documents = self
            .run_query_paged(user, EVENTS_COLLECTION, filter, &[UPDATED_AT_FIELD, NAME_FIELD])
            .await?;
        Ok(documents.iter().filter_map(decode_item).collect())
    }

    async fn batch_write(&self, user: &UserSession, items: &[ScheduleItem]) -> Result<()> {
        let writes = items
            .iter()
            .map(|item| {
                let value =
                    serde_json::to_value(item).map_err(|e| RemoteError::Decode(e.to_string()))?;
                self.update_write(
                    self.document_name(&user.uid, EVENTS_COLLECTION, &item.id),
                    value,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.commit(user, writes).await
    }

    async fn query_latest_messages(
        &self,
        user: &UserSession,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let query = json!({
            "from": [{ "collectionId": MESSAGES_COLLECTION }],
            "orderBy": [{ "field": { "fieldPath": "id" }, "direction": "DESCENDING" }],
            "limit": limit,
        });
        let documents = self.run_query(user, query).await?;
        Ok(documents.iter().filter_map(decode_message).collect())
    }

    async fn batch_write_messages(&self, user: &UserSession, messages: &[Message]) -> Result<()> {
        let writes = messages
            .iter()
            .map(|message| {
                let value = serde_json::to_value(message)
                    .map_err(|e| RemoteError::Decode(e.to_string()))?;
                self.update_write(
                    self.document_name(&user.uid, MESSAGES_COLLECTION, &message.id.to_string()),
                    value,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        self.commit(user, writes).await
    }

    async fn query_legacy(
        &self,
        user: &UserSession,
        collection: LegacyCollection,
    ) -> Result<Vec<Value>> {
        let documents = self
            .run_query_paged(user, collection.collection_id(), None, &[NAME_FIELD])
            .await?;
        documents.iter().map(Document::to_json).collect()
    }
}
