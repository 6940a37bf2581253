//! Firestore REST 适配器的 HTTP 层测试（mockito）

mod common;

use assert_matches::assert_matches;
use mockito::Matcher;
use serde_json::json;

use common::*;
use schedule_sync_lib::remote::{
    FirestoreStore, RemoteError, RemoteProvider, RemoteStore, RemoteStoreConfig,
};

const RUN_QUERY_PATH: &str = "/projects/demo/databases/(default)/documents/users/user-1:runQuery";
const COMMIT_PATH: &str = "/projects/demo/databases/(default)/documents:commit";

fn store(server: &mockito::ServerGuard) -> FirestoreStore {
    FirestoreStore::new(&RemoteStoreConfig {
        provider: RemoteProvider::Firestore,
        project_id: "demo".into(),
        api_base: server.url(),
        ..Default::default()
    })
    .unwrap()
}

fn event_document(id: &str, title: &str, updated: &str) -> serde_json::Value {
    json!({
        "document": {
            "name": format!("projects/demo/databases/(default)/documents/users/user-1/events/{id}"),
            "fields": {
                "type": { "stringValue": "manual_todo" },
                "title": { "stringValue": title },
                "isAllDay": { "booleanValue": false },
                "isCompleted": { "booleanValue": false },
                "isDeleted": { "booleanValue": false },
                "createdAt": { "stringValue": "2023-01-01T00:00:00.000Z" },
                "updatedAt": { "stringValue": updated }
            }
        },
        "readTime": "2024-03-01T00:00:00Z"
    })
}

#[tokio::test]
async fn test_query_items_sends_watermark_filter() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", RUN_QUERY_PATH)
        .match_header("authorization", "Bearer id-token")
        .match_body(Matcher::PartialJson(json!({
            "structuredQuery": {
                "from": [{ "collectionId": "events" }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "updatedAt" },
                        "op": "GREATER_THAN",
                        "value": { "stringValue": "2024-01-01T00:00:00.000Z" }
                    }
                }
            }
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([
                event_document("X", "B", "2024-01-02T00:00:00.000Z"),
                // 缺少必需字段的文档会被跳过
                { "document": { "name": "projects/demo/databases/(default)/documents/users/user-1/events/broken", "fields": {} } }
            ])
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;

    let items = store(&server)
        .query_items(&user(), Some(ts("2024-01-01T00:00:00.000Z")))
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, "X");
    assert_eq!(items[0].title, "B");
    assert_eq!(items[0].updated_at, ts("2024-01-02T00:00:00.000Z"));
}

#[tokio::test]
async fn test_batch_write_commits_update_writes() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", COMMIT_PATH)
        .match_header("authorization", "Bearer id-token")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(
                r#""name":"projects/demo/databases/\(default\)/documents/users/user-1/events/X""#
                    .into(),
            ),
            Matcher::Regex(r#""title":\{"stringValue":"A"\}"#.into()),
        ]))
        .with_status(200)
        .with_body(r#"{"writeResults":[{}],"commitTime":"2024-03-01T00:00:00Z"}"#)
        .expect(1)
        .create_async()
        .await;

    store(&server)
        .batch_write(&user(), &[item("X", "A", "2024-01-01T00:00:00.000Z")])
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_latest_message_query_and_decode() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", RUN_QUERY_PATH)
        .match_body(Matcher::PartialJson(json!({
            "structuredQuery": {
                "from": [{ "collectionId": "messages" }],
                "orderBy": [{ "field": { "fieldPath": "id" }, "direction": "DESCENDING" }],
                "limit": 1
            }
        })))
        .with_status(200)
        .with_body(
            json!([{
                "document": {
                    "name": "projects/demo/databases/(default)/documents/users/user-1/messages/42",
                    "fields": {
                        "sender": { "stringValue": "teacher" },
                        "content": { "stringValue": "hello" },
                        "attachmentPaths": { "arrayValue": {} }
                    }
                }
            }])
            .to_string(),
        )
        .create_async()
        .await;

    let latest = store(&server)
        .query_latest_messages(&user(), 1)
        .await
        .unwrap();
    mock.assert_async().await;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, 42);
    assert_eq!(latest[0].sender, "teacher");
}

#[tokio::test]
async fn test_empty_query_result() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", RUN_QUERY_PATH)
        .with_status(200)
        .with_body(r#"[{"readTime":"2024-03-01T00:00:00Z"}]"#)
        .create_async()
        .await;

    let items = store(&server).query_items(&user(), None).await.unwrap();
    assert!(items.is_empty());
}

#[tokio::test]
async fn test_unauthorized_maps_to_auth() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", RUN_QUERY_PATH)
        .with_status(401)
        .with_body(r#"{"error":{"code":401,"message":"Request had invalid authentication credentials.","status":"UNAUTHENTICATED"}}"#)
        .create_async()
        .await;

    let err = store(&server).query_items(&user(), None).await.unwrap_err();
    assert_matches!(err, RemoteError::Auth(_));
}

#[tokio::test]
async fn test_service_unavailable_is_transient() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", COMMIT_PATH)
        .with_status(503)
        .with_body("backend unavailable")
        .create_async()
        .await;

    let err = store(&server)
        .batch_write(&user(), &[item("X", "A", "2024-01-01T00:00:00.000Z")])
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_bad_request_is_rejected() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", COMMIT_PATH)
        .with_status(400)
        .with_body(r#"{"error":{"code":400,"message":"Invalid document name"}}"#)
        .create_async()
        .await;

    let err = store(&server)
        .batch_write(&user(), &[item("X", "A", "2024-01-01T00:00:00.000Z")])
        .await
        .unwrap_err();
    assert_matches!(err, RemoteError::Rejected { status: 400, ref message } if message == "Invalid document name");
}

#[tokio::test]
async fn test_oversized_batch_is_rejected_locally() {
    let server = mockito::Server::new_async().await;
    let store = FirestoreStore::new(&RemoteStoreConfig {
        project_id: "demo".into(),
        api_base: server.url(),
        max_batch_size: 2,
        ..Default::default()
    })
    .unwrap();

    let items: Vec<_> = (0..3)
        .map(|i| item(&format!("item-{i}"), "bulk", "2024-01-01T00:00:00.000Z"))
        .collect();
    let err = store.batch_write(&user(), &items).await.unwrap_err();
    assert_matches!(err, RemoteError::Rejected { status: 400, .. });
}
