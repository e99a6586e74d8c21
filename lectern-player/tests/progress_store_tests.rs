//! Remote progress store against a stub `/progress` API

mod helpers;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use helpers::spawn_http;
use lectern_common::events::{ProgressKind, ProgressRecord};
use lectern_player::progress::{HttpProgressStore, ProgressStore};
use lectern_player::Error;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ProgressApi {
    records: Mutex<HashMap<(String, String), ProgressRecord>>,
    queries: Mutex<Vec<String>>,
}

#[derive(Deserialize)]
struct KindQuery {
    #[serde(rename = "type")]
    kind: String,
}

async fn save(State(api): State<Arc<ProgressApi>>, Json(record): Json<ProgressRecord>) -> StatusCode {
    let key = (record.chapter_id.to_string(), record.kind.to_string());
    api.records.lock().unwrap().insert(key, record);
    StatusCode::NO_CONTENT
}

async fn load(
    State(api): State<Arc<ProgressApi>>,
    Path(chapter_id): Path<String>,
    Query(query): Query<KindQuery>,
) -> Response {
    api.queries.lock().unwrap().push(query.kind.clone());
    match api.records.lock().unwrap().get(&(chapter_id, query.kind)) {
        Some(record) => Json(record.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn start_api() -> (Arc<ProgressApi>, HttpProgressStore) {
    let api = Arc::new(ProgressApi::default());
    let router = Router::new()
        .route("/api/progress", put(save))
        .route("/api/progress/chapter/:chapter_id", get(load))
        .with_state(Arc::clone(&api));
    let base_url = spawn_http(router).await;
    (api, HttpProgressStore::new(&format!("{}/api/", base_url)))
}

fn record(value: f64, total: f64) -> ProgressRecord {
    ProgressRecord {
        book_id: "book-1".into(),
        chapter_id: "chapter-1".into(),
        kind: ProgressKind::Listen,
        value,
        total: Some(total),
    }
}

#[tokio::test]
async fn test_save_then_load_roundtrip() {
    let (api, store) = start_api().await;

    store.save(&record(4.0, 10.0)).await.unwrap();
    let loaded = store
        .load(&"chapter-1".into(), ProgressKind::Listen)
        .await
        .unwrap();

    assert_eq!(loaded, Some(record(4.0, 10.0)));
    assert_eq!(loaded.unwrap().fraction(), Some(0.4));
    assert_eq!(api.queries.lock().unwrap().as_slice(), &["listen".to_string()]);
}

#[tokio::test]
async fn test_missing_record_is_none() {
    let (_api, store) = start_api().await;
    store.save(&record(1.0, 2.0)).await.unwrap();

    let other_chapter = store
        .load(&"chapter-2".into(), ProgressKind::Listen)
        .await
        .unwrap();
    let other_kind = store
        .load(&"chapter-1".into(), ProgressKind::Read)
        .await
        .unwrap();

    assert_eq!(other_chapter, None);
    assert_eq!(other_kind, None);
}

#[tokio::test]
async fn test_null_body_is_none() {
    let router = Router::new().route(
        "/progress/chapter/:chapter_id",
        get(|| async { Json(serde_json::Value::Null) }),
    );
    let store = HttpProgressStore::new(&spawn_http(router).await);

    let loaded = store
        .load(&"chapter-1".into(), ProgressKind::Listen)
        .await
        .unwrap();
    assert_eq!(loaded, None);
}

#[tokio::test]
async fn test_server_error_is_reported() {
    let router = Router::new()
        .route(
            "/progress",
            put(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "database down") }),
        )
        .route(
            "/progress/chapter/:chapter_id",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        );
    let store = HttpProgressStore::new(&spawn_http(router).await);

    match store.save(&record(1.0, 2.0)).await {
        Err(Error::Remote { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "database down");
        }
        other => panic!("expected remote error, got {:?}", other),
    }
    match store.load(&"chapter-1".into(), ProgressKind::Listen).await {
        Err(Error::Remote { status, .. }) => assert_eq!(status, 503),
        other => panic!("expected remote error, got {:?}", other),
    }
}
