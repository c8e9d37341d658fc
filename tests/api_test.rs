use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use async_trait::async_trait;
use bytes::Bytes;
use profstore::app_state::AppState;
use profstore::config::DEFAULT_MAX_PAYLOAD_BYTES;
use profstore::error::StorageError;
use profstore::server::create_router;
use profstore::storage::{
    KvStorage, NewProfile, ProfileId, ProfileRecord, ProfileStream, Query, Reader, Writer,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn app_with_limit(max_payload_bytes: usize) -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(KvStorage::open(dir.path(), Duration::from_secs(3600)).unwrap());
    let state = AppState::new(storage.clone(), storage, "kv");
    (dir, create_router(state, max_payload_bytes))
}

fn app() -> (TempDir, Router) {
    app_with_limit(DEFAULT_MAX_PAYLOAD_BYTES)
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: impl Into<Body>,
) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn json(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

#[tokio::test]
async fn test_health_reports_backend() {
    let (_dir, app) = app();
    let (status, body) = send(&app, Method::GET, "/health", Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    let body = json(&body);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "kv");
}

#[tokio::test]
async fn test_write_find_and_fetch() {
    let (_dir, app) = app();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/0/profiles?service=api&type=cpu&created_at=2024-05-01T10:00:00Z",
        "profile payload",
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json(&body)["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/0/profiles?service=api&from=2024-05-01T00:00:00Z&to=2024-05-02T00:00:00Z",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let found = json(&body);
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["service"], "api");
    assert_eq!(found[0]["profile_type"], "cpu");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/0/profiles/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-profile-service"], "api");
    assert_eq!(response.headers()["x-profile-type"], "cpu");
    let payload = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&payload[..], b"profile payload");
}

#[tokio::test]
async fn test_unknown_type_is_bad_request() {
    let (_dir, app) = app();
    let (status, body) = send(&app, Method::POST, "/api/0/profiles?service=api&type=wall", "x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json(&body)["error"].as_str().unwrap().contains("wall"));
}

#[tokio::test]
async fn test_empty_range_is_bad_request() {
    let (_dir, app) = app();
    let (status, _) = send(
        &app,
        Method::GET,
        "/api/0/profiles?service=api&from=2024-05-02T00:00:00Z&to=2024-05-01T00:00:00Z",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_and_missing_ids_are_not_found() {
    let (_dir, app) = app();
    let (status, _) = send(&app, Method::GET, "/api/0/profiles/not-a-key", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        Method::GET,
        "/api/0/profiles/617069/01/01714557600000000000/0123456789abcdef",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_large_profile_is_accepted() {
    let (_dir, app) = app();
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/0/profiles?service=api&type=heap&created_at=2024-05-01T10:00:00Z",
        payload.clone(),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json(&body)["id"].as_str().unwrap().to_string();

    let (status, fetched) = send(&app, Method::GET, &format!("/api/0/profiles/{}", id), Body::empty()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, payload);
}

#[tokio::test]
async fn test_payload_over_configured_limit_is_rejected() {
    let (_dir, app) = app_with_limit(1024);
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/0/profiles?service=api&type=cpu",
        vec![0u8; 2048],
    )
    .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_service_with_control_characters_can_be_fetched() {
    let (_dir, app) = app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/0/profiles?service=a%0Ab&type=cpu&created_at=2024-05-01T10:00:00Z",
        "payload",
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = json(&body)["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/0/profiles/{}", id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-profile-service"], "a%0Ab");
}

/// Store whose reads panic, to exercise the router's panic handling.
struct PanickingStore;

#[async_trait]
impl Writer for PanickingStore {
    async fn write_profile(
        &self,
        _profile: NewProfile,
        _payload: Bytes,
        _cancel: &CancellationToken,
    ) -> Result<ProfileId, StorageError> {
        Err(StorageError::Closed)
    }
}

#[async_trait]
impl Reader for PanickingStore {
    async fn read_profile(
        &self,
        _id: &ProfileId,
        _cancel: &CancellationToken,
    ) -> Result<ProfileRecord, StorageError> {
        panic!("read exploded");
    }

    fn find_profiles(
        &self,
        _query: Query,
        _cancel: &CancellationToken,
    ) -> Result<ProfileStream, StorageError> {
        Err(StorageError::Closed)
    }
}

#[tokio::test]
async fn test_handler_panic_becomes_server_error() {
    let store = Arc::new(PanickingStore);
    let state = AppState::new(store.clone(), store, "test");
    let app = create_router(state, DEFAULT_MAX_PAYLOAD_BYTES);

    let (status, _) = send(
        &app,
        Method::GET,
        "/api/0/profiles/617069/01/01714557600000000000/0123456789abcdef",
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // The server keeps serving after the panic.
    let (status, _) = send(&app, Method::POST, "/api/0/profiles?service=api&type=cpu", "x").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
