// tests/api_http.rs
//
// HTTP-level tests for the public API Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - POST /sort (rule hit, cache hit, 422 on unknown category)
// - GET /categories, /folders, /stats, /debug/recent, /debug/rate-limit
// - POST /admin/backup (disabled and enabled)

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    Router,
};
use http::{Request, StatusCode};
use serde_json::json;
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use content_sorter::ai_adapter::{InferenceAdapter, MockBackend};
use content_sorter::analyze::{RuleClassifier, RuleSet};
use content_sorter::folders::{CategoryMap, PathBuilder};
use content_sorter::sync::{BackupSynchronizer, MockSink};
use content_sorter::{router, AppState, SortingEngine};

const BODY_LIMIT: usize = 1024 * 1024;

fn engine(base: &Path, rules: RuleSet) -> Arc<SortingEngine> {
    let map = CategoryMap::default_seed();
    let adapter = InferenceAdapter::new(Arc::new(MockBackend::answering("security", 0.6)), map.taxonomy());
    Arc::new(
        SortingEngine::new(RuleClassifier::new(&rules), PathBuilder::new(base, Arc::new(map))).with_inference(adapter),
    )
}

fn test_router(base: &Path) -> Router {
    router(AppState::new(engine(base, RuleSet::default_seed())))
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Json) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.expect("read body");
    let v = serde_json::from_slice(&bytes).unwrap_or(Json::Null);
    (status, v)
}

fn post_json(uri: &str, v: Json) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&v).expect("serialize")))
        .expect("build POST")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).expect("build GET")
}

#[tokio::test]
async fn health_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    assert_eq!(&bytes[..], b"ok");
}

#[tokio::test]
async fn sort_returns_outcome_json() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());

    let (status, v) = send(&app, post_json("/sort", json!({ "text": "React hooks with TypeScript" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["category"], "react_ecosystem");
    assert_eq!(v["source"], "rule");
    assert_eq!(v["technology"], "TypeScript");
    assert_eq!(v["folder_path"], "Frontend/React/TypeScript");
    assert_eq!(v["folder_created"], true);
    assert!(v["degraded"].is_null());
    assert_eq!(v["fingerprint"].as_str().map(str::len), Some(64));

    let (_, again) = send(&app, post_json("/sort", json!({ "text": "react hooks with typescript" }))).await;
    assert_eq!(again["folder_created"], false);
}

#[tokio::test]
async fn sort_unmatched_goes_through_inference_then_cache() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());
    let body = json!({ "text": "zero trust posture checklist for small teams", "sender": "bob" });

    let (_, first) = send(&app, post_json("/sort", body.clone())).await;
    assert_eq!(first["category"], "security");
    assert_eq!(first["source"], "inference");

    let (_, second) = send(&app, post_json("/sort", body)).await;
    assert_eq!(second["source"], "cache");
    assert_eq!(second["confidence"], first["confidence"]);

    let (_, recent) = send(&app, get("/debug/recent?n=5")).await;
    let rows = recent.as_array().expect("array");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1]["source"], "cache");
    assert!(!recent.to_string().contains("zero trust"), "raw text is not kept");

    let (_, rl) = send(&app, get("/debug/rate-limit")).await;
    assert_eq!(rl["limit"], 10);
    assert_eq!(rl["remaining"], 9);
}

#[tokio::test]
async fn unknown_category_maps_to_422() {
    let dir = tempfile::tempdir().unwrap();
    let mut rules = RuleSet::default_seed();
    rules.rules[0].category = "astrology".into();
    let app = router(AppState::new(engine(dir.path(), rules)));

    let (status, v) = send(&app, post_json("/sort", json!({ "text": "react hooks" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(v["error"], "invalid_category");
}

#[tokio::test]
async fn read_only_views() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());
    send(&app, post_json("/sort", json!({ "text": "CSS Grid layout tutorial" }))).await;

    let (status, cats) = send(&app, get("/categories")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cats["other"]["path"], "General/Other");
    assert_eq!(cats["css_styling"]["path"], "Frontend/CSS-Styling");

    let (_, tree) = send(&app, get("/folders")).await;
    assert!(tree["Frontend"]["CSS-Styling"].is_object());

    let (_, stats) = send(&app, get("/stats")).await;
    assert_eq!(stats["categories"]["css_styling"]["exists"], true);
    assert_eq!(stats["categories"]["security"]["exists"], false);
    assert_eq!(stats["inference_backends"], json!(["mock"]));
    assert!(stats["cache"]["capacity"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn admin_backup_disabled_and_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let app = test_router(dir.path());
    let (status, v) = send(&app, post_json("/admin/backup", json!({}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(v["error"], "backup_disabled");

    let sink = Arc::new(MockSink::new());
    let sync = Arc::new(BackupSynchronizer::new(dir.path(), sink.clone(), Duration::from_secs(3600)));
    let app = router(AppState::new(engine(dir.path(), RuleSet::default_seed())).with_backup(sync));
    send(&app, post_json("/sort", json!({ "text": "CSS Grid layout tutorial" }))).await;

    let (status, v) = send(&app, post_json("/admin/backup", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(v["outcome"], "synced");
    assert_eq!(v["added"], 2);
    assert_eq!(sink.call_count(), 1);

    let (_, v) = send(&app, post_json("/admin/backup", json!({}))).await;
    assert_eq!(v["outcome"], "no_changes");
}
