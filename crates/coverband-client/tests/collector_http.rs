use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use coverband_client::{
    ClientConfig, CoverageOptions, CoverageReport, CoverageType, SaveOutcome, ServiceStore,
};

#[derive(Debug, Clone)]
struct Captured {
    token: Option<String>,
    content_type: Option<String>,
    body: Value,
}

#[derive(Default)]
struct Collector {
    posts: Mutex<Vec<Captured>>,
    coverage_queries: Mutex<Vec<HashMap<String, String>>>,
    coverage_body: Mutex<String>,
}

async fn collect(
    State(state): State<Arc<Collector>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let parsed = serde_json::from_slice(&body).unwrap_or(Value::Null);
    state.posts.lock().unwrap().push(Captured {
        token: header("coverband-token"),
        content_type: header("content-type"),
        body: parsed,
    });
    StatusCode::OK
}

async fn coverage(
    State(state): State<Arc<Collector>>,
    Query(query): Query<HashMap<String, String>>,
) -> String {
    state.coverage_queries.lock().unwrap().push(query);
    state.coverage_body.lock().unwrap().clone()
}

async fn legacy_coverage(
    State(state): State<Arc<Collector>>,
    Path(id): Path<String>,
    Query(mut query): Query<HashMap<String, String>>,
) -> String {
    query.insert("id".into(), id);
    state.coverage_queries.lock().unwrap().push(query);
    state.coverage_body.lock().unwrap().clone()
}

async fn spawn_collector(coverage_body: &str) -> (SocketAddr, Arc<Collector>) {
    let state = Arc::new(Collector::default());
    *state.coverage_body.lock().unwrap() = coverage_body.to_string();
    let app = Router::new()
        .route("/api/collector", post(collect))
        .route("/api/coverage", get(coverage))
        .route("/api/coverage/:id", get(legacy_coverage))
        .with_state(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

fn config_for(addr: SocketAddr, api_key: Option<&str>) -> ClientConfig {
    ClientConfig::new(&format!("http://{addr}"), api_key)
        .expect("config")
        .with_runtime_env("production")
        .with_process_type("web")
        .with_timeout(Duration::from_secs(2))
        .with_roots(vec!["/srv/app/".into()])
}

fn report() -> CoverageReport {
    let mut report = CoverageReport::new();
    report.insert("/srv/app/app/models/user.rb".into(), json!([1, null, 3]));
    report
}

#[tokio::test]
async fn persistent_store_posts_delta_with_token() {
    let (addr, collector) = spawn_collector("{}").await;
    let store = ServiceStore::persistent(config_for(addr, Some("secret-token")));

    assert_eq!(store.save_report(report()).await, SaveOutcome::Sent);
    assert_eq!(store.save_report(report()).await, SaveOutcome::Sent);

    let posts = collector.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 2);
    let first = &posts[0];
    assert_eq!(first.token.as_deref(), Some("secret-token"));
    assert_eq!(first.content_type.as_deref(), Some("application/json"));
    assert_eq!(first.body["data"]["collection_type"], "coverage_delta");
    let package = &first.body["data"]["collection_data"];
    assert_eq!(package["tags"]["process_type"], "web");
    assert_eq!(package["tags"]["runtime_env"], "production");
    assert_eq!(
        package["file_coverage"]["app/models/user.rb"]["data"],
        json!([1, null, 3])
    );
    assert_ne!(posts[0].body["remote_uuid"], posts[1].body["remote_uuid"]);
}

#[tokio::test]
async fn missing_api_key_never_reaches_the_collector() {
    let (addr, collector) = spawn_collector("{}").await;
    let store = ServiceStore::simple(config_for(addr, None));

    assert_eq!(store.save_report(report()).await, SaveOutcome::Dropped);
    assert!(collector.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_report_is_not_sent() {
    let (addr, collector) = spawn_collector("{}").await;
    let store = ServiceStore::persistent(config_for(addr, Some("k")));

    assert_eq!(
        store.save_report(CoverageReport::new()).await,
        SaveOutcome::Skipped
    );
    assert!(collector.posts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reads_coverage_snapshot() {
    let (addr, collector) = spawn_collector(r#"{"app/models/user.rb":{"data":[1,0]}}"#).await;
    let store = ServiceStore::simple(config_for(addr, Some("k")));

    let snapshot = store
        .coverage(
            Some(CoverageType::EagerLoading),
            CoverageOptions {
                override_type: None,
                env_filter: Some("production".into()),
            },
        )
        .await
        .expect("snapshot");
    assert_eq!(snapshot["app/models/user.rb"]["data"], json!([1, 0]));

    let queries = collector.coverage_queries.lock().unwrap().clone();
    assert_eq!(queries[0].get("type").map(String::as_str), Some("eager_loading"));
    assert_eq!(
        queries[0].get("env_filter").map(String::as_str),
        Some("production")
    );
}

#[tokio::test]
async fn legacy_coverage_path_carries_the_id() {
    let (addr, collector) = spawn_collector(r#"{"ok":true}"#).await;
    let config = config_for(addr, Some("k")).with_coverband_id(Some("demo".into()));
    let store = ServiceStore::persistent(config);

    let snapshot = store.coverage(None, CoverageOptions::default()).await;
    assert_eq!(snapshot, Some(json!({"ok": true})));
    let queries = collector.coverage_queries.lock().unwrap().clone();
    assert_eq!(queries[0].get("id").map(String::as_str), Some("demo"));
    assert_eq!(queries[0].get("type").map(String::as_str), Some("runtime"));
}

#[tokio::test]
async fn malformed_coverage_body_yields_none() {
    let (addr, _collector) = spawn_collector("<html>maintenance</html>").await;
    let store = ServiceStore::persistent(config_for(addr, Some("k")));
    assert_eq!(store.coverage(None, CoverageOptions::default()).await, None);
}

#[tokio::test]
async fn unreachable_collector_is_swallowed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let persistent = ServiceStore::persistent(config_for(addr, Some("k")));
    assert_eq!(persistent.save_report(report()).await, SaveOutcome::Dropped);

    let simple = ServiceStore::simple(config_for(addr, Some("k")));
    assert_eq!(simple.save_report(report()).await, SaveOutcome::Dropped);
}

#[tokio::test]
async fn view_tracker_posts_relative_paths() {
    let (addr, collector) = spawn_collector("{}").await;
    let store = ServiceStore::persistent(config_for(addr, Some("k")));
    let views = store.view_tracker();
    views.track("/srv/app/app/views/home/index.html.erb");
    views.track("/srv/app/app/views/layouts/application.html.erb");

    assert_eq!(views.report_views_tracked().await, SaveOutcome::Sent);
    assert!(views.pending().is_empty());

    let posts = collector.posts.lock().unwrap().clone();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].body["data"]["collection_type"], "view_tracker_delta");
    assert_eq!(
        posts[0].body["data"]["collection_data"]["tracked_views"],
        json!([
            "app/views/home/index.html.erb",
            "app/views/layouts/application.html.erb"
        ])
    );
}
