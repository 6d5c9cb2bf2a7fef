//! End-to-end scenario tests driving the axum router directly against an
//! in-memory SQLite store, covering the canonical scenarios.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use mcp_mesh_registry::config::RegistryConfig;
use mcp_mesh_registry::http::{build_router, AppState};
use mcp_mesh_registry::registration::RegistrationService;
use mcp_mesh_registry::store::Store;

async fn test_app() -> (axum::Router, Arc<AppState>) {
    std::env::remove_var("HOST");
    std::env::remove_var("PORT");
    std::env::remove_var("DATABASE_URL");
    let mut config = RegistryConfig::resolve(Default::default()).unwrap();
    config.database_url = "sqlite::memory:".to_string();
    config.tracing_enabled = false;

    let store = Store::connect(&config.database_url).await.unwrap();
    let registration = RegistrationService::new(store);
    let trace_status = mcp_mesh_registry::trace::status::TraceStatus::new();
    let state = Arc::new(AppState { registration, config, trace_status });
    (build_router(state.clone()), state)
}

async fn post_json(router: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, parsed)
}

fn snapshot(agent_id: &str, capability: &str, tags: &[&str], dependencies: Value) -> Value {
    json!({
        "agent_id": agent_id,
        "name": agent_id,
        "version": "1.0.0",
        "namespace": "default",
        "endpoint": format!("http://{agent_id}:9000"),
        "capabilities": [{
            "function_name": "call",
            "capability": capability,
            "version": "1.0.0",
            "tags": tags,
            "dependencies": dependencies,
        }]
    })
}

#[tokio::test]
async fn s1_basic_resolve() {
    let (router, _) = test_app().await;

    post_json(&router, "/agents/register", snapshot("date-svc", "date_service", &["utc"], json!([]))).await;

    let (status, body) = post_json(
        &router,
        "/agents/register",
        snapshot(
            "greeter",
            "greeting",
            &[],
            json!([{ "capability": "date_service", "tags": ["utc"] }]),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["dependencies_resolved"], 1);
    assert_eq!(body["resolved_dependencies"]["date_service"]["agent_id"], "date-svc");
}

#[tokio::test]
async fn s2_preference_then_fallback() {
    let (router, _) = test_app().await;

    for (id, tag) in [("p-haiku", "haiku"), ("p-sonnet", "sonnet"), ("p-opus", "opus")] {
        post_json(&router, "/agents/register", snapshot(id, "claude", &["claude", tag], json!([]))).await;
    }

    let dep = json!([{ "capability": "claude", "tags": ["claude", "+opus", "-experimental"] }]);
    let (_, body) = post_json(&router, "/agents/register", snapshot("consumer", "caller", &[], dep.clone())).await;
    assert_eq!(body["resolved_dependencies"]["claude"]["agent_id"], "p-opus");

    // p-opus is gone now.
    let delete_request = Request::builder()
        .method(Method::DELETE)
        .uri("/agents/p-opus")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(delete_request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (_, body) = post_json(&router, "/agents/register", snapshot("consumer", "caller", &[], dep)).await;
    let fallback = body["resolved_dependencies"]["claude"]["agent_id"].as_str().unwrap();
    assert!(fallback == "p-sonnet" || fallback == "p-haiku");
}

#[tokio::test]
async fn s3_exclusion_leaves_dependency_unresolved() {
    let (router, _) = test_app().await;
    post_json(
        &router,
        "/agents/register",
        snapshot("p-exp", "claude", &["claude", "experimental"], json!([])),
    )
    .await;

    let dep = json!([{ "capability": "claude", "tags": ["claude", "-experimental"] }]);
    let (_, body) = post_json(&router, "/agents/register", snapshot("consumer", "caller", &[], dep)).await;
    assert_eq!(body["dependencies_resolved"], 0);
    assert!(body["resolved_dependencies"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn s5_evicted_agent_head_returns_410_then_reregisters_clean() {
    let (router, state) = test_app().await;
    post_json(&router, "/agents/register", snapshot("a1", "greeting", &[], json!([]))).await;
    state.registration.store().set_status("a1", "evicted", Utc::now()).await.unwrap();

    let request = Request::builder()
        .method(Method::HEAD)
        .uri("/agents/a1/heartbeat?since=0")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::GONE);

    let (status, _) = post_json(&router, "/agents/register", snapshot("a1", "greeting", &[], json!([]))).await;
    assert_eq!(status, StatusCode::OK);
    let agent = state.registration.store().get_agent("a1").await.unwrap().unwrap();
    assert_eq!(agent.status, mcp_mesh_registry::models::AgentStatus::Healthy);
}

#[tokio::test]
async fn duplicate_function_name_is_rejected_with_400() {
    let (router, _) = test_app().await;
    let mut body = snapshot("a1", "greeting", &[], json!([]));
    let cap = body["capabilities"][0].clone();
    body["capabilities"].as_array_mut().unwrap().push(cap);
    let (status, response) = post_json(&router, "/agents/register", body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error_code"], "duplicate_function_name");
}

#[tokio::test]
async fn health_and_discover_endpoints_reflect_registered_agents() {
    let (router, _) = test_app().await;
    post_json(&router, "/agents/register", snapshot("a1", "greeting", &[], json!([]))).await;

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["agent_count"], 1);

    let request = Request::builder().uri("/services/discover/greeting").body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["providers"][0]["agent_id"], "a1");
}

#[tokio::test]
async fn s6_trace_assembly_orders_out_of_order_spans() {
    use mcp_mesh_registry::trace::correlator::Correlator;
    use mcp_mesh_registry::trace::exporter::Exporter;
    use mcp_mesh_registry::trace::model::SpanEvent;
    use std::sync::Mutex;

    struct CapturingExporter {
        captured: Mutex<Vec<mcp_mesh_registry::trace::model::Trace>>,
    }

    #[async_trait::async_trait]
    impl Exporter for CapturingExporter {
        async fn export(&self, trace: &mcp_mesh_registry::trace::model::Trace) {
            self.captured.lock().unwrap().push(trace.clone());
        }
    }

    fn span(trace_id: &str, span_id: &str, parent: Option<&str>) -> SpanEvent {
        SpanEvent {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: parent.map(|s| s.to_string()),
            agent_id: "agent".to_string(),
            operation: span_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            status_code: None,
            attributes: Default::default(),
        }
    }

    let exporter = Arc::new(CapturingExporter { captured: Mutex::new(Vec::new()) });
    struct ArcExporter(Arc<CapturingExporter>);
    #[async_trait::async_trait]
    impl Exporter for ArcExporter {
        async fn export(&self, trace: &mcp_mesh_registry::trace::model::Trace) {
            self.0.export(trace).await;
        }
    }

    let mut correlator = Correlator::new(
        Box::new(ArcExporter(exporter.clone())),
        mcp_mesh_registry::trace::status::TraceStatus::new(),
    );
    let now = Utc::now();

    // Arrive out of order: C, A, B, duplicate B.
    correlator.ingest(span("t1", "C", Some("B")), now);
    correlator.ingest(span("t1", "A", None), now);
    correlator.ingest(span("t1", "B", Some("A")), now);
    correlator.ingest(span("t1", "B", Some("A")), now);

    // Structurally complete immediately, but still within the quiet period.
    correlator.sweep(now).await;
    assert!(exporter.captured.lock().unwrap().is_empty(), "must wait out the quiet period");

    correlator.sweep(now + chrono::Duration::seconds(6)).await;

    let captured = exporter.captured.lock().unwrap();
    assert_eq!(captured.len(), 1);
    assert_eq!(captured[0].spans.len(), 3);
    assert!(captured[0].is_structurally_complete());
}
