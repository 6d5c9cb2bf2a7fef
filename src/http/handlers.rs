use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use super::AppState;
use crate::error::RegistryError;
use crate::models::{AgentSnapshot, RegistrationResponse};
use crate::topology;

pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<AgentSnapshot>,
) -> Result<Json<RegistrationResponse>, RegistryError> {
    let response = state.registration.register(snapshot, Utc::now()).await?;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    agent_id: String,
    acknowledged: bool,
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Json<HeartbeatResponse>, RegistryError> {
    let acknowledged = state.registration.heartbeat(&agent_id, Utc::now()).await?;
    Ok(Json(HeartbeatResponse { agent_id, acknowledged }))
}

#[derive(serde::Deserialize)]
pub struct FastHeartbeatQuery {
    #[serde(default)]
    since: i64,
}

pub async fn fast_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Query(query): Query<FastHeartbeatQuery>,
) -> Result<Response, RegistryError> {
    let status = topology::probe(state.registration.store(), &agent_id, query.since).await?;
    Ok(status.status_code().into_response())
}

pub async fn unregister(State(state): State<Arc<AppState>>, Path(agent_id): Path<String>) -> Result<StatusCode, RegistryError> {
    state.registration.unregister(&agent_id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_agents(State(state): State<Arc<AppState>>) -> Result<Json<Vec<crate::models::Agent>>, RegistryError> {
    let agents = state.registration.store().list_agents().await?;
    Ok(Json(agents))
}

#[derive(Debug, Serialize)]
pub struct DiscoverResponse {
    capability: String,
    providers: Vec<ProviderSummary>,
}

#[derive(Debug, Serialize)]
pub struct ProviderSummary {
    agent_id: String,
    function_name: String,
    endpoint: String,
    version: String,
    tags: Vec<String>,
}

#[derive(serde::Deserialize)]
pub struct DiscoverQuery {
    #[serde(default = "default_discover_namespace")]
    namespace: String,
}

fn default_discover_namespace() -> String {
    "default".to_string()
}

pub async fn discover(
    State(state): State<Arc<AppState>>,
    Path(capability): Path<String>,
    Query(query): Query<DiscoverQuery>,
) -> Result<Json<DiscoverResponse>, RegistryError> {
    let store = state.registration.store();
    let rows = store.list_capabilities_by_name(&capability, &query.namespace).await?;
    let mut providers = Vec::with_capacity(rows.len());
    for cap in rows {
        let endpoint = store
            .get_agent(&cap.agent_id)
            .await?
            .map(|a| a.endpoint)
            .unwrap_or_default();
        providers.push(ProviderSummary {
            agent_id: cap.agent_id,
            function_name: cap.function_name,
            endpoint,
            version: cap.version,
            tags: cap.tags,
        });
    }
    Ok(Json(DiscoverResponse { capability, providers }))
}

#[derive(Debug, Serialize)]
pub struct TraceStatusResponse {
    tracing_enabled: bool,
    exporter: &'static str,
    stream_name: String,
    consumer_group: String,
    consumer_connected: bool,
    active_traces: i64,
    exported_total: u64,
    dropped_total: u64,
    last_error: Option<String>,
}

pub async fn trace_status(State(state): State<Arc<AppState>>) -> Json<TraceStatusResponse> {
    let config = &state.config;
    let exporter = match config.trace_exporter {
        crate::config::TraceExporterKind::Otlp => "otlp",
        crate::config::TraceExporterKind::Console => "console",
        crate::config::TraceExporterKind::Json => "json",
    };
    let snapshot = state.trace_status.snapshot().await;
    Json(TraceStatusResponse {
        tracing_enabled: config.tracing_enabled,
        exporter,
        stream_name: config.stream_name.clone(),
        consumer_group: config.consumer_group.clone(),
        consumer_connected: snapshot.consumer_connected,
        active_traces: snapshot.active_traces,
        exported_total: snapshot.exported_total,
        dropped_total: snapshot.dropped_total,
        last_error: snapshot.last_error,
    })
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    agent_count: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, RegistryError> {
    let agents = state.registration.store().list_agents().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        agent_count: agents.len(),
    }))
}
