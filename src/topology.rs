//! Fast heartbeat / topology-change probe.
//!
//! `HEAD /agents/{id}/heartbeat` is the cheap poll an agent runs between
//! full heartbeats: "has anything changed since the last event id I've
//! seen?" answered without a body, via status code alone (SPEC_FULL §4.4).

use chrono::Utc;

use crate::error::RegistryError;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastHeartbeatStatus {
    /// 200: nothing changed, caller's cursor is already current.
    Unchanged,
    /// 202: something changed since the caller's cursor; a full
    /// heartbeat/re-registration is warranted.
    Changed,
    /// 410: the calling agent itself has been evicted.
    Gone,
}

impl FastHeartbeatStatus {
    pub fn status_code(&self) -> axum::http::StatusCode {
        match self {
            FastHeartbeatStatus::Unchanged => axum::http::StatusCode::OK,
            FastHeartbeatStatus::Changed => axum::http::StatusCode::ACCEPTED,
            FastHeartbeatStatus::Gone => axum::http::StatusCode::GONE,
        }
    }
}

/// Determine the fast-heartbeat status for `agent_id`, given the last
/// event id it has already observed.
pub async fn probe(store: &Store, agent_id: &str, last_seen_event_id: i64) -> Result<FastHeartbeatStatus, RegistryError> {
    let agent = store.get_agent(agent_id).await?;
    if agent.is_none() {
        return Ok(FastHeartbeatStatus::Gone);
    }
    let agent = agent.unwrap();
    if agent.status == crate::models::AgentStatus::Evicted {
        return Ok(FastHeartbeatStatus::Gone);
    }

    store.touch_heartbeat(agent_id, Utc::now()).await?;

    let dependency_capabilities: Vec<String> = agent
        .dependencies
        .iter()
        .map(|d| d.capability.clone())
        .collect();

    let events = store.events_since(last_seen_event_id).await?;
    let relevant = events.iter().any(|e| e.affects(&dependency_capabilities) || e.agent_id == agent_id);

    if relevant {
        Ok(FastHeartbeatStatus::Changed)
    } else {
        Ok(FastHeartbeatStatus::Unchanged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentSnapshot, CapabilityDeclaration, DependencyDeclaration};

    async fn seed(store: &Store, agent_id: &str, capability: &str, dep_capability: Option<&str>) {
        let snapshot = AgentSnapshot {
            agent_id: agent_id.to_string(),
            name: "agent".to_string(),
            version: "1.0.0".to_string(),
            namespace: "default".to_string(),
            endpoint: "http://localhost:9000".to_string(),
            status: None,
            capabilities: vec![CapabilityDeclaration {
                function_name: "f".to_string(),
                capability: capability.to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                tags: vec![],
                dependencies: dep_capability
                    .map(|c| {
                        vec![DependencyDeclaration {
                            capability: c.to_string(),
                            tags: vec![],
                            version: None,
                            namespace: None,
                        }]
                    })
                    .unwrap_or_default(),
            }],
        };
        store.upsert_agent(&snapshot, Utc::now()).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_agent_is_gone() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let status = probe(&store, "ghost", 0).await.unwrap();
        assert_eq!(status, FastHeartbeatStatus::Gone);
    }

    #[tokio::test]
    async fn evicted_agent_is_gone() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        seed(&store, "a1", "c", None).await;
        store.set_status("a1", "evicted", Utc::now()).await.unwrap();
        let status = probe(&store, "a1", 0).await.unwrap();
        assert_eq!(status, FastHeartbeatStatus::Gone);
    }

    #[tokio::test]
    async fn unrelated_event_does_not_flag_changed() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        seed(&store, "consumer", "caller", Some("greeting")).await;
        store.record_event("register", "other", &["unrelated".into()], Utc::now()).await.unwrap();
        let status = probe(&store, "consumer", 0).await.unwrap();
        assert_eq!(status, FastHeartbeatStatus::Unchanged);
    }

    #[tokio::test]
    async fn dependency_affecting_event_flags_changed() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        seed(&store, "consumer", "caller", Some("greeting")).await;
        let before = store.latest_event_id().await.unwrap();
        store.record_event("register", "provider", &["greeting".into()], Utc::now()).await.unwrap();
        let status = probe(&store, "consumer", before).await.unwrap();
        assert_eq!(status, FastHeartbeatStatus::Changed);
    }
}
