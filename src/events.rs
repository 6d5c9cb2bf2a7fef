//! Topology event log types.
//!
//! A topology event is a durable record of a change that might affect
//! some consumer's resolution. The HEAD fast-heartbeat path answers
//! "has anything changed since <timestamp>?" by scanning this log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Register,
    Update,
    Unregister,
    Unhealthy,
    Evicted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Register => "register",
            EventType::Update => "update",
            EventType::Unregister => "unregister",
            EventType::Unhealthy => "unhealthy",
            EventType::Evicted => "evicted",
        }
    }
}

/// A single row in the append-only topology event log.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TopologyEvent {
    pub event_id: i64,
    pub event_type: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[sqlx(json)]
    pub affected_capabilities: Vec<String>,
}

impl TopologyEvent {
    /// Whether this event could matter to a consumer that depends on any
    /// of `dependency_capabilities`.
    pub fn affects(&self, dependency_capabilities: &[String]) -> bool {
        self.affected_capabilities
            .iter()
            .any(|cap| dependency_capabilities.iter().any(|dep| dep == cap))
    }
}
