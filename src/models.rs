//! Core domain types: agents, capabilities, dependency declarations, and
//! the wire DTOs the HTTP surface exchanges with agents.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an agent. Transitions are monotone within one
/// lifecycle: `Healthy -> Unhealthy -> Evicted`; a new registration
/// resets to `Healthy` (invariant 3, SPEC_FULL §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Healthy,
    Unhealthy,
    Evicted,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Unhealthy => "unhealthy",
            AgentStatus::Evicted => "evicted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "unhealthy" => AgentStatus::Unhealthy,
            "evicted" => AgentStatus::Evicted,
            _ => AgentStatus::Healthy,
        }
    }
}

/// A dependency declaration's tags, split into the three disjoint sets
/// the resolver filters and scores on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    pub required: BTreeSet<String>,
    pub preferred: BTreeSet<String>,
    pub excluded: BTreeSet<String>,
}

impl TagSet {
    /// Parse tags of the form `"utc"`, `"+opus"`, `"-experimental"` into
    /// the three disjoint sets by prefix.
    pub fn parse(tags: &[String]) -> Self {
        let mut set = TagSet::default();
        for tag in tags {
            if let Some(rest) = tag.strip_prefix('+') {
                set.preferred.insert(rest.to_string());
            } else if let Some(rest) = tag.strip_prefix('-') {
                set.excluded.insert(rest.to_string());
            } else {
                set.required.insert(tag.clone());
            }
        }
        set
    }
}

/// A consumer-side description of a required capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    pub capability: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// A capability advertised by an agent, as declared in a registration body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDeclaration {
    pub function_name: String,
    pub capability: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<DependencyDeclaration>,
}

impl CapabilityDeclaration {
    /// The part of this declaration that identity/diffing compares: set
    /// equality by (function_name, capability, version, sorted tags).
    pub fn identity_key(&self) -> (String, String, String, Vec<String>) {
        let mut tags = self.tags.clone();
        tags.sort();
        (
            self.function_name.clone(),
            self.capability.clone(),
            self.version.clone(),
            tags,
        )
    }
}

/// A capability row as stored, owned by exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Capability {
    pub agent_id: String,
    pub function_name: String,
    pub capability: String,
    pub version: String,
    pub description: String,
    /// Stored as a JSON array; kept as a real `Vec` in memory.
    #[sqlx(json)]
    pub tags: Vec<String>,
}

/// An agent row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub namespace: String,
    pub endpoint: String,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// When `status` last transitioned. Drives the evicted-row grace
    /// period: an evicted agent is purged once this is older than the
    /// topology-event retention window.
    pub status_changed_at: DateTime<Utc>,
    pub total_dependencies: i64,
    pub dependencies_resolved: i64,
    pub capabilities: Vec<Capability>,
    pub dependencies: Vec<DependencyDeclaration>,
}

/// Ephemeral projection produced by the resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedDependency {
    pub agent_id: String,
    pub function_name: String,
    pub endpoint: String,
    pub capability: String,
    pub score: i64,
}

/// A candidate provider the resolver considers for a dependency.
#[derive(Debug, Clone)]
pub struct ProviderCandidate {
    pub agent_id: String,
    pub function_name: String,
    pub endpoint: String,
    pub capability: String,
    pub version: String,
    pub tags: Vec<String>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// Inbound body for `POST /agents/register` and `POST /agents/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub endpoint: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDeclaration>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

/// Canonical response shape for registration/heartbeat (SPEC_FULL §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub agent_id: String,
    pub registered_at: DateTime<Utc>,
    pub resolved_dependencies: HashMap<String, ResolvedDependency>,
    pub dependencies_resolved: i64,
    pub total_dependencies: i64,
}
