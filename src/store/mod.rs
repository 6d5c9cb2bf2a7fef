//! Storage abstraction over SQLite and PostgreSQL.
//!
//! The two backends differ in parameter placeholders, auto-increment
//! form, and datetime arithmetic. Rather than branch on backend at every
//! call site, [`Dialect`] captures those differences once and the rest
//! of the registry talks to the single [`Store`] enum below.

mod postgres;
mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::events::TopologyEvent;
use crate::models::{Agent, AgentSnapshot, Capability};

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// SQL dialect differences the store layer needs to paper over.
pub trait Dialect: Send + Sync {
    /// `INSERT ... ON CONFLICT (agent_id) DO UPDATE` fragment appropriate
    /// for this backend's upsert syntax.
    fn upsert_agent_sql(&self) -> &'static str;

    /// Expression selecting event rows newer than `$1` seconds of retention,
    /// relative to `now()`/`CURRENT_TIMESTAMP` in this dialect.
    fn prune_events_older_than_sql(&self) -> &'static str;

    fn name(&self) -> &'static str;
}

/// A connected store, dispatched to one of the two backends.
///
/// An enum rather than `Box<dyn Store>` because `sqlx::Pool<Sqlite>` and
/// `sqlx::Pool<Postgres>` are distinct concrete types with no shared
/// execution trait across backends without pulling in `sqlx::Any`, which
/// drops prepared-statement caching. The registry only ever holds one
/// variant for the process lifetime, selected once at startup.
#[derive(Clone)]
pub enum Store {
    Sqlite(SqliteStore),
    Postgres(PostgresStore),
}

impl Store {
    /// Connect to `database_url`, selecting SQLite or PostgreSQL by its
    /// scheme, and run startup migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        if database_url.starts_with("sqlite:") || database_url.starts_with("sqlite::") {
            Ok(Store::Sqlite(SqliteStore::connect(database_url).await?))
        } else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
            Ok(Store::Postgres(PostgresStore::connect(database_url).await?))
        } else {
            Err(StoreError::Migration(format!(
                "unrecognized database URL scheme in '{database_url}', expected sqlite: or postgres:"
            )))
        }
    }

    pub async fn upsert_agent(&self, snapshot: &AgentSnapshot, now: DateTime<Utc>) -> Result<(), StoreError> {
        match self {
            Store::Sqlite(s) => s.upsert_agent(snapshot, now).await,
            Store::Postgres(s) => s.upsert_agent(snapshot, now).await,
        }
    }

    pub async fn replace_capabilities(
        &self,
        agent_id: &str,
        capabilities: &[Capability],
    ) -> Result<(), StoreError> {
        match self {
            Store::Sqlite(s) => s.replace_capabilities(agent_id, capabilities).await,
            Store::Postgres(s) => s.replace_capabilities(agent_id, capabilities).await,
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        match self {
            Store::Sqlite(s) => s.get_agent(agent_id).await,
            Store::Postgres(s) => s.get_agent(agent_id).await,
        }
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        match self {
            Store::Sqlite(s) => s.list_agents().await,
            Store::Postgres(s) => s.list_agents().await,
        }
    }

    pub async fn list_capabilities_by_name(&self, capability: &str, namespace: &str) -> Result<Vec<Capability>, StoreError> {
        match self {
            Store::Sqlite(s) => s.list_capabilities_by_name(capability, namespace).await,
            Store::Postgres(s) => s.list_capabilities_by_name(capability, namespace).await,
        }
    }

    pub async fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        match self {
            Store::Sqlite(s) => s.touch_heartbeat(agent_id, now).await,
            Store::Postgres(s) => s.touch_heartbeat(agent_id, now).await,
        }
    }

    pub async fn set_status(&self, agent_id: &str, status: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        match self {
            Store::Sqlite(s) => s.set_status(agent_id, status, now).await,
            Store::Postgres(s) => s.set_status(agent_id, status, now).await,
        }
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        match self {
            Store::Sqlite(s) => s.delete_agent(agent_id).await,
            Store::Postgres(s) => s.delete_agent(agent_id).await,
        }
    }

    pub async fn record_event(&self, event_type: &str, agent_id: &str, affected_capabilities: &[String], now: DateTime<Utc>) -> Result<i64, StoreError> {
        match self {
            Store::Sqlite(s) => s.record_event(event_type, agent_id, affected_capabilities, now).await,
            Store::Postgres(s) => s.record_event(event_type, agent_id, affected_capabilities, now).await,
        }
    }

    pub async fn events_since(&self, event_id: i64) -> Result<Vec<TopologyEvent>, StoreError> {
        match self {
            Store::Sqlite(s) => s.events_since(event_id).await,
            Store::Postgres(s) => s.events_since(event_id).await,
        }
    }

    pub async fn latest_event_id(&self) -> Result<i64, StoreError> {
        match self {
            Store::Sqlite(s) => s.latest_event_id().await,
            Store::Postgres(s) => s.latest_event_id().await,
        }
    }

    pub async fn prune_events_older_than(&self, retention_seconds: i64) -> Result<u64, StoreError> {
        match self {
            Store::Sqlite(s) => s.prune_events_older_than(retention_seconds).await,
            Store::Postgres(s) => s.prune_events_older_than(retention_seconds).await,
        }
    }

    /// Agents whose `last_heartbeat_at` is older than `stale_after_seconds`
    /// and are not already in `exclude_status`.
    pub async fn stale_agents(&self, stale_after_seconds: i64, exclude_status: &str) -> Result<Vec<Agent>, StoreError> {
        match self {
            Store::Sqlite(s) => s.stale_agents(stale_after_seconds, exclude_status).await,
            Store::Postgres(s) => s.stale_agents(stale_after_seconds, exclude_status).await,
        }
    }

    /// Agents in `evicted` status whose transition into that status is
    /// older than `grace_period_seconds` — ripe for physical deletion.
    pub async fn evicted_before(&self, grace_period_seconds: i64) -> Result<Vec<Agent>, StoreError> {
        match self {
            Store::Sqlite(s) => s.evicted_before(grace_period_seconds).await,
            Store::Postgres(s) => s.evicted_before(grace_period_seconds).await,
        }
    }
}
