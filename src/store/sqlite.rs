use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use super::Dialect;
use crate::error::StoreError;
use crate::events::TopologyEvent;
use crate::models::{Agent, AgentSnapshot, AgentStatus, Capability, DependencyDeclaration};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    agent_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    version TEXT NOT NULL,
    namespace TEXT NOT NULL,
    endpoint TEXT NOT NULL,
    status TEXT NOT NULL,
    registered_at TEXT NOT NULL,
    last_heartbeat_at TEXT NOT NULL,
    status_changed_at TEXT NOT NULL,
    total_dependencies INTEGER NOT NULL DEFAULT 0,
    dependencies_resolved INTEGER NOT NULL DEFAULT 0,
    dependencies TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS capabilities (
    agent_id TEXT NOT NULL REFERENCES agents(agent_id) ON DELETE CASCADE,
    function_name TEXT NOT NULL,
    capability TEXT NOT NULL,
    version TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    tags TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (agent_id, function_name)
);

CREATE INDEX IF NOT EXISTS idx_capabilities_capability ON capabilities(capability);

CREATE TABLE IF NOT EXISTS topology_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    affected_capabilities TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_topology_events_timestamp ON topology_events(timestamp);
"#;

struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn upsert_agent_sql(&self) -> &'static str {
        "INSERT INTO agents (agent_id, name, version, namespace, endpoint, status, registered_at, last_heartbeat_at, status_changed_at, dependencies) \
         VALUES (?1, ?2, ?3, ?4, ?5, 'healthy', ?6, ?6, ?6, ?7) \
         ON CONFLICT(agent_id) DO UPDATE SET \
         name = excluded.name, version = excluded.version, namespace = excluded.namespace, \
         endpoint = excluded.endpoint, status = 'healthy', last_heartbeat_at = excluded.last_heartbeat_at, \
         status_changed_at = excluded.last_heartbeat_at, dependencies = excluded.dependencies"
    }

    fn prune_events_older_than_sql(&self) -> &'static str {
        "DELETE FROM topology_events WHERE timestamp < datetime('now', ?1 || ' seconds') \
         AND agent_id NOT IN (SELECT agent_id FROM agents)"
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await.map_err(StoreError::from)?;
        Ok(Self { pool })
    }

    pub async fn upsert_agent(&self, snapshot: &AgentSnapshot, now: DateTime<Utc>) -> Result<(), StoreError> {
        let dependencies_json = serde_json::to_string(
            &snapshot
                .capabilities
                .iter()
                .flat_map(|c| c.dependencies.clone())
                .collect::<Vec<DependencyDeclaration>>(),
        )
        .map_err(|e| StoreError::Integrity {
            key: "dependencies".into(),
            message: e.to_string(),
        })?;

        sqlx::query(SqliteDialect.upsert_agent_sql())
            .bind(&snapshot.agent_id)
            .bind(&snapshot.name)
            .bind(&snapshot.version)
            .bind(&snapshot.namespace)
            .bind(&snapshot.endpoint)
            .bind(now.to_rfc3339())
            .bind(dependencies_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn replace_capabilities(&self, agent_id: &str, capabilities: &[Capability]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM capabilities WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        for cap in capabilities {
            let tags_json = serde_json::to_string(&cap.tags).unwrap_or_else(|_| "[]".to_string());
            sqlx::query(
                "INSERT INTO capabilities (agent_id, function_name, capability, version, description, tags) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(&cap.agent_id)
            .bind(&cap.function_name)
            .bind(&cap.capability)
            .bind(&cap.version)
            .bind(&cap.description)
            .bind(tags_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE agent_id = ?1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_agent(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents ORDER BY agent_id").fetch_all(&self.pool).await?;
        let mut agents = Vec::with_capacity(rows.len());
        for row in &rows {
            agents.push(self.hydrate_agent(row).await?);
        }
        Ok(agents)
    }

    async fn hydrate_agent(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Agent, StoreError> {
        let agent_id: String = row.try_get("agent_id")?;
        let capabilities = sqlx::query_as::<_, Capability>("SELECT * FROM capabilities WHERE agent_id = ?1")
            .bind(&agent_id)
            .fetch_all(&self.pool)
            .await?;
        let dependencies_raw: String = row.try_get("dependencies")?;
        let dependencies: Vec<DependencyDeclaration> = serde_json::from_str(&dependencies_raw).unwrap_or_default();
        let registered_at: String = row.try_get("registered_at")?;
        let last_heartbeat_at: String = row.try_get("last_heartbeat_at")?;
        let status_changed_at: String = row.try_get("status_changed_at")?;
        let status: String = row.try_get("status")?;

        Ok(Agent {
            agent_id,
            name: row.try_get("name")?,
            version: row.try_get("version")?,
            namespace: row.try_get("namespace")?,
            endpoint: row.try_get("endpoint")?,
            status: AgentStatus::from_str(&status),
            registered_at: parse_rfc3339(&registered_at),
            last_heartbeat_at: parse_rfc3339(&last_heartbeat_at),
            status_changed_at: parse_rfc3339(&status_changed_at),
            total_dependencies: row.try_get("total_dependencies")?,
            dependencies_resolved: row.try_get("dependencies_resolved")?,
            capabilities,
            dependencies,
        })
    }

    pub async fn list_capabilities_by_name(&self, capability: &str, namespace: &str) -> Result<Vec<Capability>, StoreError> {
        let rows = sqlx::query_as::<_, Capability>(
            "SELECT c.* FROM capabilities c JOIN agents a ON a.agent_id = c.agent_id \
             WHERE c.capability = ?1 AND a.namespace = ?2 AND a.status = 'healthy'",
        )
        .bind(capability)
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn touch_heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET last_heartbeat_at = ?1, status = 'healthy' WHERE agent_id = ?2 AND status != 'evicted'",
        )
        .bind(now.to_rfc3339())
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_status(&self, agent_id: &str, status: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET status = ?1, status_changed_at = ?2 WHERE agent_id = ?3")
            .bind(status)
            .bind(now.to_rfc3339())
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Agents in `evicted` status whose transition into that status is
    /// older than `grace_period_seconds` — ripe for physical deletion.
    pub async fn evicted_before(&self, grace_period_seconds: i64) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM agents WHERE status = 'evicted' AND status_changed_at < datetime('now', ?1 || ' seconds')",
        )
        .bind(format!("-{grace_period_seconds}"))
        .fetch_all(&self.pool)
        .await?;
        let mut agents = Vec::with_capacity(rows.len());
        for row in &rows {
            agents.push(self.hydrate_agent(row).await?);
        }
        Ok(agents)
    }

    pub async fn delete_agent(&self, agent_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM capabilities WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM agents WHERE agent_id = ?1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_event(
        &self,
        event_type: &str,
        agent_id: &str,
        affected_capabilities: &[String],
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let caps_json = serde_json::to_string(affected_capabilities).unwrap_or_else(|_| "[]".to_string());
        let result = sqlx::query(
            "INSERT INTO topology_events (event_type, agent_id, timestamp, affected_capabilities) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_type)
        .bind(agent_id)
        .bind(now.to_rfc3339())
        .bind(caps_json)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn events_since(&self, event_id: i64) -> Result<Vec<TopologyEvent>, StoreError> {
        let rows = sqlx::query_as::<_, TopologyEvent>(
            "SELECT * FROM topology_events WHERE event_id > ?1 ORDER BY event_id",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn latest_event_id(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COALESCE(MAX(event_id), 0) AS max_id FROM topology_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_id")?)
    }

    pub async fn prune_events_older_than(&self, retention_seconds: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(SqliteDialect.prune_events_older_than_sql())
            .bind(format!("-{retention_seconds}"))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn stale_agents(&self, stale_after_seconds: i64, exclude_status: &str) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM agents WHERE status != ?1 AND last_heartbeat_at < datetime('now', ?2 || ' seconds')",
        )
        .bind(exclude_status)
        .bind(format!("-{stale_after_seconds}"))
        .fetch_all(&self.pool)
        .await?;
        let mut agents = Vec::with_capacity(rows.len());
        for row in &rows {
            agents.push(self.hydrate_agent(row).await?);
        }
        Ok(agents)
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
}
