//! Health monitor: a background task implementing the
//! `healthy -> unhealthy -> evicted` state machine and topology event
//! log pruning.

use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::events::EventType;
use crate::store::Store;

pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub unhealthy_after_secs: i64,
    pub eviction_after_secs: i64,
    pub event_retention_secs: i64,
}

/// Runs until `shutdown` is cancelled, sweeping the store on
/// `check_interval`. Each sweep is a single pass: mark stale healthy
/// agents unhealthy, evict stale unhealthy agents, then prune topology
/// events past the retention window.
pub async fn run(store: Store, config: HealthMonitorConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("health monitor shutting down");
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = sweep(&store, &config).await {
                    tracing::warn!(error = %err, "health monitor sweep failed");
                }
            }
        }
    }
}

async fn sweep(store: &Store, config: &HealthMonitorConfig) -> Result<(), crate::error::StoreError> {
    let now = Utc::now();

    let newly_unhealthy = store.stale_agents(config.unhealthy_after_secs, "unhealthy").await?;
    for agent in newly_unhealthy {
        if agent.status == crate::models::AgentStatus::Evicted {
            continue;
        }
        store.set_status(&agent.agent_id, "unhealthy", now).await?;
        let caps: Vec<String> = agent.capabilities.iter().map(|c| c.capability.clone()).collect();
        store.record_event(EventType::Unhealthy.as_str(), &agent.agent_id, &caps, now).await?;
        tracing::debug!(agent_id = %agent.agent_id, "agent marked unhealthy");
    }

    // Unhealthy -> evicted: the row is kept, just marked, so HEAD probes
    // can still answer 410 for it until the grace period below purges it.
    let to_evict = store.stale_agents(config.eviction_after_secs, "evicted").await?;
    for agent in to_evict {
        if agent.status != crate::models::AgentStatus::Unhealthy {
            continue;
        }
        store.set_status(&agent.agent_id, "evicted", now).await?;
        let caps: Vec<String> = agent.capabilities.iter().map(|c| c.capability.clone()).collect();
        store.record_event(EventType::Evicted.as_str(), &agent.agent_id, &caps, now).await?;
        tracing::info!(agent_id = %agent.agent_id, "agent marked evicted");
    }

    // Evicted rows past the grace period (the topology-event retention
    // window) are finally purged.
    let ripe_for_deletion = store.evicted_before(config.event_retention_secs).await?;
    for agent in ripe_for_deletion {
        store.delete_agent(&agent.agent_id).await?;
        tracing::info!(agent_id = %agent.agent_id, "evicted agent purged");
    }

    let pruned = store.prune_events_older_than(config.event_retention_secs).await?;
    if pruned > 0 {
        tracing::debug!(count = pruned, "pruned stale topology events");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentSnapshot, CapabilityDeclaration};

    fn snapshot(agent_id: &str) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: agent_id.to_string(),
            name: "agent".to_string(),
            version: "1.0.0".to_string(),
            namespace: "default".to_string(),
            endpoint: "http://localhost:9000".to_string(),
            status: None,
            capabilities: vec![CapabilityDeclaration {
                function_name: "f".to_string(),
                capability: "c".to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                tags: vec![],
                dependencies: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn sweep_marks_stale_healthy_agent_unhealthy() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(120);
        store.upsert_agent(&snapshot("a1"), past).await.unwrap();

        let config = HealthMonitorConfig {
            check_interval: Duration::from_secs(1),
            unhealthy_after_secs: 30,
            eviction_after_secs: 300,
            event_retention_secs: 3000,
        };
        sweep(&store, &config).await.unwrap();

        let agent = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, crate::models::AgentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn sweep_marks_long_unhealthy_agent_evicted_then_purges_after_grace_period() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let past = Utc::now() - chrono::Duration::seconds(120);
        store.upsert_agent(&snapshot("a1"), past).await.unwrap();
        store.set_status("a1", "unhealthy", past).await.unwrap();

        let config = HealthMonitorConfig {
            check_interval: Duration::from_secs(1),
            unhealthy_after_secs: 30,
            eviction_after_secs: 60,
            event_retention_secs: 3000,
        };
        sweep(&store, &config).await.unwrap();

        // First sweep: status flips to evicted, row and capabilities remain.
        let agent = store.get_agent("a1").await.unwrap().unwrap();
        assert_eq!(agent.status, crate::models::AgentStatus::Evicted);
        assert_eq!(store.list_capabilities_by_name("c", "default").await.unwrap().len(), 1);

        // Second sweep, past the retention-window grace period: purged.
        let short_grace_config = HealthMonitorConfig {
            event_retention_secs: 1,
            ..config
        };
        store.set_status("a1", "evicted", past).await.unwrap();
        sweep(&store, &short_grace_config).await.unwrap();

        assert!(store.get_agent("a1").await.unwrap().is_none());
        assert!(store.list_capabilities_by_name("c", "default").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_prunes_old_events() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let old = Utc::now() - chrono::Duration::seconds(10_000);
        store.record_event("register", "a1", &["c".into()], old).await.unwrap();

        let config = HealthMonitorConfig {
            check_interval: Duration::from_secs(1),
            unhealthy_after_secs: 30,
            eviction_after_secs: 300,
            event_retention_secs: 600,
        };
        sweep(&store, &config).await.unwrap();
        assert_eq!(store.latest_event_id().await.unwrap(), 0);
    }
}
