//! Registration service: validates an inbound snapshot, diffs capability
//! sets, persists the agent atomically, emits topology events, and runs
//! dependency resolution for the response.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{RegistryError, ValidationError};
use crate::events::EventType;
use crate::models::{
    Agent, AgentSnapshot, Capability, CapabilityDeclaration, DependencyDeclaration, ProviderCandidate,
    RegistrationResponse,
};
use crate::resolver::resolve_dependency;
use crate::store::Store;

/// Serializes registration/heartbeat writes per agent so two concurrent
/// requests for the same `agent_id` can't interleave a capability diff
/// with a partial write from the other.
pub struct RegistrationService {
    store: Store,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RegistrationService {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(agent_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn validate(snapshot: &AgentSnapshot) -> Result<(), ValidationError> {
        if snapshot.agent_id.trim().is_empty() {
            return Err(ValidationError::MissingField("agent_id"));
        }
        if snapshot.endpoint.trim().is_empty() {
            return Err(ValidationError::MissingField("endpoint"));
        }
        let mut seen = HashSet::new();
        for cap in &snapshot.capabilities {
            if !seen.insert(cap.function_name.clone()) {
                return Err(ValidationError::DuplicateFunctionName(cap.function_name.clone()));
            }
        }
        Ok(())
    }

    /// Register (or re-register) an agent and resolve its declared
    /// dependencies against the current live topology.
    pub async fn register(&self, snapshot: AgentSnapshot, now: DateTime<Utc>) -> Result<RegistrationResponse, RegistryError> {
        Self::validate(&snapshot)?;
        let lock = self.lock_for(&snapshot.agent_id).await;
        let _guard = lock.lock().await;

        let previous = self.store.get_agent(&snapshot.agent_id).await?;

        self.store.upsert_agent(&snapshot, now).await?;

        let new_capabilities: Vec<Capability> = snapshot
            .capabilities
            .iter()
            .map(|c| capability_row(&snapshot.agent_id, c))
            .collect();

        let changed_capabilities = diff_capability_names(previous.as_ref(), &snapshot.capabilities);
        self.store.replace_capabilities(&snapshot.agent_id, &new_capabilities).await?;

        let event_type = if previous.is_none() { EventType::Register } else { EventType::Update };
        if !changed_capabilities.is_empty() || previous.is_none() {
            self.store
                .record_event(event_type.as_str(), &snapshot.agent_id, &changed_capabilities, now)
                .await?;
        }

        let all_dependencies: Vec<DependencyDeclaration> = snapshot
            .capabilities
            .iter()
            .flat_map(|c| c.dependencies.clone())
            .collect();

        let mut resolved_dependencies = HashMap::new();
        for dep in &all_dependencies {
            if let Some(resolution) = self.resolve_one(&snapshot.agent_id, dep, now).await? {
                resolved_dependencies.insert(dep.capability.clone(), resolution);
            }
        }

        let total_dependencies = all_dependencies.len() as i64;
        let dependencies_resolved = resolved_dependencies.len() as i64;

        Ok(RegistrationResponse {
            agent_id: snapshot.agent_id,
            registered_at: now,
            resolved_dependencies,
            dependencies_resolved,
            total_dependencies,
        })
    }

    async fn resolve_one(
        &self,
        requester_agent_id: &str,
        dep: &DependencyDeclaration,
        now: DateTime<Utc>,
    ) -> Result<Option<crate::models::ResolvedDependency>, RegistryError> {
        let requester_namespace = self
            .store
            .get_agent(requester_agent_id)
            .await?
            .map(|a| a.namespace)
            .unwrap_or_else(|| "default".to_string());

        // An unset declaration namespace defaults to the requester's own;
        // self-resolution is only allowed when the namespace was set
        // explicitly and it matches, not merely after this default applies.
        let self_match_allowed = dep.namespace.as_deref() == Some(requester_namespace.as_str());
        let namespace = dep.namespace.clone().unwrap_or(requester_namespace);

        let candidates = self.store.list_capabilities_by_name(&dep.capability, &namespace).await?;
        let agents: HashMap<String, Agent> = {
            let mut map = HashMap::new();
            for cap in &candidates {
                if !map.contains_key(&cap.agent_id) {
                    if let Some(agent) = self.store.get_agent(&cap.agent_id).await? {
                        map.insert(cap.agent_id.clone(), agent);
                    }
                }
            }
            map
        };

        let provider_candidates: Vec<ProviderCandidate> = candidates
            .iter()
            .filter(|cap| self_match_allowed || cap.agent_id != requester_agent_id)
            .filter_map(|cap| {
                let agent = agents.get(&cap.agent_id)?;
                Some(ProviderCandidate {
                    agent_id: cap.agent_id.clone(),
                    function_name: cap.function_name.clone(),
                    endpoint: agent.endpoint.clone(),
                    capability: cap.capability.clone(),
                    version: cap.version.clone(),
                    tags: cap.tags.clone(),
                    last_heartbeat_at: agent.last_heartbeat_at,
                })
            })
            .collect();

        Ok(resolve_dependency(dep, &provider_candidates, now))
    }

    pub async fn heartbeat(&self, agent_id: &str, now: DateTime<Utc>) -> Result<bool, RegistryError> {
        let agent = self.store.get_agent(agent_id).await?;
        match agent {
            None => Err(RegistryError::AgentNotFound(agent_id.to_string())),
            Some(agent) if agent.status == crate::models::AgentStatus::Evicted => {
                Err(RegistryError::AgentEvicted(agent_id.to_string()))
            }
            Some(_) => Ok(self.store.touch_heartbeat(agent_id, now).await?),
        }
    }

    pub async fn unregister(&self, agent_id: &str, now: DateTime<Utc>) -> Result<(), RegistryError> {
        let agent = self.store.get_agent(agent_id).await?.ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
        let capability_names: Vec<String> = agent.capabilities.iter().map(|c| c.capability.clone()).collect();
        self.store.delete_agent(agent_id).await?;
        self.store
            .record_event(EventType::Unregister.as_str(), agent_id, &capability_names, now)
            .await?;
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn capability_row(agent_id: &str, decl: &CapabilityDeclaration) -> Capability {
    Capability {
        agent_id: agent_id.to_string(),
        function_name: decl.function_name.clone(),
        capability: decl.capability.clone(),
        version: decl.version.clone(),
        description: decl.description.clone(),
        tags: decl.tags.clone(),
    }
}

/// Capability labels whose provider set changed between `previous` and
/// `next`, by identity key (SPEC_FULL §4.2). Determines which capability
/// labels a topology event should list as affected.
fn diff_capability_names(previous: Option<&Agent>, next: &[CapabilityDeclaration]) -> Vec<String> {
    let previous_keys: HashSet<_> = previous
        .map(|a| {
            a.capabilities
                .iter()
                .map(|c| {
                    let mut tags = c.tags.clone();
                    tags.sort();
                    (c.function_name.clone(), c.capability.clone(), c.version.clone(), tags)
                })
                .collect::<HashSet<_>>()
        })
        .unwrap_or_default();

    let mut changed = HashSet::new();
    for decl in next {
        if !previous_keys.contains(&decl.identity_key()) {
            changed.insert(decl.capability.clone());
        }
    }
    if let Some(previous) = previous {
        let next_keys: HashSet<_> = next.iter().map(|d| d.identity_key()).collect();
        for cap in &previous.capabilities {
            let key = {
                let mut tags = cap.tags.clone();
                tags.sort();
                (cap.function_name.clone(), cap.capability.clone(), cap.version.clone(), tags)
            };
            if !next_keys.contains(&key) {
                changed.insert(cap.capability.clone());
            }
        }
    }
    changed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(agent_id: &str, function_name: &str) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: agent_id.to_string(),
            name: "agent".to_string(),
            version: "1.0.0".to_string(),
            namespace: "default".to_string(),
            endpoint: format!("http://{agent_id}:9000"),
            status: None,
            capabilities: vec![CapabilityDeclaration {
                function_name: function_name.to_string(),
                capability: "greeting".to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                tags: vec![],
                dependencies: vec![],
            }],
        }
    }

    #[test]
    fn validate_rejects_duplicate_function_names() {
        let mut snap = snapshot("a1", "greet");
        snap.capabilities.push(snap.capabilities[0].clone());
        let err = RegistrationService::validate(&snap).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateFunctionName(_)));
    }

    #[test]
    fn validate_rejects_missing_agent_id() {
        let mut snap = snapshot("a1", "greet");
        snap.agent_id = String::new();
        let err = RegistrationService::validate(&snap).unwrap_err();
        assert!(matches!(err, ValidationError::MissingField("agent_id")));
    }

    #[tokio::test]
    async fn dependency_resolves_once_a_provider_in_the_same_namespace_registers() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let service = RegistrationService::new(store);
        let now = Utc::now();

        let mut dependent = snapshot("consumer", "call");
        dependent.capabilities[0].capability = "caller".to_string();
        dependent.capabilities[0].dependencies = vec![DependencyDeclaration {
            capability: "greeting".to_string(),
            tags: vec![],
            version: None,
            namespace: None,
        }];

        // No providers yet: dependency is unresolved.
        let response = service.register(dependent.clone(), now).await.unwrap();
        assert_eq!(response.dependencies_resolved, 0);
        assert_eq!(response.total_dependencies, 1);

        // Provider registers; re-register consumer and it should now resolve.
        service.register(snapshot("provider", "greet"), now).await.unwrap();
        let response = service.register(dependent, now).await.unwrap();
        assert_eq!(response.dependencies_resolved, 1);
        assert_eq!(response.resolved_dependencies["greeting"].agent_id, "provider");
    }

    #[tokio::test]
    async fn self_dependency_is_excluded_unless_namespace_explicitly_matches() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let service = RegistrationService::new(store);
        let now = Utc::now();

        let mut solo = snapshot("solo", "greet");
        solo.capabilities[0].capability = "greeting".to_string();
        solo.capabilities[0].dependencies = vec![DependencyDeclaration {
            capability: "greeting".to_string(),
            tags: vec![],
            version: None,
            namespace: None,
        }];
        let response = service.register(solo.clone(), now).await.unwrap();
        assert_eq!(response.dependencies_resolved, 0, "no namespace match declared, must not self-resolve");

        let mut solo_explicit = solo;
        solo_explicit.capabilities[0].dependencies[0].namespace = Some("default".to_string());
        let response = service.register(solo_explicit, now).await.unwrap();
        assert_eq!(response.dependencies_resolved, 1, "explicit namespace match permits self-resolution");
        assert_eq!(response.resolved_dependencies["greeting"].agent_id, "solo");
    }

    #[tokio::test]
    async fn heartbeat_on_evicted_agent_is_rejected() {
        let store = Store::connect("sqlite::memory:").await.unwrap();
        let service = RegistrationService::new(store);
        let now = Utc::now();
        service.register(snapshot("a1", "greet"), now).await.unwrap();
        service.store().set_status("a1", "evicted", now).await.unwrap();
        let err = service.heartbeat("a1", now).await.unwrap_err();
        assert!(matches!(err, RegistryError::AgentEvicted(_)));
    }
}
