//! Observer-side agent cache

use std::collections::HashMap;
use uuid::Uuid;
use wirewarp_proto::{Agent, LiveMessage};

/// Agents keyed by id
///
/// Every update is a full-record upsert, so applying a message twice or out
/// of a duplicate burst leaves the same state. A snapshot replaces
/// everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentCache {
    agents: HashMap<Uuid, Agent>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one live message into the cache. Returns false for message
    /// kinds the cache does not understand.
    pub fn apply(&mut self, message: LiveMessage) -> bool {
        match message {
            LiveMessage::Snapshot { agents } => self.replace_all(agents),
            LiveMessage::AgentStatus { agent } => self.upsert(agent),
            LiveMessage::AgentRemoved { agent_id } => {
                self.remove(agent_id);
            }
            LiveMessage::Unknown => return false,
        }
        true
    }

    pub fn upsert(&mut self, agent: Agent) {
        self.agents.insert(agent.id, agent);
    }

    pub fn replace_all(&mut self, agents: Vec<Agent>) {
        self.agents = agents.into_iter().map(|a| (a.id, a)).collect();
    }

    pub fn remove(&mut self, agent_id: Uuid) -> Option<Agent> {
        self.agents.remove(&agent_id)
    }

    pub fn get(&self, agent_id: Uuid) -> Option<&Agent> {
        self.agents.get(&agent_id)
    }

    /// All agents, oldest first
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wirewarp_proto::{AgentStatus, AgentType};

    fn agent(name: &str, status: AgentStatus) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            name: name.to_string(),
            agent_type: AgentType::Client,
            hostname: None,
            public_ip: None,
            version: None,
            status,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_snapshot_replaces_everything() {
        let mut cache = AgentCache::new();
        cache.upsert(agent("stale", AgentStatus::Connected));

        let fresh = agent("fresh", AgentStatus::Pending);
        cache.apply(LiveMessage::Snapshot {
            agents: vec![fresh.clone()],
        });

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(fresh.id), Some(&fresh));
    }

    #[test]
    fn test_duplicate_deltas_converge() {
        let a = agent("a", AgentStatus::Pending);
        let mut connected = a.clone();
        connected.status = AgentStatus::Connected;
        let b = agent("b", AgentStatus::Pending);

        let deltas = vec![
            LiveMessage::AgentStatus { agent: a.clone() },
            LiveMessage::AgentStatus { agent: b.clone() },
            LiveMessage::AgentStatus {
                agent: connected.clone(),
            },
            LiveMessage::AgentRemoved { agent_id: b.id },
        ];

        let mut once = AgentCache::new();
        for d in deltas.clone() {
            once.apply(d);
        }

        let mut twice = AgentCache::new();
        for d in deltas {
            twice.apply(d.clone());
            twice.apply(d);
        }

        assert_eq!(once, twice);
        assert_eq!(once.agents(), vec![connected]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut cache = AgentCache::new();
        let a = agent("a", AgentStatus::Connected);
        cache.upsert(a.clone());

        assert!(cache.apply(LiveMessage::AgentRemoved { agent_id: a.id }));
        assert!(cache.apply(LiveMessage::AgentRemoved { agent_id: a.id }));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_kind_leaves_cache_alone() {
        let mut cache = AgentCache::new();
        cache.upsert(agent("a", AgentStatus::Connected));

        assert!(!cache.apply(LiveMessage::Unknown));
        assert_eq!(cache.len(), 1);
    }
}
