//! The control plane: registry, topology, rules, templates and live status
//! wired together over one database.

use sea_orm::DatabaseConnection;
use std::sync::Arc;
use uuid::Uuid;
use wirewarp_auth::AgentCredentials;
use wirewarp_proto::{Agent, AgentFacts, AgentMetricSample, LiveMessage};

use crate::allocator::TunnelIpAllocator;
use crate::config::{chrono_duration, ControlConfig};
use crate::error::{ControlError, Result};
use crate::hub::{StatusHub, Subscription};
use crate::locks::LockTable;
use crate::port_forward::PortForwardEngine;
use crate::registry::AgentRegistry;
use crate::sessions::{AgentSession, AgentSessions};
use crate::sweeper::StaleSweeper;
use crate::telemetry::Telemetry;
use crate::templates::TemplateCatalog;
use crate::topology::TopologyStore;

#[derive(Clone)]
pub struct ControlPlane {
    db: DatabaseConnection,
    registry: Arc<AgentRegistry>,
    topology: Arc<TopologyStore>,
    forwards: Arc<PortForwardEngine>,
    templates: Arc<TemplateCatalog>,
    telemetry: Arc<Telemetry>,
    hub: Arc<StatusHub>,
    sessions: Arc<AgentSessions>,
    locks: Arc<LockTable>,
    config: ControlConfig,
}

impl ControlPlane {
    /// `jwt_secret` signs agent credentials
    pub fn new(db: DatabaseConnection, config: ControlConfig, jwt_secret: &[u8]) -> Self {
        let locks = Arc::new(LockTable::new());
        let hub = Arc::new(StatusHub::new(config.observer_queue_capacity));
        let sessions = Arc::new(AgentSessions::new());
        let credentials =
            AgentCredentials::new(jwt_secret, chrono_duration(config.credential_validity));

        let registry = Arc::new(AgentRegistry::new(
            db.clone(),
            locks.clone(),
            hub.clone(),
            sessions.clone(),
            credentials,
            &config,
        ));

        Self {
            registry,
            topology: Arc::new(TopologyStore::new(db.clone(), locks.clone())),
            forwards: Arc::new(PortForwardEngine::new(db.clone(), locks.clone())),
            templates: Arc::new(TemplateCatalog::new(db.clone())),
            telemetry: Arc::new(Telemetry::new(db.clone(), config.metrics_retention)),
            db,
            hub,
            sessions,
            locks,
            config,
        }
    }

    /// Replace the tunnel address policy
    pub fn with_ip_allocator(mut self, allocator: Arc<dyn TunnelIpAllocator>) -> Self {
        self.topology = Arc::new(
            TopologyStore::new(self.db.clone(), self.locks.clone()).with_allocator(allocator),
        );
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn forwards(&self) -> &PortForwardEngine {
        &self.forwards
    }

    pub fn templates(&self) -> &TemplateCatalog {
        &self.templates
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn hub(&self) -> &StatusHub {
        &self.hub
    }

    pub fn sessions(&self) -> &AgentSessions {
        &self.sessions
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Heartbeat plus copying reported facts into the topology
    pub async fn heartbeat(&self, agent_id: Uuid, facts: AgentFacts) -> Result<Agent> {
        let agent = self.registry.heartbeat(agent_id, &facts).await?;
        self.topology.record_agent_facts(agent_id, &facts).await?;
        Ok(agent)
    }

    /// Metrics frame: store the sample and count it as a sign of life
    pub async fn record_metrics(
        &self,
        agent_id: Uuid,
        timestamp: Option<&str>,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<AgentMetricSample> {
        self.registry
            .heartbeat(agent_id, &AgentFacts::default())
            .await?;
        self.telemetry.record_metrics(agent_id, timestamp, data).await
    }

    /// Command result frame: log the outcome and count it as a sign of life
    pub async fn record_command_result(
        &self,
        agent_id: Uuid,
        command_id: Option<&str>,
        success: bool,
        output: &str,
    ) -> Result<Agent> {
        let agent = self
            .registry
            .heartbeat(agent_id, &AgentFacts::default())
            .await?;
        self.telemetry
            .record_command_result(agent_id, command_id, success, output);
        Ok(agent)
    }

    /// Register the live agent channel for `agent_id`
    ///
    /// The credential is checked again once the session is in the table.
    /// Rotation and deletion update storage before cancelling sessions, so a
    /// channel that lost that race is refused here instead of staying open.
    pub async fn open_agent_session(
        &self,
        agent_id: Uuid,
        credential: &str,
    ) -> Result<AgentSession> {
        let session = self.sessions.register(agent_id);

        let checked = match self.registry.authenticate(credential).await {
            Ok(agent) if agent.id == agent_id => Ok(()),
            Ok(_) => Err(ControlError::Auth(
                "Credential belongs to another agent".to_string(),
            )),
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            self.sessions.unregister(&session);
            return Err(e);
        }
        Ok(session)
    }

    /// Join the live channel
    ///
    /// The subscription is registered before the snapshot is read, so every
    /// change after the snapshot is also queued behind it.
    pub async fn subscribe(&self) -> Result<(LiveMessage, Subscription)> {
        let subscription = self.hub.subscribe();
        let agents = self.registry.list().await?;
        Ok((LiveMessage::Snapshot { agents }, subscription))
    }

    pub fn sweeper(&self) -> StaleSweeper {
        StaleSweeper::new(
            self.registry.clone(),
            self.telemetry.clone(),
            self.locks.clone(),
            self.config.sweep_interval,
        )
    }
}
