//! Agent registry
//!
//! Owns agent identities and the single-use registration tokens that let a
//! new machine claim one. Every change to an agent record is published to the
//! status hub while the agent's lock is still held, so observers see changes
//! to one agent in the order they were written.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wirewarp_auth::{generate_registration_token, hash_token, token_hint, AgentCredentials};
use wirewarp_db::entities::{
    agent, agent_metric, port_forward, registration_token, tunnel_client, tunnel_server,
};
use wirewarp_proto::{
    Agent, AgentFacts, AgentStatus, AgentType, LiveMessage, RegistrationToken,
    RegistrationTokenSummary,
};

use crate::config::{chrono_duration, ControlConfig};
use crate::convert;
use crate::error::{ControlError, Result};
use crate::hub::StatusHub;
use crate::locks::LockTable;
use crate::sessions::AgentSessions;

/// Outcome of a successful token redemption
#[derive(Debug, Clone)]
pub struct Redemption {
    pub agent: Agent,
    /// Credential the agent uses on every later connection
    pub credential: String,
}

/// A token is redeemable until it is used or `now` passes `expires_at`.
/// Reuse is reported ahead of expiry.
fn check_redeemable(used: bool, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if used {
        return Err(ControlError::TokenAlreadyUsed);
    }
    if now > expires_at {
        return Err(ControlError::TokenExpired);
    }
    Ok(())
}

pub struct AgentRegistry {
    db: DatabaseConnection,
    locks: Arc<LockTable>,
    hub: Arc<StatusHub>,
    sessions: Arc<AgentSessions>,
    credentials: AgentCredentials,
    token_ttl: Duration,
    liveness_threshold: Duration,
}

impl AgentRegistry {
    pub fn new(
        db: DatabaseConnection,
        locks: Arc<LockTable>,
        hub: Arc<StatusHub>,
        sessions: Arc<AgentSessions>,
        credentials: AgentCredentials,
        config: &ControlConfig,
    ) -> Self {
        Self {
            db,
            locks,
            hub,
            sessions,
            credentials,
            token_ttl: config.token_ttl,
            liveness_threshold: config.liveness_threshold,
        }
    }

    /// Issue a registration token for a machine of the given type
    pub async fn issue_token(&self, agent_type: AgentType) -> Result<RegistrationToken> {
        let token = generate_registration_token();
        let now = Utc::now();
        let expires_at = now + chrono_duration(self.token_ttl);

        registration_token::ActiveModel {
            id: Set(Uuid::new_v4()),
            token_hash: Set(hash_token(&token)),
            token_hint: Set(token_hint(&token)),
            agent_type: Set(agent_type.as_str().to_string()),
            used: Set(false),
            expires_at: Set(expires_at),
            created_at: Set(now),
        }
        .insert(&self.db)
        .await?;

        info!(
            agent_type = %agent_type,
            hint = %token_hint(&token),
            expires_at = %expires_at,
            "Issued registration token"
        );

        Ok(RegistrationToken {
            token,
            agent_type,
            used: false,
            expires_at,
            created_at: now,
        })
    }

    /// Issued tokens, newest first, without their secrets
    pub async fn list_tokens(&self) -> Result<Vec<RegistrationTokenSummary>> {
        let rows = registration_token::Entity::find()
            .order_by_desc(registration_token::Column::CreatedAt)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| convert::token_summary(row).map_err(ControlError::from))
            .collect()
    }

    /// Redeem a registration token, creating a pending agent
    ///
    /// The used-flag flip is a conditional update inside the same transaction
    /// as the agent insert, so of any number of concurrent redemptions of one
    /// token exactly one succeeds.
    pub async fn redeem(
        &self,
        token: &str,
        facts: AgentFacts,
        name: Option<String>,
    ) -> Result<Redemption> {
        let token_hash = hash_token(token);
        let _guard = self.locks.tokens.lock(token_hash.clone()).await;
        let now = Utc::now();

        let txn = self.db.begin().await?;

        let row = registration_token::Entity::find()
            .filter(registration_token::Column::TokenHash.eq(token_hash.as_str()))
            .one(&txn)
            .await?
            .ok_or(ControlError::TokenInvalid)?;

        if let Err(e) = check_redeemable(row.used, row.expires_at, now) {
            warn!(hint = %row.token_hint, "Rejected registration token: {}", e);
            return Err(e);
        }

        let claimed = registration_token::Entity::update_many()
            .col_expr(registration_token::Column::Used, Expr::value(true))
            .filter(registration_token::Column::Id.eq(row.id))
            .filter(registration_token::Column::Used.eq(false))
            .filter(registration_token::Column::ExpiresAt.gte(now))
            .exec(&txn)
            .await?;
        if claimed.rows_affected != 1 {
            return Err(ControlError::TokenAlreadyUsed);
        }

        let agent_type = row
            .agent_type
            .parse::<AgentType>()
            .map_err(|e| ControlError::Database(sea_orm::DbErr::Custom(e)))?;
        let credential_id = Uuid::new_v4();
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or_else(|| facts.hostname.clone())
            .unwrap_or_default();

        let created = agent::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name),
            agent_type: Set(agent_type.as_str().to_string()),
            hostname: Set(facts.hostname),
            public_ip: Set(facts.public_ip),
            version: Set(facts.version),
            status: Set(AgentStatus::Pending.as_str().to_string()),
            last_seen: Set(None),
            credential_id: Set(credential_id),
            created_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        let agent = convert::agent(created)?;
        let credential = self.credentials.issue(agent.id, credential_id)?;

        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            hostname = ?agent.hostname,
            "Registered new agent"
        );
        self.hub.publish(LiveMessage::AgentStatus {
            agent: agent.clone(),
        });

        Ok(Redemption { agent, credential })
    }

    /// Resolve an agent credential to its agent
    pub async fn authenticate(&self, jwt: &str) -> Result<Agent> {
        let credential = self
            .credentials
            .verify(jwt)
            .map_err(|e| ControlError::Auth(e.to_string()))?;

        let row = agent::Entity::find_by_id(credential.agent_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::Auth("Unknown agent".to_string()))?;

        if row.credential_id != credential.credential_id {
            warn!(agent_id = %row.id, "Rejected revoked agent credential");
            return Err(ControlError::Auth("Credential has been revoked".to_string()));
        }

        Ok(convert::agent(row)?)
    }

    /// Record a heartbeat: refresh reported facts and mark the agent connected
    pub async fn heartbeat(&self, agent_id: Uuid, facts: &AgentFacts) -> Result<Agent> {
        let _guard = self.locks.agents.lock(agent_id).await;

        let row = agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;
        let was = row.status.clone();

        let mut active: agent::ActiveModel = row.into();
        if let Some(hostname) = &facts.hostname {
            active.hostname = Set(Some(hostname.clone()));
        }
        if let Some(public_ip) = &facts.public_ip {
            active.public_ip = Set(Some(public_ip.clone()));
        }
        if let Some(version) = &facts.version {
            active.version = Set(Some(version.clone()));
        }
        active.last_seen = Set(Some(Utc::now()));
        active.status = Set(AgentStatus::Connected.as_str().to_string());

        let agent = convert::agent(active.update(&self.db).await?)?;

        if was != AgentStatus::Connected.as_str() {
            info!(agent_id = %agent_id, from = %was, "Agent connected");
        } else {
            debug!(agent_id = %agent_id, "Heartbeat");
        }
        self.hub.publish(LiveMessage::AgentStatus {
            agent: agent.clone(),
        });

        Ok(agent)
    }

    /// Flip connected agents whose last heartbeat is older than the liveness
    /// threshold to disconnected. Returns the IDs that transitioned.
    pub async fn mark_stale(&self) -> Result<Vec<Uuid>> {
        let cutoff = Utc::now() - chrono_duration(self.liveness_threshold);

        let candidates = agent::Entity::find()
            .filter(agent::Column::Status.eq(AgentStatus::Connected.as_str()))
            .filter(agent::Column::LastSeen.lt(cutoff))
            .all(&self.db)
            .await?;

        let mut transitioned = Vec::new();
        for candidate in candidates {
            let _guard = self.locks.agents.lock(candidate.id).await;

            // A heartbeat may have landed since the snapshot read
            let changed = agent::Entity::update_many()
                .col_expr(
                    agent::Column::Status,
                    Expr::value(AgentStatus::Disconnected.as_str()),
                )
                .filter(agent::Column::Id.eq(candidate.id))
                .filter(agent::Column::Status.eq(AgentStatus::Connected.as_str()))
                .filter(agent::Column::LastSeen.lt(cutoff))
                .exec(&self.db)
                .await?;

            if changed.rows_affected == 1 {
                info!(agent_id = %candidate.id, "Agent heartbeat lapsed, marked disconnected");
                self.publish_current(candidate.id).await?;
                transitioned.push(candidate.id);
            }
        }

        Ok(transitioned)
    }

    /// Mark an agent disconnected after its channel closed
    pub async fn mark_disconnected(&self, agent_id: Uuid) -> Result<bool> {
        let _guard = self.locks.agents.lock(agent_id).await;

        let changed = agent::Entity::update_many()
            .col_expr(
                agent::Column::Status,
                Expr::value(AgentStatus::Disconnected.as_str()),
            )
            .filter(agent::Column::Id.eq(agent_id))
            .filter(agent::Column::Status.eq(AgentStatus::Connected.as_str()))
            .exec(&self.db)
            .await?;

        if changed.rows_affected == 1 {
            info!(agent_id = %agent_id, "Agent channel closed, marked disconnected");
            self.publish_current(agent_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Delete an agent
    ///
    /// Without `cascade`, a provisioned tunnel server or client blocks the
    /// delete. With it, the tunnel record, its port-forward rules and any
    /// client bindings to it are removed in the same transaction.
    pub async fn delete(&self, agent_id: Uuid, cascade: bool) -> Result<()> {
        let _guard = self.locks.agents.lock(agent_id).await;

        agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;

        let server = tunnel_server::Entity::find()
            .filter(tunnel_server::Column::AgentId.eq(agent_id))
            .one(&self.db)
            .await?;
        let client = tunnel_client::Entity::find()
            .filter(tunnel_client::Column::AgentId.eq(agent_id))
            .one(&self.db)
            .await?;

        if !cascade {
            if server.is_some() {
                return Err(ControlError::AgentHasDependents {
                    agent_id,
                    dependent: "tunnel server",
                });
            }
            if client.is_some() {
                return Err(ControlError::AgentHasDependents {
                    agent_id,
                    dependent: "tunnel client",
                });
            }
        }

        let mut server_ids: Vec<Uuid> = server.iter().map(|s| s.id).collect();
        server_ids.extend(client.as_ref().and_then(|c| c.tunnel_server_id));
        let _server_guards = self.locks.lock_servers(&server_ids).await;

        let txn = self.db.begin().await?;
        let mut removed_rules = 0;

        if let Some(server) = &server {
            removed_rules += port_forward::Entity::delete_many()
                .filter(port_forward::Column::TunnelServerId.eq(server.id))
                .exec(&txn)
                .await?
                .rows_affected;

            let unbound = tunnel_client::Entity::update_many()
                .col_expr(
                    tunnel_client::Column::TunnelServerId,
                    Expr::value(Option::<Uuid>::None),
                )
                .col_expr(
                    tunnel_client::Column::TunnelIp,
                    Expr::value(Option::<String>::None),
                )
                .filter(tunnel_client::Column::TunnelServerId.eq(server.id))
                .exec(&txn)
                .await?;

            tunnel_server::Entity::delete_by_id(server.id)
                .exec(&txn)
                .await?;

            info!(
                agent_id = %agent_id,
                tunnel_server_id = %server.id,
                unbound_clients = unbound.rows_affected,
                "Removed tunnel server"
            );
        }

        if let Some(client) = &client {
            removed_rules += port_forward::Entity::delete_many()
                .filter(port_forward::Column::TunnelClientId.eq(client.id))
                .exec(&txn)
                .await?
                .rows_affected;

            tunnel_client::Entity::delete_by_id(client.id)
                .exec(&txn)
                .await?;

            info!(agent_id = %agent_id, tunnel_client_id = %client.id, "Removed tunnel client");
        }

        agent_metric::Entity::delete_many()
            .filter(agent_metric::Column::AgentId.eq(agent_id))
            .exec(&txn)
            .await?;
        agent::Entity::delete_by_id(agent_id).exec(&txn).await?;
        txn.commit().await?;

        info!(
            agent_id = %agent_id,
            cascade,
            removed_rules,
            "Deleted agent"
        );
        self.hub.publish(LiveMessage::AgentRemoved { agent_id });
        self.sessions.cancel(agent_id);

        Ok(())
    }

    /// Rotate the agent's credential
    ///
    /// Earlier credentials stop validating and any live session is dropped.
    /// Identity, configuration and tunnel records are left as they are.
    pub async fn reissue_credential(&self, agent_id: Uuid) -> Result<String> {
        let _guard = self.locks.agents.lock(agent_id).await;

        let row = agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;

        let credential_id = Uuid::new_v4();
        let was_connected = row.status == AgentStatus::Connected.as_str();

        let mut active: agent::ActiveModel = row.into();
        active.credential_id = Set(credential_id);
        let updated = active.update(&self.db).await?;

        // Stored before cancelling: a channel that registers after this point
        // re-checks its credential against the new id and is refused
        let dropped = self.sessions.cancel(agent_id);

        let credential = self.credentials.issue(agent_id, credential_id)?;
        info!(agent_id = %agent_id, "Reissued agent credential");

        // the cancelled session no longer reports status for this agent
        if dropped && was_connected {
            let mut active: agent::ActiveModel = updated.into();
            active.status = Set(AgentStatus::Disconnected.as_str().to_string());
            let agent = convert::agent(active.update(&self.db).await?)?;
            self.hub.publish(LiveMessage::AgentStatus { agent });
        }
        Ok(credential)
    }

    /// Change the operator label
    pub async fn rename(&self, agent_id: Uuid, name: &str) -> Result<Agent> {
        let _guard = self.locks.agents.lock(agent_id).await;

        let row = agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;

        let mut active: agent::ActiveModel = row.into();
        active.name = Set(name.trim().to_string());
        let agent = convert::agent(active.update(&self.db).await?)?;

        self.hub.publish(LiveMessage::AgentStatus {
            agent: agent.clone(),
        });
        Ok(agent)
    }

    pub async fn get(&self, agent_id: Uuid) -> Result<Agent> {
        let row = agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;
        Ok(convert::agent(row)?)
    }

    pub async fn list(&self) -> Result<Vec<Agent>> {
        let rows = agent::Entity::find()
            .order_by_asc(agent::Column::CreatedAt)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|row| convert::agent(row).map_err(ControlError::from))
            .collect()
    }

    pub async fn count(&self) -> Result<u64> {
        Ok(agent::Entity::find().count(&self.db).await?)
    }

    /// Re-read an agent and push its full record. Caller holds the agent lock.
    async fn publish_current(&self, agent_id: Uuid) -> Result<()> {
        if let Some(row) = agent::Entity::find_by_id(agent_id).one(&self.db).await? {
            self.hub.publish(LiveMessage::AgentStatus {
                agent: convert::agent(row)?,
            });
        }
        Ok(())
    }
}
