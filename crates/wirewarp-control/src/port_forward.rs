//! Port-forward rule engine
//!
//! Owns the invariant that at most one active rule claims a given
//! `(tunnel_server_id, protocol, public_port)`. Check-then-write runs under
//! the server's lock; a partial unique index backs it in storage.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use wirewarp_db::entities::port_forward;
use wirewarp_db::is_unique_violation;
use wirewarp_proto::{ForwardProtocol, PortForwardDraft, PortForwardRule, PortForwardUpdate};

use crate::convert;
use crate::error::{ControlError, Result};
use crate::locks::LockTable;
use crate::topology::{resolve_client, resolve_server, validate_port};

fn parse_protocol(value: &str) -> Result<ForwardProtocol> {
    value
        .trim()
        .parse::<ForwardProtocol>()
        .map_err(ControlError::Validation)
}

fn validate_destination_ip(value: &str) -> Result<String> {
    value
        .trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| {
            ControlError::validation(format!(
                "destination_ip '{}' is not a valid IP address",
                value
            ))
        })
}

fn normalize_description(value: Option<String>) -> Option<String> {
    value.map(|d| d.trim().to_string()).filter(|d| !d.is_empty())
}

pub struct PortForwardEngine {
    db: DatabaseConnection,
    locks: Arc<LockTable>,
}

impl PortForwardEngine {
    pub fn new(db: DatabaseConnection, locks: Arc<LockTable>) -> Self {
        Self { db, locks }
    }

    /// Create a rule from an unvalidated draft
    pub async fn create(&self, draft: PortForwardDraft) -> Result<PortForwardRule> {
        let protocol = parse_protocol(&draft.protocol)?;
        let public_port = validate_port("public_port", draft.public_port)?;
        let destination_port = validate_port("destination_port", draft.destination_port)?;
        let destination_ip = validate_destination_ip(&draft.destination_ip)?;
        let active = draft.active.unwrap_or(true);

        let server = resolve_server(&self.db, draft.tunnel_server_id).await?;
        let _guard = self.locks.servers.lock(server.id).await;

        let server = resolve_server(&self.db, server.id).await?;
        let client = resolve_client(&self.db, draft.tunnel_client_id).await?;
        if client.tunnel_server_id != Some(server.id) {
            return Err(ControlError::validation(format!(
                "Tunnel client {} is not bound to tunnel server {}",
                client.id, server.id
            )));
        }

        if active {
            self.ensure_port_free(server.id, protocol, public_port, None)
                .await?;
        }

        let row = port_forward::ActiveModel {
            id: Set(Uuid::new_v4()),
            tunnel_server_id: Set(server.id),
            tunnel_client_id: Set(client.id),
            protocol: Set(protocol.as_str().to_string()),
            public_port: Set(public_port as i32),
            destination_ip: Set(destination_ip),
            destination_port: Set(destination_port as i32),
            description: Set(normalize_description(draft.description)),
            active: Set(active),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await;
        let row = self
            .map_write_error(row, server.id, protocol, public_port)
            .await?;

        info!(
            rule_id = %row.id,
            tunnel_server_id = %row.tunnel_server_id,
            protocol = %protocol,
            public_port,
            active,
            "Created port-forward rule"
        );
        Ok(convert::port_forward(row)?)
    }

    /// Activate or deactivate a rule. Deactivating never conflicts.
    pub async fn toggle(&self, rule_id: Uuid, active: bool) -> Result<PortForwardRule> {
        let (_guard, row) = self.lock_rule(rule_id).await?;

        if row.active == active {
            return Ok(convert::port_forward(row)?);
        }

        let protocol = parse_protocol(&row.protocol)?;
        let public_port = validate_port("public_port", row.public_port as i64)?;
        let server_id = row.tunnel_server_id;
        if active {
            self.ensure_port_free(server_id, protocol, public_port, Some(rule_id))
                .await?;
        }

        let mut update: port_forward::ActiveModel = row.into();
        update.active = Set(active);
        let result = update.update(&self.db).await;
        let row = self
            .map_write_error(result, server_id, protocol, public_port)
            .await?;

        info!(rule_id = %rule_id, active, "Toggled port-forward rule");
        Ok(convert::port_forward(row)?)
    }

    /// Edit a rule; the result is validated like a new rule
    pub async fn update(
        &self,
        rule_id: Uuid,
        changes: PortForwardUpdate,
    ) -> Result<PortForwardRule> {
        let (_guard, row) = self.lock_rule(rule_id).await?;

        let protocol = match &changes.protocol {
            Some(p) => parse_protocol(p)?,
            None => parse_protocol(&row.protocol)?,
        };
        let public_port = validate_port(
            "public_port",
            changes.public_port.unwrap_or(row.public_port as i64),
        )?;
        let destination_port = validate_port(
            "destination_port",
            changes
                .destination_port
                .unwrap_or(row.destination_port as i64),
        )?;
        let destination_ip = match &changes.destination_ip {
            Some(ip) => validate_destination_ip(ip)?,
            None => row.destination_ip.clone(),
        };
        let active = changes.active.unwrap_or(row.active);
        let server_id = row.tunnel_server_id;

        if active {
            self.ensure_port_free(server_id, protocol, public_port, Some(rule_id))
                .await?;
        }

        let mut update: port_forward::ActiveModel = row.into();
        update.protocol = Set(protocol.as_str().to_string());
        update.public_port = Set(public_port as i32);
        update.destination_ip = Set(destination_ip);
        update.destination_port = Set(destination_port as i32);
        if changes.description.is_some() {
            update.description = Set(normalize_description(changes.description));
        }
        update.active = Set(active);

        let result = update.update(&self.db).await;
        let row = self
            .map_write_error(result, server_id, protocol, public_port)
            .await?;

        info!(rule_id = %rule_id, "Updated port-forward rule");
        Ok(convert::port_forward(row)?)
    }

    pub async fn delete(&self, rule_id: Uuid) -> Result<()> {
        let result = port_forward::Entity::delete_by_id(rule_id)
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ControlError::not_found("port-forward rule", rule_id));
        }

        info!(rule_id = %rule_id, "Deleted port-forward rule");
        Ok(())
    }

    pub async fn get(&self, rule_id: Uuid) -> Result<PortForwardRule> {
        let row = port_forward::Entity::find_by_id(rule_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found("port-forward rule", rule_id))?;
        Ok(convert::port_forward(row)?)
    }

    /// All rules, optionally only those of one server
    pub async fn list(&self, tunnel_server_id: Option<Uuid>) -> Result<Vec<PortForwardRule>> {
        let mut query = port_forward::Entity::find();
        if let Some(server_id) = tunnel_server_id {
            query = query.filter(port_forward::Column::TunnelServerId.eq(server_id));
        }
        let rows = query
            .order_by_asc(port_forward::Column::CreatedAt)
            .all(&self.db)
            .await?;

        debug!(count = rows.len(), "Listed port-forward rules");
        rows.into_iter()
            .map(|row| convert::port_forward(row).map_err(ControlError::from))
            .collect()
    }

    /// Fetch a rule and hold its server's lock
    async fn lock_rule(
        &self,
        rule_id: Uuid,
    ) -> Result<(tokio::sync::OwnedMutexGuard<()>, port_forward::Model)> {
        let row = port_forward::Entity::find_by_id(rule_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found("port-forward rule", rule_id))?;

        // a rule never changes server, so the lock key is stable
        let guard = self.locks.servers.lock(row.tunnel_server_id).await;
        let row = port_forward::Entity::find_by_id(rule_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| ControlError::not_found("port-forward rule", rule_id))?;

        Ok((guard, row))
    }

    async fn find_active_claim(
        &self,
        server_id: Uuid,
        protocol: ForwardProtocol,
        public_port: u16,
        except: Option<Uuid>,
    ) -> Result<Option<port_forward::Model>> {
        let mut query = port_forward::Entity::find()
            .filter(port_forward::Column::TunnelServerId.eq(server_id))
            .filter(port_forward::Column::Protocol.eq(protocol.as_str()))
            .filter(port_forward::Column::PublicPort.eq(public_port as i32))
            .filter(port_forward::Column::Active.eq(true));
        if let Some(id) = except {
            query = query.filter(port_forward::Column::Id.ne(id));
        }
        Ok(query.one(&self.db).await?)
    }

    async fn ensure_port_free(
        &self,
        server_id: Uuid,
        protocol: ForwardProtocol,
        public_port: u16,
        except: Option<Uuid>,
    ) -> Result<()> {
        match self
            .find_active_claim(server_id, protocol, public_port, except)
            .await?
        {
            Some(existing) => Err(ControlError::PortConflict {
                rule_id: existing.id,
                tunnel_server_id: server_id,
                protocol,
                public_port,
            }),
            None => Ok(()),
        }
    }

    /// Turn a storage-level unique violation into a `PortConflict`
    async fn map_write_error(
        &self,
        result: std::result::Result<port_forward::Model, DbErr>,
        server_id: Uuid,
        protocol: ForwardProtocol,
        public_port: u16,
    ) -> Result<port_forward::Model> {
        match result {
            Ok(row) => Ok(row),
            Err(e) if is_unique_violation(&e) => {
                let existing = self
                    .find_active_claim(server_id, protocol, public_port, None)
                    .await?;
                Err(ControlError::PortConflict {
                    rule_id: existing.map(|r| r.id).unwrap_or_default(),
                    tunnel_server_id: server_id,
                    protocol,
                    public_port,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
