//! Tunnel topology store
//!
//! Owns TunnelServer and TunnelClient records, the client -> server binding
//! and gateway attributes. It is the only writer of the agent-reported
//! `public_ip` / `wg_public_key` columns.

use chrono::Utc;
use ipnet::IpNet;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wirewarp_db::entities::{agent, port_forward, tunnel_client, tunnel_server};
use wirewarp_db::is_unique_violation;
use wirewarp_proto::{AgentFacts, AgentType, TunnelClient, TunnelServer, TunnelServerView};

use crate::allocator::{NextFreeAddress, TunnelIpAllocator};
use crate::convert;
use crate::error::{ControlError, Result};
use crate::locks::LockTable;

pub const DEFAULT_WG_PORT: u16 = 51820;
pub const DEFAULT_WG_INTERFACE: &str = "wg0";
pub const DEFAULT_PUBLIC_IFACE: &str = "eth0";
pub const DEFAULT_TUNNEL_NETWORK: &str = "10.0.0.0/24";

/// Settings for a new tunnel server; unset fields take the defaults
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    pub wg_port: Option<i64>,
    pub wg_interface: Option<String>,
    pub public_iface: Option<String>,
    pub tunnel_network: Option<String>,
}

/// Operator-editable server fields; unset fields are left alone
#[derive(Debug, Clone, Default)]
pub struct ServerConfigUpdate {
    pub wg_port: Option<i64>,
    pub public_iface: Option<String>,
    pub tunnel_network: Option<String>,
}

/// Gateway mode for a client. Enabling needs both `vm_network` and `lan_ip`.
#[derive(Debug, Clone, Default)]
pub struct GatewayUpdate {
    pub is_gateway: bool,
    pub vm_network: Option<String>,
    pub lan_ip: Option<String>,
}

/// Client changes applied together; unset parts are left alone
#[derive(Debug, Clone, Default)]
pub struct ClientUpdate {
    /// `Some(Some(id))` binds to that server, `Some(None)` unbinds
    pub tunnel_server_id: Option<Option<Uuid>>,
    pub gateway: Option<GatewayUpdate>,
}

pub(crate) fn validate_port(field: &str, value: i64) -> Result<u16> {
    if (1..=65535).contains(&value) {
        Ok(value as u16)
    } else {
        Err(ControlError::validation(format!(
            "{} must be between 1 and 65535, got {}",
            field, value
        )))
    }
}

fn validate_iface(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() || value.len() > 15 || value.contains(char::is_whitespace) {
        return Err(ControlError::validation(format!(
            "{} must be a non-empty interface name of at most 15 characters",
            field
        )));
    }
    Ok(value.to_string())
}

/// Normalized `(vm_network, lan_ip)`; both cleared when gateway mode is off
fn validate_gateway(gateway: &GatewayUpdate) -> Result<(Option<String>, Option<String>)> {
    if !gateway.is_gateway {
        return Ok((None, None));
    }

    let vm_network = gateway.vm_network.as_deref().map(str::trim).unwrap_or_default();
    let lan_ip = gateway.lan_ip.as_deref().map(str::trim).unwrap_or_default();
    if vm_network.is_empty() || lan_ip.is_empty() {
        return Err(ControlError::validation(
            "Gateway mode requires both vm_network and lan_ip",
        ));
    }
    let net = vm_network.parse::<IpNet>().map_err(|_| {
        ControlError::validation(format!("vm_network '{}' is not a valid CIDR", vm_network))
    })?;
    let ip = lan_ip.parse::<IpAddr>().map_err(|_| {
        ControlError::validation(format!("lan_ip '{}' is not a valid IP address", lan_ip))
    })?;
    Ok((Some(net.to_string()), Some(ip.to_string())))
}

/// Parse a tunnel network, normalized to its network address
fn parse_tunnel_network(value: &str) -> Result<IpNet> {
    let net = value
        .trim()
        .parse::<IpNet>()
        .map_err(|_| {
            ControlError::validation(format!("tunnel_network '{}' is not a valid CIDR", value))
        })?
        .trunc();

    // room for the server plus at least one client
    if net.hosts().take(2).count() < 2 {
        return Err(ControlError::validation(format!(
            "tunnel_network {} is too small",
            net
        )));
    }
    Ok(net)
}

pub(crate) async fn resolve_server<C: ConnectionTrait>(
    db: &C,
    id: Uuid,
) -> Result<tunnel_server::Model> {
    if let Some(server) = tunnel_server::Entity::find_by_id(id).one(db).await? {
        return Ok(server);
    }
    if tunnel_client::Entity::find_by_id(id).one(db).await?.is_some() {
        return Err(ControlError::TypeMismatch {
            id,
            expected: AgentType::Server,
            actual: AgentType::Client,
        });
    }
    if let Some(agent) = agent::Entity::find_by_id(id).one(db).await? {
        if agent.agent_type == AgentType::Client.as_str() {
            return Err(ControlError::TypeMismatch {
                id,
                expected: AgentType::Server,
                actual: AgentType::Client,
            });
        }
    }
    Err(ControlError::not_found("tunnel server", id))
}

pub(crate) async fn resolve_client<C: ConnectionTrait>(
    db: &C,
    id: Uuid,
) -> Result<tunnel_client::Model> {
    if let Some(client) = tunnel_client::Entity::find_by_id(id).one(db).await? {
        return Ok(client);
    }
    if tunnel_server::Entity::find_by_id(id).one(db).await?.is_some() {
        return Err(ControlError::TypeMismatch {
            id,
            expected: AgentType::Client,
            actual: AgentType::Server,
        });
    }
    if let Some(agent) = agent::Entity::find_by_id(id).one(db).await? {
        if agent.agent_type == AgentType::Server.as_str() {
            return Err(ControlError::TypeMismatch {
                id,
                expected: AgentType::Client,
                actual: AgentType::Server,
            });
        }
    }
    Err(ControlError::not_found("tunnel client", id))
}

pub struct TopologyStore {
    db: DatabaseConnection,
    locks: Arc<LockTable>,
    allocator: Arc<dyn TunnelIpAllocator>,
}

impl TopologyStore {
    pub fn new(db: DatabaseConnection, locks: Arc<LockTable>) -> Self {
        Self {
            db,
            locks,
            allocator: Arc::new(NextFreeAddress),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn TunnelIpAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Fetch an agent and check it has the expected type
    async fn typed_agent(&self, agent_id: Uuid, expected: AgentType) -> Result<agent::Model> {
        let agent = agent::Entity::find_by_id(agent_id)
            .one(&self.db)
            .await?
            .ok_or(ControlError::AgentNotFound(agent_id))?;

        if agent.agent_type != expected.as_str() {
            let actual = match expected {
                AgentType::Server => AgentType::Client,
                AgentType::Client => AgentType::Server,
            };
            return Err(ControlError::TypeMismatch {
                id: agent_id,
                expected,
                actual,
            });
        }
        Ok(agent)
    }

    /// Provision the tunnel server record of a server agent
    pub async fn create_server(
        &self,
        agent_id: Uuid,
        settings: ServerSettings,
    ) -> Result<TunnelServer> {
        let agent = self.typed_agent(agent_id, AgentType::Server).await?;

        let wg_port = validate_port("wg_port", settings.wg_port.unwrap_or(DEFAULT_WG_PORT as i64))?;
        let wg_interface = validate_iface(
            "wg_interface",
            settings.wg_interface.as_deref().unwrap_or(DEFAULT_WG_INTERFACE),
        )?;
        let public_iface = validate_iface(
            "public_iface",
            settings.public_iface.as_deref().unwrap_or(DEFAULT_PUBLIC_IFACE),
        )?;
        let network = parse_tunnel_network(
            settings
                .tunnel_network
                .as_deref()
                .unwrap_or(DEFAULT_TUNNEL_NETWORK),
        )?;

        let inserted = tunnel_server::ActiveModel {
            id: Set(Uuid::new_v4()),
            agent_id: Set(agent_id),
            wg_port: Set(wg_port as i32),
            wg_interface: Set(wg_interface),
            public_ip: Set(agent.public_ip),
            public_iface: Set(public_iface),
            wg_public_key: Set(None),
            tunnel_network: Set(network.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::AlreadyProvisioned {
                    agent_id,
                    kind: AgentType::Server,
                }
            } else {
                e.into()
            }
        })?;

        info!(
            agent_id = %agent_id,
            tunnel_server_id = %inserted.id,
            tunnel_network = %inserted.tunnel_network,
            "Provisioned tunnel server"
        );
        Ok(convert::tunnel_server(inserted)?)
    }

    /// Provision the (unbound) tunnel client record of a client agent
    pub async fn create_client(&self, agent_id: Uuid) -> Result<TunnelClient> {
        let agent = self.typed_agent(agent_id, AgentType::Client).await?;

        let inserted = tunnel_client::ActiveModel {
            id: Set(Uuid::new_v4()),
            agent_id: Set(agent_id),
            tunnel_server_id: Set(None),
            tunnel_ip: Set(None),
            is_gateway: Set(false),
            vm_network: Set(None),
            lan_ip: Set(None),
            wg_public_key: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ControlError::AlreadyProvisioned {
                    agent_id,
                    kind: AgentType::Client,
                }
            } else {
                e.into()
            }
        })?;

        info!(agent_id = %agent_id, tunnel_client_id = %inserted.id, "Provisioned tunnel client");
        Ok(convert::tunnel_client(inserted, Some(&agent))?)
    }

    /// Bind a client to a server and assign it a tunnel address
    ///
    /// Rebinding to the current server keeps the existing address. Moving a
    /// client that still has port-forward rules fails.
    pub async fn bind(&self, client_id: Uuid, server_id: Uuid) -> Result<TunnelClient> {
        self.update_client(
            client_id,
            ClientUpdate {
                tunnel_server_id: Some(Some(server_id)),
                gateway: None,
            },
        )
        .await
    }

    /// Detach a client from its server, releasing its address
    pub async fn unbind(&self, client_id: Uuid) -> Result<TunnelClient> {
        self.update_client(
            client_id,
            ClientUpdate {
                tunnel_server_id: Some(None),
                gateway: None,
            },
        )
        .await
    }

    /// Enable or disable gateway mode. Disabling clears the gateway fields.
    pub async fn set_gateway(
        &self,
        client_id: Uuid,
        is_gateway: bool,
        vm_network: Option<&str>,
        lan_ip: Option<&str>,
    ) -> Result<TunnelClient> {
        self.update_client(
            client_id,
            ClientUpdate {
                tunnel_server_id: None,
                gateway: Some(GatewayUpdate {
                    is_gateway,
                    vm_network: vm_network.map(str::to_string),
                    lan_ip: lan_ip.map(str::to_string),
                }),
            },
        )
        .await
    }

    /// Apply a binding change and gateway settings as one write
    ///
    /// Everything is validated before the row is touched, so a rejected
    /// update leaves the client exactly as it was.
    pub async fn update_client(
        &self,
        client_id: Uuid,
        update: ClientUpdate,
    ) -> Result<TunnelClient> {
        let gateway = match &update.gateway {
            Some(g) => {
                let (vm_network, lan_ip) = validate_gateway(g)?;
                Some((g.is_gateway, vm_network, lan_ip))
            }
            None => None,
        };

        let target = match update.tunnel_server_id {
            Some(Some(server_id)) => Some(Some(resolve_server(&self.db, server_id).await?.id)),
            other => other,
        };
        let (_guards, client) = self.lock_client(client_id, target.flatten()).await?;

        let mut active: tunnel_client::ActiveModel = client.clone().into();
        match target {
            Some(Some(server_id)) => {
                // may have been removed while we waited
                let server = resolve_server(&self.db, server_id).await?;
                if client.tunnel_server_id == Some(server.id) && client.tunnel_ip.is_some() {
                    debug!(tunnel_client_id = %client_id, "Client already bound to this server");
                } else {
                    if client.tunnel_server_id.is_some() {
                        self.ensure_no_forwards(client.id).await?;
                    }
                    let tunnel_ip = self.allocate_address(&server, client.id).await?;
                    active.tunnel_server_id = Set(Some(server.id));
                    active.tunnel_ip = Set(Some(tunnel_ip.to_string()));
                }
            }
            Some(None) if client.tunnel_server_id.is_some() => {
                self.ensure_no_forwards(client.id).await?;
                active.tunnel_server_id = Set(None);
                active.tunnel_ip = Set(None);
            }
            _ => {}
        }

        if let Some((is_gateway, vm_network, lan_ip)) = gateway {
            active.is_gateway = Set(is_gateway);
            active.vm_network = Set(vm_network);
            active.lan_ip = Set(lan_ip);
        }

        if !active.is_changed() {
            return self.client_record(client).await;
        }
        let updated = active.update(&self.db).await?;

        info!(
            tunnel_client_id = %client_id,
            tunnel_server_id = ?updated.tunnel_server_id,
            tunnel_ip = ?updated.tunnel_ip,
            is_gateway = updated.is_gateway,
            "Updated tunnel client"
        );
        self.client_record(updated).await
    }

    /// Next address for `client_id` in the server's network. Caller holds the
    /// server lock, so the taken set cannot change underneath.
    async fn allocate_address(
        &self,
        server: &tunnel_server::Model,
        client_id: Uuid,
    ) -> Result<IpAddr> {
        let network = parse_tunnel_network(&server.tunnel_network)?;
        let taken: HashSet<IpAddr> = tunnel_client::Entity::find()
            .filter(tunnel_client::Column::TunnelServerId.eq(server.id))
            .filter(tunnel_client::Column::Id.ne(client_id))
            .all(&self.db)
            .await?
            .into_iter()
            .filter_map(|c| c.tunnel_ip)
            .filter_map(|ip| match ip.parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(tunnel_ip = %ip, "Ignoring unparsable stored tunnel address");
                    None
                }
            })
            .collect();

        self.allocator
            .allocate(&network, &taken)
            .ok_or_else(|| ControlError::AddressPoolExhausted {
                tunnel_network: network.to_string(),
            })
    }

    /// Change operator-editable server settings
    pub async fn update_server_config(
        &self,
        server_id: Uuid,
        update: ServerConfigUpdate,
    ) -> Result<TunnelServer> {
        let server = resolve_server(&self.db, server_id).await?;
        let _guard = self.locks.servers.lock(server.id).await;
        let server = resolve_server(&self.db, server.id).await?;
        let server_id = server.id;

        let wg_port = update
            .wg_port
            .map(|p| validate_port("wg_port", p))
            .transpose()?;
        let public_iface = update
            .public_iface
            .as_deref()
            .map(|i| validate_iface("public_iface", i))
            .transpose()?;
        let network = update
            .tunnel_network
            .as_deref()
            .map(parse_tunnel_network)
            .transpose()?;

        if let Some(network) = &network {
            let server_address = self.allocator.server_address(network);
            let bound = tunnel_client::Entity::find()
                .filter(tunnel_client::Column::TunnelServerId.eq(server_id))
                .all(&self.db)
                .await?;

            for client in bound {
                let Some(tunnel_ip) = client.tunnel_ip else {
                    continue;
                };
                let Some(ip) = tunnel_ip.parse::<IpAddr>().ok().filter(|ip| network.contains(ip))
                else {
                    return Err(ControlError::TunnelNetworkShrinkConflict {
                        tunnel_network: network.to_string(),
                        tunnel_client_id: client.id,
                        tunnel_ip,
                    });
                };
                // the server's own address moves with the network
                if Some(ip) == server_address {
                    return Err(ControlError::ServerAddressConflict {
                        tunnel_network: network.to_string(),
                        tunnel_client_id: client.id,
                        tunnel_ip,
                    });
                }
            }
        }

        let mut active: tunnel_server::ActiveModel = server.into();
        if let Some(port) = wg_port {
            active.wg_port = Set(port as i32);
        }
        if let Some(iface) = public_iface {
            active.public_iface = Set(iface);
        }
        if let Some(network) = network {
            active.tunnel_network = Set(network.to_string());
        }
        let updated = active.update(&self.db).await?;

        info!(tunnel_server_id = %server_id, "Updated tunnel server config");
        Ok(convert::tunnel_server(updated)?)
    }

    /// Remove a client record; fails while rules still reference it
    pub async fn delete_client(&self, client_id: Uuid) -> Result<()> {
        let (_guards, client) = self.lock_client(client_id, None).await?;
        self.ensure_no_forwards(client.id).await?;

        tunnel_client::Entity::delete_by_id(client.id)
            .exec(&self.db)
            .await?;

        info!(tunnel_client_id = %client_id, "Deleted tunnel client");
        Ok(())
    }

    /// Copy agent-reported facts onto the agent's tunnel record
    pub async fn record_agent_facts(&self, agent_id: Uuid, facts: &AgentFacts) -> Result<()> {
        if facts.public_ip.is_some() || facts.wg_public_key.is_some() {
            let mut servers =
                tunnel_server::Entity::update_many().filter(tunnel_server::Column::AgentId.eq(agent_id));
            if let Some(ip) = &facts.public_ip {
                servers = servers.col_expr(tunnel_server::Column::PublicIp, Expr::value(ip.clone()));
            }
            if let Some(key) = &facts.wg_public_key {
                servers =
                    servers.col_expr(tunnel_server::Column::WgPublicKey, Expr::value(key.clone()));
            }
            servers.exec(&self.db).await?;
        }

        if let Some(key) = &facts.wg_public_key {
            tunnel_client::Entity::update_many()
                .col_expr(tunnel_client::Column::WgPublicKey, Expr::value(key.clone()))
                .filter(tunnel_client::Column::AgentId.eq(agent_id))
                .exec(&self.db)
                .await?;
        }

        Ok(())
    }

    pub async fn get_server(&self, server_id: Uuid) -> Result<TunnelServer> {
        let server = resolve_server(&self.db, server_id).await?;
        Ok(convert::tunnel_server(server)?)
    }

    /// A server joined with its bound clients, read from one snapshot
    pub async fn server_view(&self, server_id: Uuid) -> Result<TunnelServerView> {
        let txn = self.db.begin().await?;

        let server = resolve_server(&txn, server_id).await?;
        let clients = tunnel_client::Entity::find()
            .filter(tunnel_client::Column::TunnelServerId.eq(server.id))
            .order_by_asc(tunnel_client::Column::CreatedAt)
            .find_also_related(agent::Entity)
            .all(&txn)
            .await?;

        txn.commit().await?;

        Ok(TunnelServerView {
            server: convert::tunnel_server(server)?,
            clients: clients
                .into_iter()
                .map(|(client, owner)| convert::tunnel_client(client, owner.as_ref()))
                .collect::<std::result::Result<_, _>>()?,
        })
    }

    /// Every server with its bound clients
    pub async fn list_servers(&self) -> Result<Vec<TunnelServerView>> {
        let txn = self.db.begin().await?;

        let servers = tunnel_server::Entity::find()
            .order_by_asc(tunnel_server::Column::CreatedAt)
            .all(&txn)
            .await?;
        let clients = tunnel_client::Entity::find()
            .filter(tunnel_client::Column::TunnelServerId.is_not_null())
            .order_by_asc(tunnel_client::Column::CreatedAt)
            .find_also_related(agent::Entity)
            .all(&txn)
            .await?;

        txn.commit().await?;

        servers
            .into_iter()
            .map(|server| {
                let bound = clients
                    .iter()
                    .filter(|(c, _)| c.tunnel_server_id == Some(server.id))
                    .map(|(c, owner)| convert::tunnel_client(c.clone(), owner.as_ref()))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(TunnelServerView {
                    server: convert::tunnel_server(server)?,
                    clients: bound,
                })
            })
            .collect()
    }

    pub async fn get_client(&self, client_id: Uuid) -> Result<TunnelClient> {
        let client = resolve_client(&self.db, client_id).await?;
        self.client_record(client).await
    }

    pub async fn list_clients(&self) -> Result<Vec<TunnelClient>> {
        let rows = tunnel_client::Entity::find()
            .order_by_asc(tunnel_client::Column::CreatedAt)
            .find_also_related(agent::Entity)
            .all(&self.db)
            .await?;

        rows.into_iter()
            .map(|(client, owner)| {
                convert::tunnel_client(client, owner.as_ref()).map_err(ControlError::from)
            })
            .collect()
    }

    async fn client_record(&self, client: tunnel_client::Model) -> Result<TunnelClient> {
        let owner = agent::Entity::find_by_id(client.agent_id)
            .one(&self.db)
            .await?;
        Ok(convert::tunnel_client(client, owner.as_ref())?)
    }

    async fn ensure_no_forwards(&self, client_id: Uuid) -> Result<()> {
        let count = port_forward::Entity::find()
            .filter(port_forward::Column::TunnelClientId.eq(client_id))
            .count(&self.db)
            .await?;
        if count > 0 {
            return Err(ControlError::ClientHasForwards {
                tunnel_client_id: client_id,
                count,
            });
        }
        Ok(())
    }

    /// Lock the client's current server (plus `extra`) and return the client
    /// as read under those locks. Retries if the binding moved meanwhile.
    async fn lock_client(
        &self,
        client_id: Uuid,
        extra: Option<Uuid>,
    ) -> Result<(Vec<OwnedMutexGuard<()>>, tunnel_client::Model)> {
        loop {
            let seen = resolve_client(&self.db, client_id).await?;

            let mut ids: Vec<Uuid> = extra.into_iter().collect();
            ids.extend(seen.tunnel_server_id);
            let guards = self.locks.lock_servers(&ids).await;

            let current = resolve_client(&self.db, client_id).await?;
            if current.tunnel_server_id == seen.tunnel_server_id {
                return Ok((guards, current));
            }
            debug!(tunnel_client_id = %client_id, "Binding changed while locking, retrying");
        }
    }
}
