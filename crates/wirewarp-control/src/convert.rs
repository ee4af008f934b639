//! Storage rows -> wire records

use sea_orm::DbErr;
use std::str::FromStr;
use wirewarp_db::entities::{
    agent, agent_metric, port_forward, registration_token, service_template, tunnel_client,
    tunnel_server,
};
use wirewarp_proto::{
    Agent, AgentMetricSample, AgentStatus, AgentType, ForwardProtocol, PortForwardRule,
    RegistrationTokenSummary, ServiceTemplate, TemplateProtocol, TunnelClient, TunnelServer,
};

fn parse_column<T: FromStr<Err = String>>(value: &str) -> Result<T, DbErr> {
    value.parse::<T>().map_err(DbErr::Custom)
}

fn port_column(value: i32) -> Result<u16, DbErr> {
    u16::try_from(value).map_err(|_| DbErr::Custom(format!("Stored port {} out of range", value)))
}

pub(crate) fn agent(row: agent::Model) -> Result<Agent, DbErr> {
    Ok(Agent {
        id: row.id,
        name: row.name,
        agent_type: parse_column::<AgentType>(&row.agent_type)?,
        hostname: row.hostname,
        public_ip: row.public_ip,
        version: row.version,
        status: parse_column::<AgentStatus>(&row.status)?,
        last_seen: row.last_seen,
        created_at: row.created_at,
    })
}

pub(crate) fn metric_sample(row: agent_metric::Model) -> Result<AgentMetricSample, DbErr> {
    Ok(AgentMetricSample {
        agent_id: row.agent_id,
        recorded_at: row.recorded_at,
        data: serde_json::from_str(&row.data)
            .map_err(|e| DbErr::Custom(format!("Stored metric sample is not JSON: {}", e)))?,
    })
}

pub(crate) fn token_summary(
    row: registration_token::Model,
) -> Result<RegistrationTokenSummary, DbErr> {
    Ok(RegistrationTokenSummary {
        hint: row.token_hint,
        agent_type: parse_column::<AgentType>(&row.agent_type)?,
        used: row.used,
        expires_at: row.expires_at,
        created_at: row.created_at,
    })
}

pub(crate) fn tunnel_server(row: tunnel_server::Model) -> Result<TunnelServer, DbErr> {
    Ok(TunnelServer {
        id: row.id,
        agent_id: row.agent_id,
        wg_port: port_column(row.wg_port)?,
        wg_interface: row.wg_interface,
        public_ip: row.public_ip,
        public_iface: row.public_iface,
        wg_public_key: row.wg_public_key,
        tunnel_network: row.tunnel_network,
        created_at: row.created_at,
    })
}

/// Client status is not stored; it mirrors the owning agent
pub(crate) fn tunnel_client(
    row: tunnel_client::Model,
    owner: Option<&agent::Model>,
) -> Result<TunnelClient, DbErr> {
    let status = match owner {
        Some(agent) => parse_column::<AgentStatus>(&agent.status)?,
        None => AgentStatus::Disconnected,
    };

    Ok(TunnelClient {
        id: row.id,
        agent_id: row.agent_id,
        tunnel_server_id: row.tunnel_server_id,
        tunnel_ip: row.tunnel_ip,
        is_gateway: row.is_gateway,
        vm_network: row.vm_network,
        lan_ip: row.lan_ip,
        wg_public_key: row.wg_public_key,
        status,
        created_at: row.created_at,
    })
}

pub(crate) fn port_forward(row: port_forward::Model) -> Result<PortForwardRule, DbErr> {
    Ok(PortForwardRule {
        id: row.id,
        tunnel_server_id: row.tunnel_server_id,
        tunnel_client_id: row.tunnel_client_id,
        protocol: parse_column::<ForwardProtocol>(&row.protocol)?,
        public_port: port_column(row.public_port)?,
        destination_ip: row.destination_ip,
        destination_port: port_column(row.destination_port)?,
        description: row.description,
        active: row.active,
        created_at: row.created_at,
    })
}

pub(crate) fn service_template(row: service_template::Model) -> Result<ServiceTemplate, DbErr> {
    Ok(ServiceTemplate {
        id: row.id,
        name: row.name,
        protocol: parse_column::<TemplateProtocol>(&row.protocol)?,
        ports: row.ports,
        is_builtin: row.is_builtin,
        created_at: row.created_at,
    })
}
