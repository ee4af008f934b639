use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use wirewarp_control::{
    ClientUpdate, GatewayUpdate, ServerConfigUpdate, ServerSettings, TemplateApplication,
};
use wirewarp_proto::{
    Agent, AgentFacts, PortForwardDraft, PortForwardRule, PortForwardUpdate, RegistrationToken,
    ServiceTemplate, TunnelClient, TunnelServer, TunnelServerView,
};

use crate::error::{api_error, control_error, json_body, ApiResult};
use crate::models::*;
use crate::AppState;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connected_agents: state.control.sessions().count(),
        observers: state.control.hub().observer_count(),
    })
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

/// List all agents
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "List of agents", body = AgentList),
        (status = 401, description = "Unauthorized", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn list_agents(State(state): State<Arc<AppState>>) -> ApiResult<Json<AgentList>> {
    let agents = state
        .control
        .registry()
        .list()
        .await
        .map_err(control_error)?;
    let total = agents.len();

    Ok(Json(AgentList { agents, total }))
}

/// Redeem a registration token
///
/// Public: the registration token is itself the credential.
#[utoipa::path(
    post,
    path = "/api/agents",
    request_body = RedeemTokenRequest,
    responses(
        (status = 201, description = "Agent registered", body = RedeemTokenResponse),
        (status = 400, description = "Token invalid or expired", body = ErrorResponse),
        (status = 409, description = "Token already used", body = ErrorResponse)
    ),
    tag = "agents"
)]
pub async fn redeem_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RedeemTokenRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RedeemTokenResponse>)> {
    let req = json_body(payload)?;

    let facts = AgentFacts {
        hostname: req.hostname,
        public_ip: req.public_ip,
        version: req.version,
        wg_public_key: None,
    };
    let redemption = state
        .control
        .registry()
        .redeem(&req.token, facts, req.name)
        .await
        .map_err(control_error)?;

    Ok((
        StatusCode::CREATED,
        Json(RedeemTokenResponse {
            agent: redemption.agent,
            credential: redemption.credential,
        }),
    ))
}

/// Get an agent
#[utoipa::path(
    get,
    path = "/api/agents/{id}",
    params(
        ("id" = Uuid, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "Agent", body = Agent),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Agent>> {
    let agent = state
        .control
        .registry()
        .get(id)
        .await
        .map_err(control_error)?;
    Ok(Json(agent))
}

/// Rename an agent
#[utoipa::path(
    patch,
    path = "/api/agents/{id}",
    params(
        ("id" = Uuid, Path, description = "Agent ID")
    ),
    request_body = RenameAgentRequest,
    responses(
        (status = 200, description = "Agent renamed", body = Agent),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn rename_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Result<Json<RenameAgentRequest>, JsonRejection>,
) -> ApiResult<Json<Agent>> {
    let req = json_body(payload)?;
    let agent = state
        .control
        .registry()
        .rename(id, &req.name)
        .await
        .map_err(control_error)?;
    Ok(Json(agent))
}

/// Delete an agent
#[utoipa::path(
    delete,
    path = "/api/agents/{id}",
    params(
        ("id" = Uuid, Path, description = "Agent ID"),
        ("cascade" = Option<bool>, Query, description = "Also remove its tunnel record and port-forward rules")
    ),
    responses(
        (status = 204, description = "Agent deleted"),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 409, description = "Agent still has dependents", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn delete_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DeleteAgentQuery>,
) -> ApiResult<StatusCode> {
    state
        .control
        .registry()
        .delete(id, query.cascade)
        .await
        .map_err(control_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Issue a registration token
#[utoipa::path(
    post,
    path = "/api/agents/tokens",
    request_body = IssueTokenRequest,
    responses(
        (status = 201, description = "Token issued; the secret is shown once", body = RegistrationToken),
        (status = 400, description = "Invalid request", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IssueTokenRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RegistrationToken>)> {
    let req = json_body(payload)?;
    let token = state
        .control
        .registry()
        .issue_token(req.agent_type)
        .await
        .map_err(control_error)?;
    Ok((StatusCode::CREATED, Json(token)))
}

/// List issued registration tokens (without secrets)
#[utoipa::path(
    get,
    path = "/api/agents/tokens",
    responses(
        (status = 200, description = "Issued tokens", body = TokenList)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn list_tokens(State(state): State<Arc<AppState>>) -> ApiResult<Json<TokenList>> {
    let tokens = state
        .control
        .registry()
        .list_tokens()
        .await
        .map_err(control_error)?;
    let total = tokens.len();
    Ok(Json(TokenList { tokens, total }))
}

/// Reissue an agent's credential
#[utoipa::path(
    post,
    path = "/api/agents/{id}/credential",
    params(
        ("id" = Uuid, Path, description = "Agent ID")
    ),
    responses(
        (status = 200, description = "New credential", body = CredentialResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn reissue_credential(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<CredentialResponse>> {
    let credential = state
        .control
        .registry()
        .reissue_credential(id)
        .await
        .map_err(control_error)?;
    Ok(Json(CredentialResponse {
        agent_id: id,
        credential,
    }))
}

/// Latest metric samples reported by an agent, newest first
#[utoipa::path(
    get,
    path = "/api/agents/{id}/metrics",
    params(
        ("id" = Uuid, Path, description = "Agent ID"),
        ("limit" = Option<u64>, Query, description = "Number of samples (1-1000, default 100)")
    ),
    responses(
        (status = 200, description = "Metric samples", body = MetricList),
        (status = 400, description = "Invalid limit", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "agents"
)]
pub async fn list_agent_metrics(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsQuery>,
) -> ApiResult<Json<MetricList>> {
    let samples = state
        .control
        .telemetry()
        .recent(id, query.limit)
        .await
        .map_err(control_error)?;
    let total = samples.len();
    Ok(Json(MetricList { samples, total }))
}

// ---------------------------------------------------------------------------
// Tunnel servers
// ---------------------------------------------------------------------------

/// List tunnel servers with their bound clients
#[utoipa::path(
    get,
    path = "/api/tunnel-servers",
    responses(
        (status = 200, description = "Tunnel servers", body = TunnelServerList)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn list_tunnel_servers(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TunnelServerList>> {
    let servers = state
        .control
        .topology()
        .list_servers()
        .await
        .map_err(control_error)?;
    let total = servers.len();
    Ok(Json(TunnelServerList { servers, total }))
}

/// Provision a tunnel server record for a server agent
#[utoipa::path(
    post,
    path = "/api/tunnel-servers",
    request_body = CreateTunnelServerRequest,
    responses(
        (status = 201, description = "Tunnel server created", body = TunnelServer),
        (status = 400, description = "Invalid settings", body = ErrorResponse),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 409, description = "Wrong agent type or already provisioned", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn create_tunnel_server(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTunnelServerRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TunnelServer>)> {
    let req = json_body(payload)?;
    let settings = ServerSettings {
        wg_port: req.wg_port,
        wg_interface: req.wg_interface,
        public_iface: req.public_iface,
        tunnel_network: req.tunnel_network,
    };

    let server = state
        .control
        .topology()
        .create_server(req.agent_id, settings)
        .await
        .map_err(control_error)?;
    Ok((StatusCode::CREATED, Json(server)))
}

/// Get a tunnel server with its bound clients
#[utoipa::path(
    get,
    path = "/api/tunnel-servers/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel server ID")
    ),
    responses(
        (status = 200, description = "Tunnel server", body = TunnelServerView),
        (status = 404, description = "Tunnel server not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn get_tunnel_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TunnelServerView>> {
    let view = state
        .control
        .topology()
        .server_view(id)
        .await
        .map_err(control_error)?;
    Ok(Json(view))
}

/// Update tunnel server configuration
#[utoipa::path(
    patch,
    path = "/api/tunnel-servers/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel server ID")
    ),
    request_body = UpdateTunnelServerRequest,
    responses(
        (status = 200, description = "Tunnel server updated", body = TunnelServer),
        (status = 400, description = "Invalid settings", body = ErrorResponse),
        (status = 404, description = "Tunnel server not found", body = ErrorResponse),
        (status = 409, description = "New network would exclude a bound client", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn update_tunnel_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Result<Json<UpdateTunnelServerRequest>, JsonRejection>,
) -> ApiResult<Json<TunnelServer>> {
    let req = json_body(payload)?;
    let update = ServerConfigUpdate {
        wg_port: req.wg_port,
        public_iface: req.public_iface,
        tunnel_network: req.tunnel_network,
    };

    let server = state
        .control
        .topology()
        .update_server_config(id, update)
        .await
        .map_err(control_error)?;
    Ok(Json(server))
}

// ---------------------------------------------------------------------------
// Tunnel clients
// ---------------------------------------------------------------------------

/// List tunnel clients
#[utoipa::path(
    get,
    path = "/api/tunnel-clients",
    responses(
        (status = 200, description = "Tunnel clients", body = TunnelClientList)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn list_tunnel_clients(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TunnelClientList>> {
    let clients = state
        .control
        .topology()
        .list_clients()
        .await
        .map_err(control_error)?;
    let total = clients.len();
    Ok(Json(TunnelClientList { clients, total }))
}

/// Provision a tunnel client record for a client agent
#[utoipa::path(
    post,
    path = "/api/tunnel-clients",
    request_body = CreateTunnelClientRequest,
    responses(
        (status = 201, description = "Tunnel client created", body = TunnelClient),
        (status = 404, description = "Agent not found", body = ErrorResponse),
        (status = 409, description = "Wrong agent type or already provisioned", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn create_tunnel_client(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTunnelClientRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<TunnelClient>)> {
    let req = json_body(payload)?;
    let client = state
        .control
        .topology()
        .create_client(req.agent_id)
        .await
        .map_err(control_error)?;
    Ok((StatusCode::CREATED, Json(client)))
}

/// Get a tunnel client
#[utoipa::path(
    get,
    path = "/api/tunnel-clients/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel client ID")
    ),
    responses(
        (status = 200, description = "Tunnel client", body = TunnelClient),
        (status = 404, description = "Tunnel client not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn get_tunnel_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TunnelClient>> {
    let client = state
        .control
        .topology()
        .get_client(id)
        .await
        .map_err(control_error)?;
    Ok(Json(client))
}

/// Bind, unbind or reconfigure a tunnel client
///
/// Binding and gateway changes are applied together or not at all.
#[utoipa::path(
    patch,
    path = "/api/tunnel-clients/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel client ID")
    ),
    request_body = UpdateTunnelClientRequest,
    responses(
        (status = 200, description = "Tunnel client updated", body = TunnelClient),
        (status = 400, description = "Invalid gateway settings", body = ErrorResponse),
        (status = 404, description = "Tunnel client or server not found", body = ErrorResponse),
        (status = 409, description = "Client has rules on its current server or the network is full", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn update_tunnel_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Result<Json<UpdateTunnelClientRequest>, JsonRejection>,
) -> ApiResult<Json<TunnelClient>> {
    let req = json_body(payload)?;

    let gateway = match req.is_gateway {
        Some(is_gateway) => Some(GatewayUpdate {
            is_gateway,
            vm_network: req.vm_network,
            lan_ip: req.lan_ip,
        }),
        None if req.vm_network.is_some() || req.lan_ip.is_some() => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "vm_network and lan_ip require is_gateway",
                "VALIDATION_ERROR",
            ));
        }
        None => None,
    };

    let client = state
        .control
        .topology()
        .update_client(
            id,
            ClientUpdate {
                tunnel_server_id: req.tunnel_server_id,
                gateway,
            },
        )
        .await
        .map_err(control_error)?;

    Ok(Json(client))
}

/// Delete a tunnel client record
#[utoipa::path(
    delete,
    path = "/api/tunnel-clients/{id}",
    params(
        ("id" = Uuid, Path, description = "Tunnel client ID")
    ),
    responses(
        (status = 204, description = "Tunnel client deleted"),
        (status = 404, description = "Tunnel client not found", body = ErrorResponse),
        (status = 409, description = "Port-forward rules still reference the client", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "topology"
)]
pub async fn delete_tunnel_client(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .control
        .topology()
        .delete_client(id)
        .await
        .map_err(control_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Port forwards
// ---------------------------------------------------------------------------

/// List port-forward rules
#[utoipa::path(
    get,
    path = "/api/port-forwards",
    params(
        ("tunnel_server_id" = Option<Uuid>, Query, description = "Only rules of this tunnel server")
    ),
    responses(
        (status = 200, description = "Port-forward rules", body = PortForwardList)
    ),
    security(("bearer_auth" = [])),
    tag = "port-forwards"
)]
pub async fn list_port_forwards(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PortForwardQuery>,
) -> ApiResult<Json<PortForwardList>> {
    debug!(tunnel_server_id = ?query.tunnel_server_id, "Listing port-forward rules");

    let rules = state
        .control
        .forwards()
        .list(query.tunnel_server_id)
        .await
        .map_err(control_error)?;
    let total = rules.len();
    Ok(Json(PortForwardList { rules, total }))
}

/// Create a port-forward rule
#[utoipa::path(
    post,
    path = "/api/port-forwards",
    request_body = PortForwardDraft,
    responses(
        (status = 201, description = "Rule created", body = PortForwardRule),
        (status = 400, description = "Invalid rule", body = ErrorResponse),
        (status = 404, description = "Tunnel server or client not found", body = ErrorResponse),
        (status = 409, description = "Public port already claimed by an active rule", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "port-forwards"
)]
pub async fn create_port_forward(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<PortForwardDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PortForwardRule>)> {
    let draft = json_body(payload)?;
    let rule = state
        .control
        .forwards()
        .create(draft)
        .await
        .map_err(control_error)?;
    Ok((StatusCode::CREATED, Json(rule)))
}

/// Get a port-forward rule
#[utoipa::path(
    get,
    path = "/api/port-forwards/{id}",
    params(
        ("id" = Uuid, Path, description = "Rule ID")
    ),
    responses(
        (status = 200, description = "Port-forward rule", body = PortForwardRule),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "port-forwards"
)]
pub async fn get_port_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PortForwardRule>> {
    let rule = state
        .control
        .forwards()
        .get(id)
        .await
        .map_err(control_error)?;
    Ok(Json(rule))
}

/// Edit or toggle a port-forward rule
///
/// A body carrying only `active` is a toggle.
#[utoipa::path(
    patch,
    path = "/api/port-forwards/{id}",
    params(
        ("id" = Uuid, Path, description = "Rule ID")
    ),
    request_body = PortForwardUpdate,
    responses(
        (status = 200, description = "Rule updated", body = PortForwardRule),
        (status = 400, description = "Invalid rule", body = ErrorResponse),
        (status = 404, description = "Rule not found", body = ErrorResponse),
        (status = 409, description = "Public port already claimed by an active rule", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "port-forwards"
)]
pub async fn update_port_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Result<Json<PortForwardUpdate>, JsonRejection>,
) -> ApiResult<Json<PortForwardRule>> {
    let changes = json_body(payload)?;
    let forwards = state.control.forwards();

    let only_active = PortForwardUpdate {
        active: changes.active,
        ..PortForwardUpdate::default()
    };
    let rule = match changes.active {
        Some(active) if changes == only_active => forwards.toggle(id, active).await,
        _ => forwards.update(id, changes).await,
    }
    .map_err(control_error)?;

    Ok(Json(rule))
}

/// Delete a port-forward rule
#[utoipa::path(
    delete,
    path = "/api/port-forwards/{id}",
    params(
        ("id" = Uuid, Path, description = "Rule ID")
    ),
    responses(
        (status = 204, description = "Rule deleted"),
        (status = 404, description = "Rule not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "port-forwards"
)]
pub async fn delete_port_forward(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .control
        .forwards()
        .delete(id)
        .await
        .map_err(control_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Service templates
// ---------------------------------------------------------------------------

/// List service templates
#[utoipa::path(
    get,
    path = "/api/service-templates",
    responses(
        (status = 200, description = "Service templates, built-ins first", body = TemplateList)
    ),
    security(("bearer_auth" = [])),
    tag = "service-templates"
)]
pub async fn list_service_templates(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TemplateList>> {
    let templates = state
        .control
        .templates()
        .list()
        .await
        .map_err(control_error)?;
    let total = templates.len();
    Ok(Json(TemplateList { templates, total }))
}

/// Create a custom service template
#[utoipa::path(
    post,
    path = "/api/service-templates",
    request_body = CreateTemplateRequest,
    responses(
        (status = 201, description = "Template created", body = ServiceTemplate),
        (status = 400, description = "Invalid protocol or port list", body = ErrorResponse),
        (status = 409, description = "Template name taken", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "service-templates"
)]
pub async fn create_service_template(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTemplateRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ServiceTemplate>)> {
    let req = json_body(payload)?;
    let template = state
        .control
        .templates()
        .create(&req.name, &req.protocol, &req.ports)
        .await
        .map_err(control_error)?;

    info!(template_id = %template.id, "Service template created via API");
    Ok((StatusCode::CREATED, Json(template)))
}

/// Pre-fill a port-forward draft from a template
#[utoipa::path(
    post,
    path = "/api/service-templates/{id}/apply",
    params(
        ("id" = Uuid, Path, description = "Template ID")
    ),
    request_body = ApplyTemplateRequest,
    responses(
        (status = 200, description = "Draft rule, not yet created", body = PortForwardDraft),
        (status = 404, description = "Template not found", body = ErrorResponse)
    ),
    security(("bearer_auth" = [])),
    tag = "service-templates"
)]
pub async fn apply_service_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ApplyTemplateRequest>, JsonRejection>,
) -> ApiResult<Json<PortForwardDraft>> {
    let req = json_body(payload)?;
    let application = TemplateApplication {
        tunnel_server_id: req.tunnel_server_id,
        tunnel_client_id: req.tunnel_client_id,
        destination_ip: req.destination_ip,
        protocol: req.protocol,
    };

    let draft = state
        .control
        .templates()
        .apply(id, application)
        .await
        .map_err(control_error)?;
    Ok(Json(draft))
}
