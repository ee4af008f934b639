//! HTTP and WebSocket surface of the WireWarp control plane
//!
//! Public routes: health, REST token redemption, the agent channel and the
//! live status channel (which authenticates with a query token). Everything
//! else requires an operator session token.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod ws;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;
use wirewarp_control::ControlPlane;

use crate::middleware::JwtState;

/// Application state shared across handlers
pub struct AppState {
    pub control: ControlPlane,
    pub jwt: Arc<JwtState>,
}

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "WireWarp API",
        version = "0.1.0",
        description = "Control plane for a fleet of WireGuard tunnel servers and clients"
    ),
    modifiers(&BearerAuth),
    paths(
        handlers::health_check,
        handlers::list_agents,
        handlers::redeem_token,
        handlers::get_agent,
        handlers::rename_agent,
        handlers::delete_agent,
        handlers::issue_token,
        handlers::list_tokens,
        handlers::reissue_credential,
        handlers::list_agent_metrics,
        handlers::list_tunnel_servers,
        handlers::create_tunnel_server,
        handlers::get_tunnel_server,
        handlers::update_tunnel_server,
        handlers::list_tunnel_clients,
        handlers::create_tunnel_client,
        handlers::get_tunnel_client,
        handlers::update_tunnel_client,
        handlers::delete_tunnel_client,
        handlers::list_port_forwards,
        handlers::create_port_forward,
        handlers::get_port_forward,
        handlers::update_port_forward,
        handlers::delete_port_forward,
        handlers::list_service_templates,
        handlers::create_service_template,
        handlers::apply_service_template,
    ),
    components(
        schemas(
            wirewarp_proto::Agent,
            wirewarp_proto::AgentType,
            wirewarp_proto::AgentStatus,
            wirewarp_proto::RegistrationToken,
            wirewarp_proto::RegistrationTokenSummary,
            wirewarp_proto::AgentMetricSample,
            wirewarp_proto::TunnelServer,
            wirewarp_proto::TunnelClient,
            wirewarp_proto::TunnelServerView,
            wirewarp_proto::ForwardProtocol,
            wirewarp_proto::PortForwardRule,
            wirewarp_proto::PortForwardDraft,
            wirewarp_proto::PortForwardUpdate,
            wirewarp_proto::TemplateProtocol,
            wirewarp_proto::ServiceTemplate,
            models::HealthResponse,
            models::ErrorResponse,
            models::IssueTokenRequest,
            models::TokenList,
            models::RedeemTokenRequest,
            models::RedeemTokenResponse,
            models::CredentialResponse,
            models::AgentList,
            models::RenameAgentRequest,
            models::MetricList,
            models::CreateTunnelServerRequest,
            models::UpdateTunnelServerRequest,
            models::TunnelServerList,
            models::CreateTunnelClientRequest,
            models::UpdateTunnelClientRequest,
            models::TunnelClientList,
            models::PortForwardList,
            models::CreateTemplateRequest,
            models::TemplateList,
            models::ApplyTemplateRequest,
        )
    ),
    tags(
        (name = "agents", description = "Agent registry and registration tokens"),
        (name = "topology", description = "Tunnel servers and clients"),
        (name = "port-forwards", description = "Port-forward rules"),
        (name = "service-templates", description = "Service templates"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS (for browser dashboards)
    pub enable_cors: bool,
    /// Allowed CORS origins (if None, allows all)
    pub cors_origins: Option<Vec<String>>,
    /// Secret for operator session tokens
    pub jwt_secret: String,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            enable_cors: true,
            cors_origins: None,
            jwt_secret: String::new(),
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, control: ControlPlane) -> Self {
        let state = Arc::new(AppState {
            control,
            jwt: Arc::new(JwtState::new(config.jwt_secret.as_bytes())),
        });

        Self { config, state }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let api_doc = ApiDoc::openapi();
        let jwt_state = self.state.jwt.clone();

        // Build PUBLIC routes (no session token required)
        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/agents", post(handlers::redeem_token))
            .route("/ws/agent", get(ws::agent_ws))
            .route("/ws/dashboard", get(ws::dashboard_ws))
            .with_state(self.state.clone());

        // Build PROTECTED routes (require session token authentication)
        let protected_router = Router::new()
            .route("/api/agents", get(handlers::list_agents))
            .route(
                "/api/agents/tokens",
                get(handlers::list_tokens).post(handlers::issue_token),
            )
            .route(
                "/api/agents/{id}",
                get(handlers::get_agent)
                    .patch(handlers::rename_agent)
                    .delete(handlers::delete_agent),
            )
            .route(
                "/api/agents/{id}/credential",
                post(handlers::reissue_credential),
            )
            .route(
                "/api/agents/{id}/metrics",
                get(handlers::list_agent_metrics),
            )
            .route(
                "/api/tunnel-servers",
                get(handlers::list_tunnel_servers).post(handlers::create_tunnel_server),
            )
            .route(
                "/api/tunnel-servers/{id}",
                get(handlers::get_tunnel_server).patch(handlers::update_tunnel_server),
            )
            .route(
                "/api/tunnel-clients",
                get(handlers::list_tunnel_clients).post(handlers::create_tunnel_client),
            )
            .route(
                "/api/tunnel-clients/{id}",
                get(handlers::get_tunnel_client)
                    .patch(handlers::update_tunnel_client)
                    .delete(handlers::delete_tunnel_client),
            )
            .route(
                "/api/port-forwards",
                get(handlers::list_port_forwards).post(handlers::create_port_forward),
            )
            .route(
                "/api/port-forwards/{id}",
                get(handlers::get_port_forward)
                    .patch(handlers::update_port_forward)
                    .delete(handlers::delete_port_forward),
            )
            .route(
                "/api/service-templates",
                get(handlers::list_service_templates).post(handlers::create_service_template),
            )
            .route(
                "/api/service-templates/{id}/apply",
                post(handlers::apply_service_template),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                jwt_state,
                middleware::require_auth,
            ));

        // Merge public and protected routers
        let api_router = public_router.merge(protected_router);

        // SwaggerUi also serves /api/openapi.json
        let router = Router::new()
            .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", api_doc))
            .merge(api_router);

        let cors = if self.config.enable_cors {
            let origin = match &self.config.cors_origins {
                Some(origins) => AllowOrigin::list(
                    origins
                        .iter()
                        .filter_map(|o| HeaderValue::from_str(o).ok())
                        .collect::<Vec<_>>(),
                ),
                None => AllowOrigin::from(Any),
            };

            Some(
                CorsLayer::new()
                    .allow_methods([
                        Method::GET,
                        Method::POST,
                        Method::PUT,
                        Method::DELETE,
                        Method::PATCH,
                    ])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                    .allow_origin(origin),
            )
        } else {
            None
        };

        // Build middleware stack
        let mut router = router.layer(TraceLayer::new_for_http());

        if let Some(cors) = cors {
            router = router.layer(cors);
        }

        router
    }

    /// Start the API server; returns when `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        info!("Starting API server on {}", self.config.bind_addr);
        info!(
            "OpenAPI spec: http://{}/api/openapi.json",
            self.config.bind_addr
        );
        info!("Swagger UI: http://{}/swagger-ui", self.config.bind_addr);

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let json = doc.to_json().unwrap();
        assert!(json.contains("/api/port-forwards/{id}"));
        assert!(json.contains("bearer_auth"));
    }
}
