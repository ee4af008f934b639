//! Database entities

pub mod agent;
pub mod agent_metric;
pub mod port_forward;
pub mod registration_token;
pub mod service_template;
pub mod tunnel_client;
pub mod tunnel_server;

pub use agent::Entity as Agent;
pub use agent_metric::Entity as AgentMetric;
pub use port_forward::Entity as PortForward;
pub use registration_token::Entity as RegistrationToken;
pub use service_template::Entity as ServiceTemplate;
pub use tunnel_client::Entity as TunnelClient;
pub use tunnel_server::Entity as TunnelServer;

pub mod prelude {
    pub use super::agent::Entity as Agent;
    pub use super::agent_metric::Entity as AgentMetric;
    pub use super::port_forward::Entity as PortForward;
    pub use super::registration_token::Entity as RegistrationToken;
    pub use super::service_template::Entity as ServiceTemplate;
    pub use super::tunnel_client::Entity as TunnelClient;
    pub use super::tunnel_server::Entity as TunnelServer;
}
