//! WireWarp control plane
//!
//! Agent registry, tunnel topology, port-forward rules, service templates and
//! the live status hub, on top of the `wirewarp-db` store.

pub mod allocator;
pub mod config;
mod convert;
pub mod error;
pub mod hub;
pub mod locks;
pub mod plane;
pub mod port_forward;
pub mod registry;
pub mod sessions;
pub mod sweeper;
pub mod telemetry;
pub mod templates;
pub mod topology;

pub use allocator::{NextFreeAddress, TunnelIpAllocator};
pub use config::ControlConfig;
pub use error::{ControlError, ErrorKind, Result};
pub use hub::{StatusHub, Subscription};
pub use locks::{KeyedLocks, LockTable};
pub use plane::ControlPlane;
pub use port_forward::PortForwardEngine;
pub use registry::{AgentRegistry, Redemption};
pub use sessions::{AgentSession, AgentSessions};
pub use sweeper::StaleSweeper;
pub use telemetry::{Telemetry, MAX_METRICS_LIMIT};
pub use templates::{apply_template, TemplateApplication, TemplateCatalog, BUILTIN_TEMPLATES};
pub use topology::{
    ClientUpdate, GatewayUpdate, ServerConfigUpdate, ServerSettings, TopologyStore,
};
