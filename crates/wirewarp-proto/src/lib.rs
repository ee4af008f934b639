//! WireWarp protocol and domain definitions
//!
//! Shared between the control plane, its HTTP/WebSocket surface and the
//! observer client: agent and topology records, port-forward rules, the
//! live status channel messages and the agent channel messages.

pub mod messages;
pub mod models;
pub mod ports;

pub use messages::{AgentMessage, LiveMessage, ServerMessage};
pub use models::*;
pub use ports::{parse_port_list, PortListError, PortRange};
