//! Channel message types
//!
//! All channels carry JSON text frames tagged by a `type` field. Receivers
//! map unrecognized kinds to an `Unknown` variant and ignore them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Agent, AgentType};

/// Server → observer messages on the live status channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    /// Full agent state, sent first on every connection
    Snapshot { agents: Vec<Agent> },
    /// Full current record of one agent
    AgentStatus { agent: Agent },
    /// Agent deleted by an operator
    AgentRemoved { agent_id: Uuid },
    #[serde(other)]
    Unknown,
}

/// Agent → server messages on the agent channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    /// First contact: redeem a registration token
    Register {
        token: String,
        #[serde(default)]
        hostname: Option<String>,
        /// Informational; the token decides the type
        #[serde(default)]
        agent_type: Option<AgentType>,
        #[serde(default)]
        version: Option<String>,
    },
    /// Reconnect with a previously issued credential
    Auth { jwt: String },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        public_ip: Option<String>,
        #[serde(default)]
        wg_public_key: Option<String>,
    },
    /// Outcome of a command the agent ran
    CommandResult {
        #[serde(default)]
        command_id: Option<String>,
        #[serde(default)]
        success: bool,
        #[serde(default)]
        output: String,
    },
    /// Telemetry sample; every field besides `timestamp` is kept as reported
    Metrics {
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(flatten)]
        data: serde_json::Map<String, serde_json::Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Server → agent replies on the agent channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered { agent_id: Uuid, jwt: String },
    Authenticated { agent_id: Uuid },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_live_kind_is_tolerated() {
        let msg: LiveMessage =
            serde_json::from_str(r#"{"type":"metrics","cpu":0.4}"#).unwrap();
        assert_eq!(msg, LiveMessage::Unknown);
    }

    #[test]
    fn test_agent_removed_wire_format() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(LiveMessage::AgentRemoved { agent_id: id }).unwrap();
        assert_eq!(json["type"], "agent_removed");
        assert_eq!(json["agent_id"], id.to_string());
    }

    #[test]
    fn test_heartbeat_with_sparse_fields() {
        let msg: AgentMessage = serde_json::from_str(
            r#"{"type":"heartbeat","timestamp":"2025-01-01T00:00:00Z","version":"0.3.1"}"#,
        )
        .unwrap();
        match msg {
            AgentMessage::Heartbeat {
                version, public_ip, ..
            } => {
                assert_eq!(version.as_deref(), Some("0.3.1"));
                assert!(public_ip.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_command_result_defaults() {
        let msg: AgentMessage =
            serde_json::from_str(r#"{"type":"command_result","success":true}"#).unwrap();
        assert_eq!(
            msg,
            AgentMessage::CommandResult {
                command_id: None,
                success: true,
                output: String::new(),
            }
        );
    }

    #[test]
    fn test_metrics_keeps_reported_fields() {
        let msg: AgentMessage = serde_json::from_str(
            r#"{"type":"metrics","timestamp":"2025-01-01T00:00:00Z","cpu":0.4,"rx_bytes":1024}"#,
        )
        .unwrap();
        match msg {
            AgentMessage::Metrics { timestamp, data } => {
                assert_eq!(timestamp.as_deref(), Some("2025-01-01T00:00:00Z"));
                assert_eq!(data.len(), 2);
                assert_eq!(data["cpu"], 0.4);
                assert_eq!(data["rx_bytes"], 1024);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unrecognized_agent_kind_is_tolerated() {
        let msg: AgentMessage =
            serde_json::from_str(r#"{"type":"firmware_update","url":"x"}"#).unwrap();
        assert_eq!(msg, AgentMessage::Unknown);
    }
}
