//! WebSocket channels
//!
//! - `/ws/dashboard`: live status for observers. A snapshot goes out first,
//!   then every queued change. An observer evicted for falling behind is
//!   closed and expected to reconnect.
//! - `/ws/agent`: agent registration/authentication followed by heartbeats,
//!   metrics samples and command results.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wirewarp_control::ControlError;
use wirewarp_proto::{AgentFacts, AgentMessage, ServerMessage};

use crate::error::api_error;
use crate::AppState;

/// How long a fresh agent channel may stay silent before its first frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    token: Option<String>,
}

async fn send_json<T: Serialize>(sender: &mut WsSender, message: &T) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize channel message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

// ---------------------------------------------------------------------------
// Live status channel
// ---------------------------------------------------------------------------

/// Live status channel for dashboards
///
/// The session token is checked before the upgrade, so a bad token gets a
/// plain 401 rather than a socket that closes immediately.
pub async fn dashboard_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LiveQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(token) = query.token else {
        return api_error(
            StatusCode::UNAUTHORIZED,
            "Missing 'token' query parameter",
            "MISSING_AUTH",
        )
        .into_response();
    };
    if let Err(rejection) = state.jwt.authorize(&token) {
        return rejection.into_response();
    }

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| dashboard_session(socket, state)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn dashboard_session(socket: WebSocket, state: Arc<AppState>) {
    let (snapshot, mut subscription) = match state.control.subscribe().await {
        Ok(joined) => joined,
        Err(e) => {
            error!("Failed to build live snapshot: {}", e);
            return;
        }
    };
    let observer_id = subscription.id();
    info!(observer_id, "Live status observer connected");

    let (mut sender, mut receiver) = socket.split();
    if send_json(&mut sender, &snapshot).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            queued = subscription.recv() => match queued {
                Some(message) => {
                    if send_json(&mut sender, &message).await.is_err() {
                        break;
                    }
                }
                None => {
                    warn!(observer_id, "Observer fell behind, closing live channel");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(observer_id, "Live channel read error: {}", e);
                    break;
                }
                // observers have nothing to say
                Some(Ok(_)) => {}
            },
        }
    }

    drop(subscription);
    info!(observer_id, "Live status observer disconnected");
}

// ---------------------------------------------------------------------------
// Agent channel
// ---------------------------------------------------------------------------

/// Agent channel: first frame registers or authenticates, then heartbeats
pub async fn agent_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| agent_session(socket, state))
}

async fn agent_session(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let Some((agent_id, credential)) = handshake(&state, &mut sender, &mut receiver).await else {
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    // Rotation or deletion may have landed since the handshake
    let session = match state
        .control
        .open_agent_session(agent_id, &credential)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(agent_id = %agent_id, "Agent session refused: {}", e);
            let _ = send_json(
                &mut sender,
                &ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = session.cancel.cancelled() => {
                info!(agent_id = %agent_id, "Agent session revoked or superseded");
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !handle_agent_frame(&state, agent_id, text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(agent_id = %agent_id, "Agent channel read error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    // A newer session for the same agent owns the status now
    if state.control.sessions().unregister(&session) {
        if let Err(e) = state.control.registry().mark_disconnected(agent_id).await {
            warn!(agent_id = %agent_id, "Failed to mark agent disconnected: {}", e);
        }
    }
    info!(agent_id = %agent_id, "Agent channel closed");
}

/// Wait for a register or auth frame; returns the agent and the credential
/// it now holds
async fn handshake(
    state: &AppState,
    sender: &mut WsSender,
    receiver: &mut WsReceiver,
) -> Option<(Uuid, String)> {
    let first = match tokio::time::timeout(HANDSHAKE_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => return None,
        Err(_) => {
            debug!("Agent channel handshake timed out");
            return None;
        }
    };

    let message: AgentMessage = match serde_json::from_str(first.as_str()) {
        Ok(message) => message,
        Err(e) => {
            let _ = send_json(
                sender,
                &ServerMessage::Error {
                    message: format!("Malformed frame: {}", e),
                },
            )
            .await;
            return None;
        }
    };

    let outcome = match message {
        AgentMessage::Register {
            token,
            hostname,
            version,
            ..
        } => {
            let facts = AgentFacts {
                hostname,
                version,
                ..AgentFacts::default()
            };
            state
                .control
                .registry()
                .redeem(&token, facts, None)
                .await
                .map(|r| {
                    (
                        r.agent.id,
                        r.credential.clone(),
                        ServerMessage::Registered {
                            agent_id: r.agent.id,
                            jwt: r.credential,
                        },
                    )
                })
        }
        AgentMessage::Auth { jwt } => {
            state.control.registry().authenticate(&jwt).await.map(|agent| {
                (
                    agent.id,
                    jwt,
                    ServerMessage::Authenticated { agent_id: agent.id },
                )
            })
        }
        _ => Err(ControlError::Validation(
            "Expected a register or auth frame".to_string(),
        )),
    };

    match outcome {
        Ok((agent_id, credential, reply)) => {
            if send_json(sender, &reply).await.is_err() {
                return None;
            }
            info!(agent_id = %agent_id, "Agent channel established");
            Some((agent_id, credential))
        }
        Err(e) => {
            warn!("Agent channel handshake rejected: {}", e);
            let _ = send_json(
                sender,
                &ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            None
        }
    }
}

/// Process one frame from an established agent; `false` ends the session
async fn handle_agent_frame(state: &AppState, agent_id: Uuid, text: &str) -> bool {
    let message: AgentMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(agent_id = %agent_id, "Ignoring malformed agent frame: {}", e);
            return true;
        }
    };

    match message {
        AgentMessage::Heartbeat {
            version,
            hostname,
            public_ip,
            wg_public_key,
            ..
        } => {
            let facts = AgentFacts {
                hostname,
                public_ip,
                version,
                wg_public_key,
            };
            keep_alive(agent_id, "heartbeat", state.control.heartbeat(agent_id, facts).await)
        }
        AgentMessage::CommandResult {
            command_id,
            success,
            output,
        } => {
            let recorded = state
                .control
                .record_command_result(agent_id, command_id.as_deref(), success, &output)
                .await;
            keep_alive(agent_id, "command result", recorded)
        }
        AgentMessage::Metrics { timestamp, data } => {
            let recorded = state
                .control
                .record_metrics(agent_id, timestamp.as_deref(), data)
                .await;
            keep_alive(agent_id, "metrics", recorded)
        }
        AgentMessage::Register { .. } | AgentMessage::Auth { .. } => {
            debug!(agent_id = %agent_id, "Ignoring repeated handshake frame");
            true
        }
        AgentMessage::Unknown => true,
    }
}

/// Outcome of recording a frame; only a vanished agent ends the session
fn keep_alive<T>(agent_id: Uuid, frame: &str, recorded: Result<T, ControlError>) -> bool {
    match recorded {
        Ok(_) => true,
        Err(ControlError::AgentNotFound(_)) => {
            warn!(agent_id = %agent_id, frame, "Frame from deleted agent");
            false
        }
        Err(e) => {
            warn!(agent_id = %agent_id, frame, "Failed to record agent frame: {}", e);
            true
        }
    }
}
