//! Control-plane behaviour against an in-memory SQLite store

use sea_orm::{EntityTrait, PaginatorTrait};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;
use wirewarp_control::{
    ClientUpdate, ControlConfig, ControlError, ControlPlane, GatewayUpdate, ServerConfigUpdate,
    ServerSettings, TemplateApplication,
};
use wirewarp_proto::{
    Agent, AgentFacts, AgentStatus, AgentType, ForwardProtocol, LiveMessage, PortForwardDraft,
    TunnelClient, TunnelServer,
};

const SECRET: &[u8] = b"control-plane-test-secret";

async fn setup_with(config: ControlConfig) -> ControlPlane {
    let db = wirewarp_db::connect("sqlite::memory:")
        .await
        .expect("Failed to connect to in-memory database");
    wirewarp_db::migrate(&db)
        .await
        .expect("Failed to run migrations");
    ControlPlane::new(db, config, SECRET)
}

async fn setup() -> ControlPlane {
    setup_with(ControlConfig::default()).await
}

async fn register(plane: &ControlPlane, agent_type: AgentType) -> Agent {
    let token = plane.registry().issue_token(agent_type).await.unwrap();
    plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await
        .unwrap()
        .agent
}

async fn server(plane: &ControlPlane) -> TunnelServer {
    let agent = register(plane, AgentType::Server).await;
    plane
        .topology()
        .create_server(agent.id, ServerSettings::default())
        .await
        .unwrap()
}

async fn bound_client(plane: &ControlPlane, server: &TunnelServer) -> TunnelClient {
    let agent = register(plane, AgentType::Client).await;
    let client = plane.topology().create_client(agent.id).await.unwrap();
    plane.topology().bind(client.id, server.id).await.unwrap()
}

fn draft(server: &TunnelServer, client: &TunnelClient, port: i64, dest: &str) -> PortForwardDraft {
    PortForwardDraft {
        tunnel_server_id: server.id,
        tunnel_client_id: client.id,
        protocol: "tcp".to_string(),
        public_port: port,
        destination_ip: dest.to_string(),
        destination_port: 80,
        description: None,
        active: None,
    }
}

// ---------------------------------------------------------------------------
// Agent registry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_redeem_server_token_then_reuse_fails() {
    let plane = setup().await;

    let token = plane
        .registry()
        .issue_token(AgentType::Server)
        .await
        .unwrap();
    assert!(!token.used);

    let redemption = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await
        .unwrap();
    assert_eq!(redemption.agent.agent_type, AgentType::Server);
    assert_eq!(redemption.agent.status, AgentStatus::Pending);
    assert!(redemption.agent.last_seen.is_none());

    let second = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await;
    assert!(matches!(second, Err(ControlError::TokenAlreadyUsed)));
}

#[tokio::test]
async fn test_unknown_token_is_invalid() {
    let plane = setup().await;
    let result = plane
        .registry()
        .redeem("AAAAA-BBBBB-CCCCC-DDDDD", AgentFacts::default(), None)
        .await;
    assert!(matches!(result, Err(ControlError::TokenInvalid)));
}

#[tokio::test]
async fn test_expired_token_is_rejected() {
    let plane = setup_with(ControlConfig {
        token_ttl: Duration::ZERO,
        ..ControlConfig::default()
    })
    .await;

    let token = plane
        .registry()
        .issue_token(AgentType::Client)
        .await
        .unwrap();
    let result = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await;
    assert!(matches!(result, Err(ControlError::TokenExpired)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_redemptions_yield_exactly_one_agent() {
    let plane = setup().await;
    let token = plane
        .registry()
        .issue_token(AgentType::Client)
        .await
        .unwrap()
        .token;

    let attempts = 8;
    let handles: Vec<_> = (0..attempts)
        .map(|_| {
            let plane = plane.clone();
            let token = token.clone();
            tokio::spawn(async move {
                plane
                    .registry()
                    .redeem(&token, AgentFacts::default(), None)
                    .await
            })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let successes = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    let already_used = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(ControlError::TokenAlreadyUsed))))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(already_used, attempts - 1);
    assert_eq!(plane.registry().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_redeem_uses_reported_hostname_as_default_name() {
    let plane = setup().await;
    let token = plane
        .registry()
        .issue_token(AgentType::Server)
        .await
        .unwrap();

    let facts = AgentFacts {
        hostname: Some("edge-fra-1".to_string()),
        version: Some("0.4.0".to_string()),
        ..AgentFacts::default()
    };
    let agent = plane
        .registry()
        .redeem(&token.token, facts, None)
        .await
        .unwrap()
        .agent;

    assert_eq!(agent.name, "edge-fra-1");
    assert_eq!(agent.version.as_deref(), Some("0.4.0"));

    let tokens = plane.registry().list_tokens().await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert!(tokens[0].used);
    assert!(token.token.starts_with(&tokens[0].hint));
}

#[tokio::test]
async fn test_redeem_without_reported_facts() {
    let plane = setup().await;
    let token = plane
        .registry()
        .issue_token(AgentType::Client)
        .await
        .unwrap();

    let agent = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await
        .unwrap()
        .agent;

    assert_eq!(agent.name, "");
    assert!(agent.hostname.is_none());
    assert!(agent.public_ip.is_none());
    assert!(agent.version.is_none());
    assert_eq!(plane.registry().get(agent.id).await.unwrap(), agent);

    // An unbound client record has no server, address or gateway data
    let client = plane.topology().create_client(agent.id).await.unwrap();
    assert!(client.tunnel_server_id.is_none());
    assert!(client.tunnel_ip.is_none());
    assert!(client.vm_network.is_none());
}

#[tokio::test]
async fn test_heartbeat_unknown_agent() {
    let plane = setup().await;
    let result = plane.heartbeat(Uuid::new_v4(), AgentFacts::default()).await;
    assert!(matches!(result, Err(ControlError::AgentNotFound(_))));
}

#[tokio::test]
async fn test_heartbeat_connects_pending_agent() {
    let plane = setup().await;
    let agent = register(&plane, AgentType::Client).await;

    let facts = AgentFacts {
        public_ip: Some("203.0.113.9".to_string()),
        version: Some("1.2.0".to_string()),
        ..AgentFacts::default()
    };
    let updated = plane.heartbeat(agent.id, facts).await.unwrap();

    assert_eq!(updated.status, AgentStatus::Connected);
    assert!(updated.last_seen.is_some());
    assert_eq!(updated.public_ip.as_deref(), Some("203.0.113.9"));
    assert_eq!(updated.version.as_deref(), Some("1.2.0"));

    // sparse heartbeat keeps earlier facts
    let again = plane
        .heartbeat(agent.id, AgentFacts::default())
        .await
        .unwrap();
    assert_eq!(again.public_ip.as_deref(), Some("203.0.113.9"));
}

#[tokio::test]
async fn test_mark_stale_skips_pending_agents() {
    let plane = setup_with(ControlConfig {
        liveness_threshold: Duration::ZERO,
        ..ControlConfig::default()
    })
    .await;

    let pending = register(&plane, AgentType::Client).await;
    let live = register(&plane, AgentType::Client).await;
    plane
        .heartbeat(live.id, AgentFacts::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let swept = plane.registry().mark_stale().await.unwrap();

    assert_eq!(swept, vec![live.id]);
    assert_eq!(
        plane.registry().get(live.id).await.unwrap().status,
        AgentStatus::Disconnected
    );
    assert_eq!(
        plane.registry().get(pending.id).await.unwrap().status,
        AgentStatus::Pending
    );

    // already disconnected agents are not swept again
    assert!(plane.registry().mark_stale().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_heartbeat_survives_sweep() {
    let plane = setup().await;
    let agent = register(&plane, AgentType::Server).await;
    plane
        .heartbeat(agent.id, AgentFacts::default())
        .await
        .unwrap();

    assert!(plane.registry().mark_stale().await.unwrap().is_empty());
    assert_eq!(
        plane.registry().get(agent.id).await.unwrap().status,
        AgentStatus::Connected
    );
}

#[tokio::test]
async fn test_delete_with_dependents_requires_cascade() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;
    plane
        .forwards()
        .create(draft(&server, &client, 8080, "10.0.0.2"))
        .await
        .unwrap();

    let result = plane.registry().delete(server.agent_id, false).await;
    assert!(matches!(
        result,
        Err(ControlError::AgentHasDependents { .. })
    ));

    plane.registry().delete(server.agent_id, true).await.unwrap();

    assert!(matches!(
        plane.registry().get(server.agent_id).await,
        Err(ControlError::AgentNotFound(_))
    ));
    assert!(plane.forwards().list(None).await.unwrap().is_empty());

    // the client survives, unbound
    let client = plane.topology().get_client(client.id).await.unwrap();
    assert!(client.tunnel_server_id.is_none());
    assert!(client.tunnel_ip.is_none());
}

#[tokio::test]
async fn test_delete_agent_without_dependents() {
    let plane = setup().await;
    let agent = register(&plane, AgentType::Client).await;

    plane.registry().delete(agent.id, false).await.unwrap();
    assert_eq!(plane.registry().count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reissue_credential_revokes_old_one() {
    let plane = setup().await;
    let token = plane
        .registry()
        .issue_token(AgentType::Server)
        .await
        .unwrap();
    let redemption = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await
        .unwrap();
    let agent_id = redemption.agent.id;

    let session = plane.sessions().register(agent_id);
    let fresh = plane
        .registry()
        .reissue_credential(agent_id)
        .await
        .unwrap();

    assert!(session.cancel.is_cancelled());
    assert!(matches!(
        plane.registry().authenticate(&redemption.credential).await,
        Err(ControlError::Auth(_))
    ));

    let agent = plane.registry().authenticate(&fresh).await.unwrap();
    assert_eq!(agent.id, agent_id);
    assert_eq!(agent.agent_type, AgentType::Server);
}

#[tokio::test]
async fn test_session_opened_with_rotated_credential_is_refused() {
    let plane = setup().await;
    let token = plane
        .registry()
        .issue_token(AgentType::Client)
        .await
        .unwrap();
    let redemption = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await
        .unwrap();
    let agent_id = redemption.agent.id;

    // Handshake done with the old credential, rotation lands before the
    // channel registers its session
    let fresh = plane
        .registry()
        .reissue_credential(agent_id)
        .await
        .unwrap();

    let late = plane
        .open_agent_session(agent_id, &redemption.credential)
        .await;
    assert!(matches!(late, Err(ControlError::Auth(_))));
    assert!(!plane.sessions().is_connected(agent_id));

    let session = plane.open_agent_session(agent_id, &fresh).await.unwrap();
    assert!(plane.sessions().is_connected(agent_id));
    assert!(!session.cancel.is_cancelled());
}

#[tokio::test]
async fn test_session_for_deleted_agent_is_refused() {
    let plane = setup().await;
    let token = plane
        .registry()
        .issue_token(AgentType::Server)
        .await
        .unwrap();
    let redemption = plane
        .registry()
        .redeem(&token.token, AgentFacts::default(), None)
        .await
        .unwrap();

    plane
        .registry()
        .delete(redemption.agent.id, false)
        .await
        .unwrap();

    let late = plane
        .open_agent_session(redemption.agent.id, &redemption.credential)
        .await;
    assert!(matches!(late, Err(ControlError::Auth(_))));
    assert!(!plane.sessions().is_connected(redemption.agent.id));
}

// ---------------------------------------------------------------------------
// Telemetry
// ---------------------------------------------------------------------------

fn sample(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_metrics_count_as_liveness_and_are_stored() {
    let plane = setup().await;
    let agent = register(&plane, AgentType::Server).await;
    assert_eq!(agent.status, AgentStatus::Pending);

    plane
        .record_metrics(
            agent.id,
            Some("2025-01-01T00:00:00Z"),
            sample(&[("cpu", serde_json::json!(0.25))]),
        )
        .await
        .unwrap();
    plane
        .record_metrics(agent.id, None, sample(&[("cpu", serde_json::json!(0.5))]))
        .await
        .unwrap();

    let agent = plane.registry().get(agent.id).await.unwrap();
    assert_eq!(agent.status, AgentStatus::Connected);
    assert!(agent.last_seen.is_some());

    let samples = plane.telemetry().recent(agent.id, 10).await.unwrap();
    assert_eq!(samples.len(), 2);
    // newest first; the second sample was stamped on arrival
    assert_eq!(samples[0].data["cpu"], 0.5);
    assert_eq!(samples[1].data["cpu"], 0.25);

    let latest = plane.telemetry().recent(agent.id, 1).await.unwrap();
    assert_eq!(latest.len(), 1);

    assert!(matches!(
        plane.telemetry().recent(agent.id, 0).await,
        Err(ControlError::Validation(_))
    ));
    assert!(matches!(
        plane.telemetry().recent(Uuid::new_v4(), 10).await,
        Err(ControlError::AgentNotFound(_))
    ));
}

#[tokio::test]
async fn test_command_result_refreshes_liveness() {
    let plane = setup().await;
    let agent = register(&plane, AgentType::Client).await;

    let updated = plane
        .record_command_result(agent.id, Some("cmd-1"), false, "wg-quick: exit 1")
        .await
        .unwrap();
    assert_eq!(updated.status, AgentStatus::Connected);
    assert!(updated.last_seen.is_some());

    assert!(matches!(
        plane
            .record_command_result(Uuid::new_v4(), None, true, "")
            .await,
        Err(ControlError::AgentNotFound(_))
    ));
}

#[tokio::test]
async fn test_old_metrics_pruned_and_removed_with_agent() {
    let plane = setup_with(ControlConfig {
        metrics_retention: Duration::from_secs(3600),
        ..ControlConfig::default()
    })
    .await;
    let agent = register(&plane, AgentType::Server).await;

    plane
        .record_metrics(
            agent.id,
            Some("2020-01-01T00:00:00Z"),
            sample(&[("cpu", serde_json::json!(0.1))]),
        )
        .await
        .unwrap();
    plane
        .record_metrics(agent.id, None, sample(&[("cpu", serde_json::json!(0.2))]))
        .await
        .unwrap();

    plane.sweeper().sweep_once().await;
    let samples = plane.telemetry().recent(agent.id, 10).await.unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].data["cpu"], 0.2);

    plane.registry().delete(agent.id, false).await.unwrap();
    let left = wirewarp_db::entities::AgentMetric::find()
        .count(plane.db())
        .await
        .unwrap();
    assert_eq!(left, 0);
}

// ---------------------------------------------------------------------------
// Tunnel topology
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_provisioning_checks_agent_type() {
    let plane = setup().await;
    let client_agent = register(&plane, AgentType::Client).await;

    let result = plane
        .topology()
        .create_server(client_agent.id, ServerSettings::default())
        .await;
    assert!(matches!(result, Err(ControlError::TypeMismatch { .. })));

    plane.topology().create_client(client_agent.id).await.unwrap();
    let again = plane.topology().create_client(client_agent.id).await;
    assert!(matches!(
        again,
        Err(ControlError::AlreadyProvisioned { .. })
    ));
}

#[tokio::test]
async fn test_server_defaults() {
    let plane = setup().await;
    let server = server(&plane).await;

    assert_eq!(server.wg_port, 51820);
    assert_eq!(server.wg_interface, "wg0");
    assert_eq!(server.public_iface, "eth0");
    assert_eq!(server.tunnel_network, "10.0.0.0/24");
    assert!(server.wg_public_key.is_none());
}

#[tokio::test]
async fn test_bind_assigns_distinct_addresses() {
    let plane = setup().await;
    let server = server(&plane).await;

    let a = bound_client(&plane, &server).await;
    let b = bound_client(&plane, &server).await;

    assert_eq!(a.tunnel_ip.as_deref(), Some("10.0.0.2"));
    assert_eq!(b.tunnel_ip.as_deref(), Some("10.0.0.3"));

    // rebinding to the same server is a no-op
    let again = plane.topology().bind(a.id, server.id).await.unwrap();
    assert_eq!(again.tunnel_ip, a.tunnel_ip);

    let view = plane.topology().server_view(server.id).await.unwrap();
    assert_eq!(view.clients.len(), 2);
}

#[tokio::test]
async fn test_bind_rejects_swapped_ids() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let result = plane.topology().bind(server.id, client.id).await;
    assert!(matches!(result, Err(ControlError::TypeMismatch { .. })));

    let result = plane.topology().bind(client.id, Uuid::new_v4()).await;
    assert!(matches!(result, Err(ControlError::NotFound { .. })));
}

#[tokio::test]
async fn test_bind_exhausts_small_network() {
    let plane = setup().await;
    let agent = register(&plane, AgentType::Server).await;
    let server = plane
        .topology()
        .create_server(
            agent.id,
            ServerSettings {
                tunnel_network: Some("10.9.0.0/30".to_string()),
                ..ServerSettings::default()
            },
        )
        .await
        .unwrap();

    bound_client(&plane, &server).await;

    let agent = register(&plane, AgentType::Client).await;
    let client = plane.topology().create_client(agent.id).await.unwrap();
    let result = plane.topology().bind(client.id, server.id).await;
    assert!(matches!(
        result,
        Err(ControlError::AddressPoolExhausted { .. })
    ));
}

#[tokio::test]
async fn test_gateway_requires_both_fields_and_clears_on_disable() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;
    let topology = plane.topology();

    let missing = topology.set_gateway(client.id, true, None, None).await;
    assert!(matches!(missing, Err(ControlError::Validation(_))));

    let half = topology
        .set_gateway(client.id, true, Some("192.168.10.0/24"), None)
        .await;
    assert!(matches!(half, Err(ControlError::Validation(_))));

    let enabled = topology
        .set_gateway(client.id, true, Some("192.168.10.0/24"), Some("192.168.10.1"))
        .await
        .unwrap();
    assert!(enabled.is_gateway);
    assert_eq!(enabled.vm_network.as_deref(), Some("192.168.10.0/24"));
    assert_eq!(enabled.lan_ip.as_deref(), Some("192.168.10.1"));

    let disabled = topology
        .set_gateway(client.id, false, None, None)
        .await
        .unwrap();
    assert!(!disabled.is_gateway);
    assert!(disabled.vm_network.is_none());
    assert!(disabled.lan_ip.is_none());
}

#[tokio::test]
async fn test_network_shrink_conflict() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let result = plane
        .topology()
        .update_server_config(
            server.id,
            ServerConfigUpdate {
                tunnel_network: Some("10.1.0.0/24".to_string()),
                ..ServerConfigUpdate::default()
            },
        )
        .await;
    match result {
        Err(ControlError::TunnelNetworkShrinkConflict {
            tunnel_client_id, ..
        }) => assert_eq!(tunnel_client_id, client.id),
        other => panic!("expected shrink conflict, got {:?}", other),
    }

    // growing keeps every client inside
    let updated = plane
        .topology()
        .update_server_config(
            server.id,
            ServerConfigUpdate {
                wg_port: Some(51900),
                tunnel_network: Some("10.0.0.0/16".to_string()),
                ..ServerConfigUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.wg_port, 51900);
    assert_eq!(updated.tunnel_network, "10.0.0.0/16");
}

#[tokio::test]
async fn test_network_change_onto_client_address_conflicts() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;
    assert_eq!(client.tunnel_ip.as_deref(), Some("10.0.0.2"));

    // 10.0.0.2/31 still contains the client, but its first host is the
    // client's address, which the server would take
    let result = plane
        .topology()
        .update_server_config(
            server.id,
            ServerConfigUpdate {
                tunnel_network: Some("10.0.0.2/31".to_string()),
                ..ServerConfigUpdate::default()
            },
        )
        .await;
    match result {
        Err(ControlError::ServerAddressConflict {
            tunnel_client_id,
            tunnel_ip,
            ..
        }) => {
            assert_eq!(tunnel_client_id, client.id);
            assert_eq!(tunnel_ip, "10.0.0.2");
        }
        other => panic!("expected server address conflict, got {:?}", other),
    }

    let unchanged = plane.topology().get_server(server.id).await.unwrap();
    assert_eq!(unchanged.tunnel_network, "10.0.0.0/24");
}

#[tokio::test]
async fn test_rejected_client_update_changes_nothing() {
    let plane = setup().await;
    let server = server(&plane).await;
    let agent = register(&plane, AgentType::Client).await;
    let client = plane.topology().create_client(agent.id).await.unwrap();

    // bind plus an incomplete gateway: neither part is applied
    let result = plane
        .topology()
        .update_client(
            client.id,
            ClientUpdate {
                tunnel_server_id: Some(Some(server.id)),
                gateway: Some(GatewayUpdate {
                    is_gateway: true,
                    vm_network: None,
                    lan_ip: None,
                }),
            },
        )
        .await;
    assert!(matches!(result, Err(ControlError::Validation(_))));

    let after = plane.topology().get_client(client.id).await.unwrap();
    assert!(after.tunnel_server_id.is_none());
    assert!(after.tunnel_ip.is_none());
    assert!(!after.is_gateway);

    // a valid combined update lands in full
    let updated = plane
        .topology()
        .update_client(
            client.id,
            ClientUpdate {
                tunnel_server_id: Some(Some(server.id)),
                gateway: Some(GatewayUpdate {
                    is_gateway: true,
                    vm_network: Some("192.168.50.0/24".to_string()),
                    lan_ip: Some("192.168.50.1".to_string()),
                }),
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.tunnel_server_id, Some(server.id));
    assert_eq!(updated.tunnel_ip.as_deref(), Some("10.0.0.2"));
    assert!(updated.is_gateway);
}

#[tokio::test]
async fn test_blocked_rebind_keeps_gateway_settings() {
    let plane = setup().await;
    let first = server(&plane).await;
    let second = server(&plane).await;
    let client = bound_client(&plane, &first).await;
    plane
        .forwards()
        .create(draft(&first, &client, 3389, "192.168.1.30"))
        .await
        .unwrap();

    let result = plane
        .topology()
        .update_client(
            client.id,
            ClientUpdate {
                tunnel_server_id: Some(Some(second.id)),
                gateway: Some(GatewayUpdate {
                    is_gateway: true,
                    vm_network: Some("192.168.60.0/24".to_string()),
                    lan_ip: Some("192.168.60.1".to_string()),
                }),
            },
        )
        .await;
    assert!(matches!(result, Err(ControlError::ClientHasForwards { .. })));

    let after = plane.topology().get_client(client.id).await.unwrap();
    assert_eq!(after.tunnel_server_id, Some(first.id));
    assert!(!after.is_gateway);
    assert!(after.vm_network.is_none());
}

#[tokio::test]
async fn test_heartbeat_facts_reach_topology() {
    let plane = setup().await;
    let server = server(&plane).await;

    plane
        .heartbeat(
            server.agent_id,
            AgentFacts {
                public_ip: Some("198.51.100.7".to_string()),
                wg_public_key: Some("c2VydmVyLWtleQ==".to_string()),
                ..AgentFacts::default()
            },
        )
        .await
        .unwrap();

    let server = plane.topology().get_server(server.id).await.unwrap();
    assert_eq!(server.public_ip.as_deref(), Some("198.51.100.7"));
    assert_eq!(server.wg_public_key.as_deref(), Some("c2VydmVyLWtleQ=="));
}

#[tokio::test]
async fn test_client_status_mirrors_agent() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;
    assert_eq!(client.status, AgentStatus::Pending);

    plane
        .heartbeat(client.agent_id, AgentFacts::default())
        .await
        .unwrap();
    let client = plane.topology().get_client(client.id).await.unwrap();
    assert_eq!(client.status, AgentStatus::Connected);
}

#[tokio::test]
async fn test_client_with_forwards_cannot_move_or_be_deleted() {
    let plane = setup().await;
    let first = server(&plane).await;
    let second = server(&plane).await;
    let client = bound_client(&plane, &first).await;
    let rule = plane
        .forwards()
        .create(draft(&first, &client, 25565, "192.168.1.20"))
        .await
        .unwrap();

    assert!(matches!(
        plane.topology().bind(client.id, second.id).await,
        Err(ControlError::ClientHasForwards { .. })
    ));
    assert!(matches!(
        plane.topology().unbind(client.id).await,
        Err(ControlError::ClientHasForwards { .. })
    ));
    assert!(matches!(
        plane.topology().delete_client(client.id).await,
        Err(ControlError::ClientHasForwards { .. })
    ));

    plane.forwards().delete(rule.id).await.unwrap();
    let moved = plane.topology().bind(client.id, second.id).await.unwrap();
    assert_eq!(moved.tunnel_server_id, Some(second.id));
}

// ---------------------------------------------------------------------------
// Port-forward rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_active_port_conflicts() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let first = plane
        .forwards()
        .create(draft(&server, &client, 8080, "10.0.0.2"))
        .await
        .unwrap();

    let mut second = draft(&server, &client, 8080, "10.0.0.3");
    second.destination_port = 81;
    match plane.forwards().create(second).await {
        Err(ControlError::PortConflict { rule_id, .. }) => assert_eq!(rule_id, first.id),
        other => panic!("expected port conflict, got {:?}", other),
    }

    // same port, other protocol is fine
    let mut udp = draft(&server, &client, 8080, "10.0.0.3");
    udp.protocol = "udp".to_string();
    let udp = plane.forwards().create(udp).await.unwrap();
    assert_eq!(udp.protocol, ForwardProtocol::Udp);
}

#[tokio::test]
async fn test_toggle_rechecks_only_on_activation() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let mut inactive = draft(&server, &client, 443, "10.0.0.2");
    inactive.active = Some(false);
    let parked = plane.forwards().create(inactive).await.unwrap();
    let live = plane
        .forwards()
        .create(draft(&server, &client, 443, "10.0.0.2"))
        .await
        .unwrap();

    match plane.forwards().toggle(parked.id, true).await {
        Err(ControlError::PortConflict { rule_id, .. }) => assert_eq!(rule_id, live.id),
        other => panic!("expected port conflict, got {:?}", other),
    }

    // deactivating never conflicts
    plane.forwards().toggle(live.id, false).await.unwrap();
    let parked = plane.forwards().toggle(parked.id, true).await.unwrap();
    assert!(parked.active);
}

#[tokio::test]
async fn test_rule_validation() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let mut bad = draft(&server, &client, 0, "10.0.0.2");
    assert!(matches!(
        plane.forwards().create(bad.clone()).await,
        Err(ControlError::Validation(_))
    ));

    bad.public_port = 70000;
    assert!(matches!(
        plane.forwards().create(bad.clone()).await,
        Err(ControlError::Validation(_))
    ));

    bad.public_port = 8080;
    bad.protocol = "sctp".to_string();
    assert!(matches!(
        plane.forwards().create(bad.clone()).await,
        Err(ControlError::Validation(_))
    ));

    bad.protocol = "tcp".to_string();
    bad.destination_port = 0;
    assert!(matches!(
        plane.forwards().create(bad).await,
        Err(ControlError::Validation(_))
    ));
}

#[tokio::test]
async fn test_rule_requires_client_bound_to_server() {
    let plane = setup().await;
    let first = server(&plane).await;
    let second = server(&plane).await;
    let client = bound_client(&plane, &first).await;

    let result = plane
        .forwards()
        .create(draft(&second, &client, 8080, "10.0.0.2"))
        .await;
    assert!(matches!(result, Err(ControlError::Validation(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_leave_one_active_rule() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let plane = plane.clone();
            let mut d = draft(&server, &client, 9000, "10.0.0.2");
            d.destination_port = 1000 + i;
            tokio::spawn(async move { plane.forwards().create(d).await })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let created = results.iter().filter(|r| matches!(r, Ok(Ok(_)))).count();
    assert_eq!(created, 1);

    let active: Vec<_> = plane
        .forwards()
        .list(Some(server.id))
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.active)
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn test_update_rule_revalidates() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    plane
        .forwards()
        .create(draft(&server, &client, 80, "10.0.0.2"))
        .await
        .unwrap();
    let other = plane
        .forwards()
        .create(draft(&server, &client, 8080, "10.0.0.2"))
        .await
        .unwrap();

    let clash = plane
        .forwards()
        .update(
            other.id,
            wirewarp_proto::PortForwardUpdate {
                public_port: Some(80),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(clash, Err(ControlError::PortConflict { .. })));

    let moved = plane
        .forwards()
        .update(
            other.id,
            wirewarp_proto::PortForwardUpdate {
                public_port: Some(8443),
                description: Some("admin".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.public_port, 8443);
    assert_eq!(moved.description.as_deref(), Some("admin"));

    plane.forwards().delete(moved.id).await.unwrap();
    assert!(matches!(
        plane.forwards().get(moved.id).await,
        Err(ControlError::NotFound { .. })
    ));
}

// ---------------------------------------------------------------------------
// Service templates
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_builtin_templates_seed_once() {
    let plane = setup().await;

    let first = plane.templates().list().await.unwrap();
    let second = plane.templates().list().await.unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(second.len(), 4);
    assert!(first.iter().all(|t| t.is_builtin));

    let duplicate = plane.templates().create("DayZ", "udp", "2302").await;
    assert!(matches!(duplicate, Err(ControlError::DuplicateTemplate(_))));

    let bad_ports = plane.templates().create("Valheim", "udp", "2456-").await;
    assert!(matches!(bad_ports, Err(ControlError::Validation(_))));

    let custom = plane
        .templates()
        .create("Valheim", "udp", "2456-2458")
        .await
        .unwrap();
    assert!(!custom.is_builtin);
}

#[tokio::test]
async fn test_apply_template_then_create_rule() {
    let plane = setup().await;
    let server = server(&plane).await;
    let client = bound_client(&plane, &server).await;

    let dayz = plane
        .templates()
        .list()
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name == "DayZ")
        .unwrap();

    let draft = plane
        .templates()
        .apply(
            dayz.id,
            TemplateApplication {
                tunnel_server_id: server.id,
                tunnel_client_id: client.id,
                destination_ip: "192.168.1.40".to_string(),
                protocol: None,
            },
        )
        .await
        .unwrap();

    let rule = plane.forwards().create(draft).await.unwrap();
    assert_eq!(rule.protocol, ForwardProtocol::Udp);
    assert_eq!(rule.public_port, 2302);
    assert_eq!(rule.destination_port, 2302);
    assert_eq!(plane.forwards().list(None).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Live status
// ---------------------------------------------------------------------------

fn apply(cache: &mut HashMap<Uuid, Agent>, message: LiveMessage) {
    match message {
        LiveMessage::Snapshot { agents } => {
            *cache = agents.into_iter().map(|a| (a.id, a)).collect();
        }
        LiveMessage::AgentStatus { agent } => {
            cache.insert(agent.id, agent);
        }
        LiveMessage::AgentRemoved { agent_id } => {
            cache.remove(&agent_id);
        }
        LiveMessage::Unknown => {}
    }
}

#[tokio::test]
async fn test_observer_cache_converges_despite_duplicates() {
    let plane = setup().await;
    let early = register(&plane, AgentType::Server).await;

    let (snapshot, mut subscription) = plane.subscribe().await.unwrap();
    let mut cache = HashMap::new();
    apply(&mut cache, snapshot);
    assert!(cache.contains_key(&early.id));

    let late = register(&plane, AgentType::Client).await;
    plane
        .heartbeat(late.id, AgentFacts::default())
        .await
        .unwrap();
    plane
        .heartbeat(early.id, AgentFacts::default())
        .await
        .unwrap();
    plane.registry().mark_disconnected(early.id).await.unwrap();
    let doomed = register(&plane, AgentType::Client).await;
    plane.registry().delete(doomed.id, false).await.unwrap();

    while let Some(message) = subscription.try_recv() {
        // at-least-once delivery
        apply(&mut cache, message.clone());
        apply(&mut cache, message);
    }

    let truth: HashMap<Uuid, Agent> = plane
        .registry()
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.id, a))
        .collect();
    assert_eq!(cache, truth);
    assert_eq!(cache[&early.id].status, AgentStatus::Disconnected);
}

#[tokio::test]
async fn test_slow_observer_does_not_block_mutations() {
    let plane = setup_with(ControlConfig {
        observer_queue_capacity: 2,
        ..ControlConfig::default()
    })
    .await;
    let (_snapshot, mut slow) = plane.subscribe().await.unwrap();

    for _ in 0..5 {
        register(&plane, AgentType::Client).await;
    }

    assert!(slow.is_evicted());
    assert_eq!(slow.recv().await, None);
    assert_eq!(plane.hub().observer_count(), 0);
    assert_eq!(plane.registry().count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_sweeper_task_stops_on_cancel() {
    let plane = setup_with(ControlConfig {
        sweep_interval: Duration::from_millis(10),
        liveness_threshold: Duration::ZERO,
        ..ControlConfig::default()
    })
    .await;
    let agent = register(&plane, AgentType::Server).await;
    plane
        .heartbeat(agent.id, AgentFacts::default())
        .await
        .unwrap();

    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = plane.sweeper().spawn(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        plane.registry().get(agent.id).await.unwrap().status,
        AgentStatus::Disconnected
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("sweeper did not stop")
        .unwrap();
}
