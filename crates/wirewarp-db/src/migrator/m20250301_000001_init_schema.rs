//! Initial control-plane schema

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. agents
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Agent::Table)
                    .if_not_exists()
                    .col(uuid(Agent::Id).primary_key())
                    .col(string_len(Agent::Name, 255).default(""))
                    .col(string_len(Agent::AgentType, 16))
                    .col(string_len_null(Agent::Hostname, 255))
                    .col(string_len_null(Agent::PublicIp, 64))
                    .col(string_len_null(Agent::Version, 64))
                    .col(string_len(Agent::Status, 16).default("pending"))
                    .col(timestamp_with_time_zone_null(Agent::LastSeen))
                    .col(uuid(Agent::CredentialId))
                    .col(
                        timestamp_with_time_zone(Agent::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_agents_status_last_seen")
                    .table(Agent::Table)
                    .col(Agent::Status)
                    .col(Agent::LastSeen)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. registration_tokens
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(RegistrationToken::Table)
                    .if_not_exists()
                    .col(uuid(RegistrationToken::Id).primary_key())
                    .col(string_len(RegistrationToken::TokenHash, 64).unique_key())
                    .col(string_len(RegistrationToken::TokenHint, 16))
                    .col(string_len(RegistrationToken::AgentType, 16))
                    .col(boolean(RegistrationToken::Used).default(false))
                    .col(timestamp_with_time_zone(RegistrationToken::ExpiresAt))
                    .col(
                        timestamp_with_time_zone(RegistrationToken::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. tunnel_servers (1:1 with a server agent)
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(TunnelServer::Table)
                    .if_not_exists()
                    .col(uuid(TunnelServer::Id).primary_key())
                    .col(uuid(TunnelServer::AgentId).unique_key())
                    .col(integer(TunnelServer::WgPort).default(51820))
                    .col(string_len(TunnelServer::WgInterface, 32).default("wg0"))
                    .col(string_len_null(TunnelServer::PublicIp, 64))
                    .col(string_len(TunnelServer::PublicIface, 32).default("eth0"))
                    .col(text_null(TunnelServer::WgPublicKey))
                    .col(string_len(TunnelServer::TunnelNetwork, 64).default("10.0.0.0/24"))
                    .col(
                        timestamp_with_time_zone(TunnelServer::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnel_servers_agent_id")
                            .from(TunnelServer::Table, TunnelServer::AgentId)
                            .to(Agent::Table, Agent::Id)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 4. tunnel_clients (1:1 with a client agent)
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(TunnelClient::Table)
                    .if_not_exists()
                    .col(uuid(TunnelClient::Id).primary_key())
                    .col(uuid(TunnelClient::AgentId).unique_key())
                    .col(uuid_null(TunnelClient::TunnelServerId))
                    .col(string_len_null(TunnelClient::TunnelIp, 64))
                    .col(boolean(TunnelClient::IsGateway).default(false))
                    .col(string_len_null(TunnelClient::VmNetwork, 64))
                    .col(string_len_null(TunnelClient::LanIp, 64))
                    .col(text_null(TunnelClient::WgPublicKey))
                    .col(
                        timestamp_with_time_zone(TunnelClient::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnel_clients_agent_id")
                            .from(TunnelClient::Table, TunnelClient::AgentId)
                            .to(Agent::Table, Agent::Id)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_tunnel_clients_tunnel_server_id")
                            .from(TunnelClient::Table, TunnelClient::TunnelServerId)
                            .to(TunnelServer::Table, TunnelServer::Id)
                            .on_delete(ForeignKeyAction::SetNull)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // No two bound clients of one server share an address. NULLs are
        // distinct, so unbound clients never collide.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_clients_server_ip")
                    .table(TunnelClient::Table)
                    .col(TunnelClient::TunnelServerId)
                    .col(TunnelClient::TunnelIp)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 5. port_forwards
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(PortForward::Table)
                    .if_not_exists()
                    .col(uuid(PortForward::Id).primary_key())
                    .col(uuid(PortForward::TunnelServerId))
                    .col(uuid(PortForward::TunnelClientId))
                    .col(string_len(PortForward::Protocol, 8))
                    .col(integer(PortForward::PublicPort))
                    .col(string_len(PortForward::DestinationIp, 64))
                    .col(integer(PortForward::DestinationPort))
                    .col(text_null(PortForward::Description))
                    .col(boolean(PortForward::Active).default(true))
                    .col(
                        timestamp_with_time_zone(PortForward::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_port_forwards_tunnel_server_id")
                            .from(PortForward::Table, PortForward::TunnelServerId)
                            .to(TunnelServer::Table, TunnelServer::Id)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_port_forwards_tunnel_client_id")
                            .from(PortForward::Table, PortForward::TunnelClientId)
                            .to(TunnelClient::Table, TunnelClient::Id)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_port_forwards_tunnel_server_id")
                    .table(PortForward::Table)
                    .col(PortForward::TunnelServerId)
                    .to_owned(),
            )
            .await?;

        // Partial index: only active rules claim a public port. The index
        // builder has no WHERE clause, so this one is raw SQL (same text is
        // valid on SQLite and PostgreSQL).
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_port_forwards_active_port \
                 ON port_forwards (tunnel_server_id, protocol, public_port) \
                 WHERE active",
            )
            .await?;

        // ============================================================
        // 6. service_templates
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ServiceTemplate::Table)
                    .if_not_exists()
                    .col(uuid(ServiceTemplate::Id).primary_key())
                    .col(string_len(ServiceTemplate::Name, 255).unique_key())
                    .col(string_len(ServiceTemplate::Protocol, 8))
                    .col(string_len(ServiceTemplate::Ports, 255))
                    .col(boolean(ServiceTemplate::IsBuiltin).default(false))
                    .col(
                        timestamp_with_time_zone(ServiceTemplate::CreatedAt)
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ServiceTemplate::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(PortForward::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TunnelClient::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(TunnelServer::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(RegistrationToken::Table).to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Agent::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum Agent {
    #[sea_orm(iden = "agents")]
    Table,
    Id,
    Name,
    AgentType,
    Hostname,
    PublicIp,
    Version,
    Status,
    LastSeen,
    CredentialId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum RegistrationToken {
    #[sea_orm(iden = "registration_tokens")]
    Table,
    Id,
    TokenHash,
    TokenHint,
    AgentType,
    Used,
    ExpiresAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum TunnelServer {
    #[sea_orm(iden = "tunnel_servers")]
    Table,
    Id,
    AgentId,
    WgPort,
    WgInterface,
    PublicIp,
    PublicIface,
    WgPublicKey,
    TunnelNetwork,
    CreatedAt,
}

#[derive(DeriveIden)]
enum TunnelClient {
    #[sea_orm(iden = "tunnel_clients")]
    Table,
    Id,
    AgentId,
    TunnelServerId,
    TunnelIp,
    IsGateway,
    VmNetwork,
    LanIp,
    WgPublicKey,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PortForward {
    #[sea_orm(iden = "port_forwards")]
    Table,
    Id,
    TunnelServerId,
    TunnelClientId,
    Protocol,
    PublicPort,
    DestinationIp,
    DestinationPort,
    Description,
    Active,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ServiceTemplate {
    #[sea_orm(iden = "service_templates")]
    Table,
    Id,
    Name,
    Protocol,
    Ports,
    IsBuiltin,
    CreatedAt,
}
