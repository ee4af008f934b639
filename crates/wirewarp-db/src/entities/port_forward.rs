//! Port-forward rules

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "port_forwards")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub tunnel_server_id: Uuid,
    pub tunnel_client_id: Uuid,

    /// "tcp" or "udp"
    pub protocol: String,

    pub public_port: i32,
    pub destination_ip: String,
    pub destination_port: i32,

    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// Only active rules claim (server, protocol, public_port)
    pub active: bool,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tunnel_server::Entity",
        from = "Column::TunnelServerId",
        to = "super::tunnel_server::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    TunnelServer,

    #[sea_orm(
        belongs_to = "super::tunnel_client::Entity",
        from = "Column::TunnelClientId",
        to = "super::tunnel_client::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    TunnelClient,
}

impl Related<super::tunnel_server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelServer.def()
    }
}

impl Related<super::tunnel_client::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelClient.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
