//! TunnelClient entity, 1:1 with a client agent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_clients")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub agent_id: Uuid,

    /// Bound server (NULL = unbound)
    pub tunnel_server_id: Option<Uuid>,

    /// Address inside the bound server's network; unique per server
    pub tunnel_ip: Option<String>,

    pub is_gateway: bool,

    /// Gateway mode only
    pub vm_network: Option<String>,

    /// Gateway mode only
    pub lan_ip: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub wg_public_key: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::agent::Entity",
        from = "Column::AgentId",
        to = "super::agent::Column::Id",
        on_update = "Cascade",
        on_delete = "Restrict"
    )]
    Agent,

    #[sea_orm(
        belongs_to = "super::tunnel_server::Entity",
        from = "Column::TunnelServerId",
        to = "super::tunnel_server::Column::Id",
        on_update = "Cascade",
        on_delete = "SetNull"
    )]
    TunnelServer,

    #[sea_orm(has_many = "super::port_forward::Entity")]
    PortForward,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl Related<super::tunnel_server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelServer.def()
    }
}

impl Related<super::port_forward::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortForward.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
