//! TunnelServer entity, 1:1 with a server agent

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_servers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(unique)]
    pub agent_id: Uuid,

    pub wg_port: i32,
    pub wg_interface: String,

    /// Reported by the agent
    pub public_ip: Option<String>,

    pub public_iface: String,

    /// Reported by the agent
    #[sea_orm(column_type = "Text", nullable)]
    pub wg_public_key: Option<String>,

    /// CIDR of the VPN subnet
    pub tunnel_network: String,

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

    #[sea_orm(has_many = "super::tunnel_client::Entity")]
    TunnelClient,

    #[sea_orm(has_many = "super::port_forward::Entity")]
    PortForward,
}

impl Related<super::agent::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Agent.def()
    }
}

impl Related<super::tunnel_client::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TunnelClient.def()
    }
}

impl Related<super::port_forward::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortForward.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
