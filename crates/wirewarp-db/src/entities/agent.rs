//! Agent entity: a registered machine running tunnel software

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "agents")]
pub struct Model {
    /// Agent UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Operator label (may be empty)
    pub name: String,

    /// "server" or "client", fixed by the redeemed registration token
    pub agent_type: String,

    pub hostname: Option<String>,
    pub public_ip: Option<String>,
    pub version: Option<String>,

    /// "pending", "connected" or "disconnected"
    pub status: String,

    /// Most recent heartbeat
    pub last_seen: Option<ChronoDateTimeUtc>,

    /// ID embedded in the agent's current credential; rotated on reissue
    pub credential_id: Uuid,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::tunnel_server::Entity")]
    TunnelServer,

    #[sea_orm(has_one = "super::tunnel_client::Entity")]
    TunnelClient,

    #[sea_orm(has_many = "super::agent_metric::Entity")]
    AgentMetric,
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

impl Related<super::agent_metric::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AgentMetric.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
