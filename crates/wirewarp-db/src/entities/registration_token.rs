//! Single-use registration tokens

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "registration_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// SHA-256 hash of the token secret
    #[sea_orm(unique)]
    pub token_hash: String,

    /// First group of the secret, shown in listings
    pub token_hint: String,

    /// Agent type granted on redemption
    pub agent_type: String,

    /// Flipped to true exactly once, on redemption
    pub used: bool,

    pub expires_at: ChronoDateTimeUtc,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
