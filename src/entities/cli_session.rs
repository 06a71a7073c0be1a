use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cli_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub device_id: String,
    pub user_id: Option<String>, // set once the browser completes the pairing
    pub token: String,
    pub status: String, // "pending" | "authenticated" | "revoked"
    pub created_at: i64,
    pub expires_at: i64,
    pub last_used_at: i64,
    pub user_agent: Option<String>,
    pub last_action: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
