use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sender_domains")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub owner_id: String,
    pub domain: String,
    /// pending | verified
    pub status: String,
    pub inbound_parse_enabled: bool,
}

impl Model {
    pub fn is_verified(&self) -> bool {
        self.status == "verified"
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::new_v4().to_string()),
            status: Set("pending".to_string()),
            inbound_parse_enabled: Set(false),
            ..ActiveModelTrait::default()
        }
    }
}
