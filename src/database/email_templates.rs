use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_templates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub owner_id: String,
    /// Stable cross-owner identifier; `templateKey` nodes resolve through it.
    pub default_key: Option<String>,
    pub category: Option<String>,
    pub subject: String,
    pub html_content: String,
    pub text_content: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    /// JSON list of merge-field names used by the content.
    pub merge_fields: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::scheduled_emails::Entity")]
    ScheduledEmails,
}

impl Related<super::scheduled_emails::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ScheduledEmails.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::new_v4().to_string()),
            ..ActiveModelTrait::default()
        }
    }
}
