use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "automations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    /// None means a system-default automation that applies to every owner.
    pub owner_id: Option<String>,
    pub name: String,
    pub status: String,
    /// JSON-serialized `automation::FilterConfig`
    pub filter_config: String,
    /// JSON-serialized `Vec<automation::WorkflowNode>`
    pub nodes: String,
    pub timezone: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
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
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::new_v4().to_string()),
            status: Set(AutomationStatus::Draft.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationStatus {
    Active,
    Paused,
    Draft,
    Archived,
}

impl std::fmt::Display for AutomationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AutomationStatus::Active => write!(f, "Active"),
            AutomationStatus::Paused => write!(f, "Paused"),
            AutomationStatus::Draft => write!(f, "Draft"),
            AutomationStatus::Archived => write!(f, "Archived"),
        }
    }
}

impl From<String> for AutomationStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Active" => AutomationStatus::Active,
            "Paused" => AutomationStatus::Paused,
            "Archived" => AutomationStatus::Archived,
            _ => AutomationStatus::Draft,
        }
    }
}
