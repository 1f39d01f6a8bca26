use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "scheduled_emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub owner_id: String,
    pub automation_id: Option<String>,
    pub account_id: String,
    pub template_id: String,
    pub node_id: String,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub scheduled_for: DateTimeUtc,
    pub status: String,
    pub requires_verification: bool,
    /// ISO trigger date for date-triggered rows, or the literal `immediate`.
    pub qualification_value: String,
    /// policy_expiration | policy_effective | account_created | activation
    pub trigger_field: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_attempt_at: Option<DateTimeUtc>,
    pub error_message: Option<String>,
    pub email_log_id: Option<i64>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::automations::Entity",
        from = "Column::AutomationId",
        to = "super::automations::Column::Id"
    )]
    Automation,
    #[sea_orm(
        belongs_to = "super::email_templates::Entity",
        from = "Column::TemplateId",
        to = "super::email_templates::Column::Id"
    )]
    Template,
}

impl Related<super::automations::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Automation.def()
    }
}

impl Related<super::email_templates::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Set(Uuid::now_v7().to_string()),
            status: Set(ScheduledEmailStatus::Pending.to_string()),
            requires_verification: Set(false),
            attempts: Set(0),
            max_attempts: Set(3),
            created_at: Set(now),
            updated_at: Set(now),
            ..ActiveModelTrait::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledEmailStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl std::fmt::Display for ScheduledEmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduledEmailStatus::Pending => write!(f, "Pending"),
            ScheduledEmailStatus::Processing => write!(f, "Processing"),
            ScheduledEmailStatus::Sent => write!(f, "Sent"),
            ScheduledEmailStatus::Failed => write!(f, "Failed"),
            ScheduledEmailStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl From<String> for ScheduledEmailStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Processing" => ScheduledEmailStatus::Processing,
            "Sent" => ScheduledEmailStatus::Sent,
            "Failed" => ScheduledEmailStatus::Failed,
            "Cancelled" => ScheduledEmailStatus::Cancelled,
            _ => ScheduledEmailStatus::Pending,
        }
    }
}
