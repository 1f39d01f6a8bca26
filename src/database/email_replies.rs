use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_replies")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub owner_id: String,
    /// None when the inbound message could not be correlated to a send.
    pub email_log_id: Option<i64>,
    pub account_id: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to_email: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references_header: Option<String>,
    /// JSON map of the unfolded, lowercased inbound headers.
    pub raw_headers: Option<String>,
    pub received_at: DateTimeUtc,
    pub sender_verified: bool,
    pub expected_sender_email: Option<String>,
    pub verification_notes: Option<String>,
    pub inbox_injected: bool,
    pub inbox_injected_at: Option<DateTimeUtc>,
    /// gmail | microsoft | sendgrid_fallback
    pub inbox_injection_provider: Option<String>,
    pub inbox_injection_error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::email_logs::Entity",
        from = "Column::EmailLogId",
        to = "super::email_logs::Column::Id"
    )]
    EmailLog,
}

impl Related<super::email_logs::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::EmailLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            id: Set(Uuid::now_v7().to_string()),
            received_at: Set(chrono::Utc::now()),
            sender_verified: Set(false),
            inbox_injected: Set(false),
            ..ActiveModelTrait::default()
        }
    }
}
