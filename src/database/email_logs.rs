use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, Set};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "email_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub owner_id: String,
    pub account_id: Option<String>,
    pub template_id: Option<String>,
    pub to_email: String,
    pub to_name: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub status: String,
    pub queued_at: DateTimeUtc,
    pub sent_at: Option<DateTimeUtc>,
    pub delivered_at: Option<DateTimeUtc>,
    pub first_opened_at: Option<DateTimeUtc>,
    pub first_clicked_at: Option<DateTimeUtc>,
    pub bounced_at: Option<DateTimeUtc>,
    pub unsubscribed_at: Option<DateTimeUtc>,
    pub failed_at: Option<DateTimeUtc>,
    pub open_count: i32,
    pub click_count: i32,
    /// Provider-assigned id (X-Message-Id), possibly a prefix of the id the
    /// event webhook later reports.
    pub message_id: Option<String>,
    /// The `<isg-{id}-{ms}@domain>` identifier minted at dispatch.
    pub custom_message_id: Option<String>,
    pub reply_to: Option<String>,
    pub bounce_type: Option<String>,
    pub error_message: Option<String>,
    pub reply_count: i32,
    pub last_reply_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::email_events::Entity")]
    Events,
    #[sea_orm(has_many = "super::email_replies::Entity")]
    Replies,
}

impl Related<super::email_events::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Events.def()
    }
}

impl Related<super::email_replies::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Replies.def()
    }
}

impl ActiveModelBehavior for ActiveModel {
    fn new() -> Self {
        Self {
            status: Set(EmailLogStatus::Queued.to_string()),
            queued_at: Set(chrono::Utc::now()),
            open_count: Set(0),
            click_count: Set(0),
            reply_count: Set(0),
            ..ActiveModelTrait::default()
        }
    }
}

/// Delivery lifecycle. Status only moves forward along
/// `Queued → Sent → Delivered → Opened → Clicked`; the failure states are
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailLogStatus {
    Queued,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Bounced,
    Dropped,
    SpamReport,
    Unsubscribed,
    Failed,
}

impl EmailLogStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EmailLogStatus::Bounced
                | EmailLogStatus::Dropped
                | EmailLogStatus::SpamReport
                | EmailLogStatus::Unsubscribed
                | EmailLogStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            EmailLogStatus::Queued => 0,
            EmailLogStatus::Sent => 1,
            EmailLogStatus::Delivered => 2,
            EmailLogStatus::Opened => 3,
            EmailLogStatus::Clicked => 4,
            _ => 5,
        }
    }

    /// Whether a transition to `next` respects the monotone poset.
    pub fn can_advance_to(&self, next: EmailLogStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return true;
        }
        next.rank() > self.rank()
    }
}

impl std::fmt::Display for EmailLogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EmailLogStatus::Queued => "Queued",
            EmailLogStatus::Sent => "Sent",
            EmailLogStatus::Delivered => "Delivered",
            EmailLogStatus::Opened => "Opened",
            EmailLogStatus::Clicked => "Clicked",
            EmailLogStatus::Bounced => "Bounced",
            EmailLogStatus::Dropped => "Dropped",
            EmailLogStatus::SpamReport => "SpamReport",
            EmailLogStatus::Unsubscribed => "Unsubscribed",
            EmailLogStatus::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl From<String> for EmailLogStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Sent" => EmailLogStatus::Sent,
            "Delivered" => EmailLogStatus::Delivered,
            "Opened" => EmailLogStatus::Opened,
            "Clicked" => EmailLogStatus::Clicked,
            "Bounced" => EmailLogStatus::Bounced,
            "Dropped" => EmailLogStatus::Dropped,
            "SpamReport" => EmailLogStatus::SpamReport,
            "Unsubscribed" => EmailLogStatus::Unsubscribed,
            "Failed" => EmailLogStatus::Failed,
            _ => EmailLogStatus::Queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EmailLogStatus::*;

    #[test]
    fn forward_transitions_allowed() {
        assert!(Queued.can_advance_to(Sent));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Delivered.can_advance_to(Opened));
        assert!(Opened.can_advance_to(Clicked));
        assert!(Sent.can_advance_to(Clicked));
    }

    #[test]
    fn regressions_rejected() {
        assert!(!Clicked.can_advance_to(Opened));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Opened.can_advance_to(Opened));
    }

    #[test]
    fn terminal_states_absorb() {
        assert!(!Bounced.can_advance_to(Opened));
        assert!(!Unsubscribed.can_advance_to(Clicked));
        assert!(!Failed.can_advance_to(Delivered));
        // but anything live can fail
        assert!(Clicked.can_advance_to(Bounced));
        assert!(Queued.can_advance_to(Dropped));
    }
}
