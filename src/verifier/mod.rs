use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::Serialize;

use crate::database::automations::AutomationStatus;
use crate::database::email_logs::EmailLogStatus;
use crate::database::scheduled_emails::ScheduledEmailStatus;
use crate::database::{accounts, automations, email_logs, policies, scheduled_emails, unsubscribes};
use crate::error::Result;
use crate::filter::TriggerField;

const VERIFY_BATCH_SIZE: u64 = 100;
const VERIFY_WINDOW_HOURS: i64 = 24;
pub const RECENCY_WINDOW_DAYS: i64 = 7;
pub const RECENCY_CANCEL_REASON: &str = "Template already sent to this recipient within 7 days";

#[derive(Debug, Default, Serialize)]
pub struct VerifyOutcome {
    pub examined: u32,
    pub verified: u32,
    pub cancelled: u32,
}

/// Re-qualifies pending sends that come due within the next 24 hours.
/// A row either has its verification flag cleared or is cancelled with a
/// human-readable reason; both outcomes are terminal for this cycle.
pub async fn run_verification_pass(
    db: &DatabaseConnection,
    now: DateTime<Utc>,
) -> Result<VerifyOutcome> {
    let window_end = now + Duration::hours(VERIFY_WINDOW_HOURS);

    let due = scheduled_emails::Entity::find()
        .filter(scheduled_emails::Column::Status.eq(ScheduledEmailStatus::Pending.to_string()))
        .filter(scheduled_emails::Column::RequiresVerification.eq(true))
        .filter(scheduled_emails::Column::ScheduledFor.gt(now))
        .filter(scheduled_emails::Column::ScheduledFor.lte(window_end))
        .order_by_asc(scheduled_emails::Column::ScheduledFor)
        .limit(VERIFY_BATCH_SIZE)
        .all(db)
        .await?;

    let mut outcome = VerifyOutcome::default();
    for row in due {
        outcome.examined += 1;
        match check_row(db, &row, now).await? {
            None => {
                let mut update: scheduled_emails::ActiveModel = row.into();
                update.requires_verification = Set(false);
                update.updated_at = Set(now);
                update.update(db).await?;
                outcome.verified += 1;
            }
            Some(reason) => {
                cancel_row(db, row, &reason, now).await?;
                outcome.cancelled += 1;
            }
        }
    }

    tracing::info!(
        examined = outcome.examined,
        verified = outcome.verified,
        cancelled = outcome.cancelled,
        "Verification pass complete"
    );
    Ok(outcome)
}

/// Returns a cancellation reason, or `None` when the row still qualifies.
async fn check_row(
    db: &DatabaseConnection,
    row: &scheduled_emails::Model,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    if let Some(automation_id) = &row.automation_id {
        let automation = automations::Entity::find_by_id(automation_id.clone())
            .one(db)
            .await?;
        match automation {
            None => return Ok(Some("Automation no longer exists".to_string())),
            Some(a) if AutomationStatus::from(a.status.clone()) != AutomationStatus::Active => {
                return Ok(Some(format!("Automation is no longer Active ({})", a.status)))
            }
            Some(_) => {}
        }
    }

    let account = accounts::Entity::find_by_id(row.account_id.clone())
        .one(db)
        .await?;
    let account = match account {
        None => return Ok(Some("Account no longer exists".to_string())),
        Some(a) => a,
    };
    if account.opted_out {
        return Ok(Some("Account has opted out of emails".to_string()));
    }
    match account.email_validation_status.as_str() {
        "invalid" | "risky" => {
            return Ok(Some(format!(
                "Recipient email failed validation ({})",
                account.email_validation_status
            )))
        }
        _ => {}
    }

    if !validator::validate_email(&row.recipient_email) {
        return Ok(Some(format!(
            "Recipient email is not valid: {}",
            row.recipient_email
        )));
    }

    if is_unsubscribed(db, &row.recipient_email).await? {
        return Ok(Some("Recipient has unsubscribed".to_string()));
    }

    match TriggerField::parse(&row.trigger_field) {
        Some(TriggerField::PolicyExpiration) | Some(TriggerField::PolicyEffective) => {
            if !qualifying_policy_exists(db, row).await? {
                return Ok(Some(format!(
                    "No active policy with {} on {}",
                    row.trigger_field, row.qualification_value
                )));
            }
        }
        _ => {}
    }

    if template_recently_sent(db, &row.template_id, &row.recipient_email, now).await? {
        return Ok(Some(RECENCY_CANCEL_REASON.to_string()));
    }

    Ok(None)
}

async fn qualifying_policy_exists(
    db: &DatabaseConnection,
    row: &scheduled_emails::Model,
) -> Result<bool> {
    let qualification_date =
        match chrono::NaiveDate::parse_from_str(&row.qualification_value, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => return Ok(false),
        };

    let mut query = policies::Entity::find()
        .filter(policies::Column::AccountId.eq(row.account_id.clone()))
        .filter(policies::Column::Status.eq("Active"));
    query = match TriggerField::parse(&row.trigger_field) {
        Some(TriggerField::PolicyEffective) => {
            query.filter(policies::Column::EffectiveDate.eq(qualification_date))
        }
        _ => query.filter(policies::Column::ExpirationDate.eq(qualification_date)),
    };

    Ok(query.one(db).await?.is_some())
}

pub async fn is_unsubscribed(db: &DatabaseConnection, email: &str) -> Result<bool> {
    let row = unsubscribes::Entity::find()
        .filter(unsubscribes::Column::Email.eq(email.to_lowercase()))
        .one(db)
        .await?;
    Ok(row.is_some())
}

/// The 7-day recency rule: has this template gone out to this recipient
/// (case-insensitive) and been accepted by the provider in the window?
pub async fn template_recently_sent(
    db: &DatabaseConnection,
    template_id: &str,
    recipient_email: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let cutoff = now - Duration::days(RECENCY_WINDOW_DAYS);
    let candidates = email_logs::Entity::find()
        .filter(email_logs::Column::TemplateId.eq(template_id))
        .filter(email_logs::Column::SentAt.gte(cutoff))
        .all(db)
        .await?;

    let recipient = recipient_email.to_lowercase();
    Ok(candidates.iter().any(|log| {
        log.to_email.to_lowercase() == recipient
            && EmailLogStatus::from(log.status.clone()) != EmailLogStatus::Failed
    }))
}

pub async fn cancel_row(
    db: &DatabaseConnection,
    row: scheduled_emails::Model,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    tracing::debug!(scheduled_email_id = %row.id, reason, "Cancelling scheduled email");
    let mut update: scheduled_emails::ActiveModel = row.into();
    update.status = Set(ScheduledEmailStatus::Cancelled.to_string());
    update.error_message = Set(Some(reason.to_string()));
    update.updated_at = Set(now);
    update.update(db).await?;
    Ok(())
}
