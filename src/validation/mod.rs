use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set};
use serde::Serialize;

use crate::database::accounts;
use crate::error::Result;
use crate::mail::SendGridClient;

const VALIDATION_BATCH_SIZE: u64 = 100;

#[derive(Debug, Default, Serialize)]
pub struct ValidationOutcome {
    pub checked: u32,
    pub updated: u32,
}

/// Daily pass over never-validated accounts. Requires the validation API
/// key; without it the pass is a logged no-op so dispatch keeps treating
/// `unknown` recipients as eligible.
pub async fn run_validation_pass(
    db: &DatabaseConnection,
    sendgrid: &SendGridClient,
    now: DateTime<Utc>,
) -> Result<ValidationOutcome> {
    let batch = accounts::Entity::find()
        .filter(accounts::Column::EmailValidationStatus.eq("unknown"))
        .filter(accounts::Column::OptedOut.eq(false))
        .limit(VALIDATION_BATCH_SIZE)
        .all(db)
        .await?;

    let mut outcome = ValidationOutcome::default();
    for account in batch {
        let Some(email) = account.primary_email().map(str::to_string) else {
            continue;
        };

        match sendgrid.validate_address(&email).await {
            Ok(None) => {
                tracing::info!("SENDGRID_VALIDATION_KEY not set - skipping validation pass");
                break;
            }
            Ok(Some(verdict)) => {
                outcome.checked += 1;
                let mut update: accounts::ActiveModel = account.into();
                update.email_validation_status = Set(verdict.status);
                update.email_validation_score = Set(verdict.score);
                update.email_validation_reason = Set(verdict.reason);
                update.email_validation_details = Set(verdict.details);
                update.email_validated_at = Set(Some(now));
                update.update(db).await?;
                outcome.updated += 1;
            }
            Err(e) => {
                // One bad address never stops the batch.
                outcome.checked += 1;
                tracing::warn!(email = %email, "Address validation failed: {e}");
            }
        }
    }

    tracing::info!(
        checked = outcome.checked,
        updated = outcome.updated,
        "Email validation pass complete"
    );
    Ok(outcome)
}
