use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::database::email_logs::EmailLogStatus;
use crate::database::scheduled_emails::ScheduledEmailStatus;
use crate::database::{accounts, email_logs, email_templates, owners, scheduled_emails};
use crate::error::{MailDripError, Result};
use crate::mail::merge::{self, MergeContext};
use crate::mail::mime;
use crate::mail::{OutboundEmail, SendGridClient};
use crate::verifier;

const DISPATCH_BATCH_SIZE: u64 = 50;
const STALE_PROCESSING_MINUTES: i64 = 10;

#[derive(Debug, Default, Serialize)]
pub struct DispatchOutcome {
    pub examined: u32,
    pub sent: u32,
    pub cancelled: u32,
    pub retried: u32,
    pub failed: u32,
}

/// Sends verified, due rows through the mail provider. Each row is
/// reserved with a compare-and-swap so parallel dispatchers never double
/// send; losing the race just skips the row.
pub struct Dispatcher {
    db: Arc<DatabaseConnection>,
    sendgrid: Arc<SendGridClient>,
    config: Arc<Config>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<DatabaseConnection>,
        sendgrid: Arc<SendGridClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            sendgrid,
            config,
        }
    }

    pub async fn run_dispatch_pass(&self, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        self.recover_stale_reservations(now).await?;

        let due = scheduled_emails::Entity::find()
            .filter(scheduled_emails::Column::Status.eq(ScheduledEmailStatus::Pending.to_string()))
            .filter(scheduled_emails::Column::ScheduledFor.lte(now))
            .filter(scheduled_emails::Column::RequiresVerification.eq(false))
            .order_by_asc(scheduled_emails::Column::ScheduledFor)
            .limit(DISPATCH_BATCH_SIZE)
            .all(&*self.db)
            .await?;

        let mut outcome = DispatchOutcome::default();
        for row in due {
            outcome.examined += 1;
            if let Err(e) = self.dispatch_row(row, now, &mut outcome).await {
                // A row-level error is recorded on the row itself; only
                // datastore failures propagate out of dispatch_row.
                tracing::error!("Dispatch pass aborted: {e}");
                return Err(e);
            }
        }

        tracing::info!(
            examined = outcome.examined,
            sent = outcome.sent,
            cancelled = outcome.cancelled,
            retried = outcome.retried,
            failed = outcome.failed,
            "Dispatch pass complete"
        );
        Ok(outcome)
    }

    /// A crashed worker leaves its reservation behind; rows stuck in
    /// Processing past the cutoff become Pending again.
    async fn recover_stale_reservations(&self, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - Duration::minutes(STALE_PROCESSING_MINUTES);
        let reset = scheduled_emails::Entity::update_many()
            .col_expr(
                scheduled_emails::Column::Status,
                Expr::value(ScheduledEmailStatus::Pending.to_string()),
            )
            .col_expr(scheduled_emails::Column::UpdatedAt, Expr::value(now))
            .filter(
                scheduled_emails::Column::Status
                    .eq(ScheduledEmailStatus::Processing.to_string()),
            )
            .filter(scheduled_emails::Column::LastAttemptAt.lt(cutoff))
            .exec(&*self.db)
            .await?;
        if reset.rows_affected > 0 {
            tracing::warn!(
                count = reset.rows_affected,
                "Recovered stale Processing reservations"
            );
        }
        Ok(())
    }

    async fn dispatch_row(
        &self,
        row: scheduled_emails::Model,
        now: DateTime<Utc>,
        outcome: &mut DispatchOutcome,
    ) -> Result<()> {
        // Reserve: Pending -> Processing, conditional on still being Pending.
        let reserved = scheduled_emails::Entity::update_many()
            .col_expr(
                scheduled_emails::Column::Status,
                Expr::value(ScheduledEmailStatus::Processing.to_string()),
            )
            .col_expr(
                scheduled_emails::Column::Attempts,
                Expr::col(scheduled_emails::Column::Attempts).add(1),
            )
            .col_expr(scheduled_emails::Column::LastAttemptAt, Expr::value(now))
            .col_expr(scheduled_emails::Column::UpdatedAt, Expr::value(now))
            .filter(scheduled_emails::Column::Id.eq(row.id.clone()))
            .filter(scheduled_emails::Column::Status.eq(ScheduledEmailStatus::Pending.to_string()))
            .exec(&*self.db)
            .await?;
        if reserved.rows_affected == 0 {
            tracing::debug!(scheduled_email_id = %row.id, "Lost reservation race, skipping");
            return Ok(());
        }

        let row = scheduled_emails::Entity::find_by_id(row.id.clone())
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailDripError::invalid(format!("Reserved row {} vanished", row.id)))?;

        // Final recency suppression happens before any EmailLog exists, so
        // a cancelled row leaves no log behind.
        if verifier::template_recently_sent(&self.db, &row.template_id, &row.recipient_email, now)
            .await?
        {
            verifier::cancel_row(&self.db, row, verifier::RECENCY_CANCEL_REASON, now).await?;
            outcome.cancelled += 1;
            return Ok(());
        }

        let template = email_templates::Entity::find_by_id(row.template_id.clone())
            .one(&*self.db)
            .await?;
        let Some(template) = template else {
            self.fail_terminally(row, "Template no longer exists", now)
                .await?;
            outcome.failed += 1;
            return Ok(());
        };

        let account = accounts::Entity::find_by_id(row.account_id.clone())
            .one(&*self.db)
            .await?;
        let owner = owners::Entity::find_by_id(row.owner_id.clone())
            .one(&*self.db)
            .await?;

        // The log is created Queued before the provider call so every
        // attempt is visible even if we crash mid-send.
        let mut log = email_logs::ActiveModel::new();
        log.owner_id = Set(row.owner_id.clone());
        log.account_id = Set(Some(row.account_id.clone()));
        log.template_id = Set(Some(row.template_id.clone()));
        log.to_email = Set(row.recipient_email.clone());
        log.to_name = Set(row.recipient_name.clone());
        log.from_email = Set(row.from_email.clone());
        log.from_name = Set(row.from_name.clone());
        log.subject = Set(row.subject.clone());
        log.queued_at = Set(now);
        let log = log.insert(&*self.db).await?;

        let email = self.build_outbound(&row, &template, account.as_ref(), owner.as_ref(), &log, now);
        let custom_message_id = email
            .headers
            .get("Message-ID")
            .cloned()
            .unwrap_or_default();

        match self.sendgrid.send(&email).await {
            Ok(send) => {
                let mut log_update: email_logs::ActiveModel = log.into();
                log_update.status = Set(EmailLogStatus::Sent.to_string());
                log_update.sent_at = Set(Some(now));
                log_update.message_id = Set(Some(send.message_id));
                log_update.custom_message_id = Set(Some(custom_message_id));
                log_update.reply_to = Set(email.reply_to.clone());
                let log = log_update.update(&*self.db).await?;

                let mut row_update: scheduled_emails::ActiveModel = row.into();
                row_update.status = Set(ScheduledEmailStatus::Sent.to_string());
                row_update.email_log_id = Set(Some(log.id));
                row_update.error_message = Set(None);
                row_update.updated_at = Set(now);
                row_update.update(&*self.db).await?;
                outcome.sent += 1;
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    scheduled_email_id = %row.id,
                    email_log_id = log.id,
                    "Send failed: {reason}"
                );

                let mut log_update: email_logs::ActiveModel = log.into();
                log_update.status = Set(EmailLogStatus::Failed.to_string());
                log_update.failed_at = Set(Some(now));
                log_update.error_message = Set(Some(reason.clone()));
                log_update.update(&*self.db).await?;

                let attempts = row.attempts;
                let max_attempts = row.max_attempts;
                let mut row_update: scheduled_emails::ActiveModel = row.into();
                if attempts < max_attempts {
                    // No backoff: the next dispatch tick is the retry delay.
                    row_update.status = Set(ScheduledEmailStatus::Pending.to_string());
                    row_update.error_message =
                        Set(Some(format!("Attempt {attempts}/{max_attempts}: {reason}")));
                    outcome.retried += 1;
                } else {
                    row_update.status = Set(ScheduledEmailStatus::Failed.to_string());
                    row_update.error_message = Set(Some(format!(
                        "Failed after {attempts} attempts: {reason}"
                    )));
                    outcome.failed += 1;
                }
                row_update.updated_at = Set(now);
                row_update.update(&*self.db).await?;
            }
        }

        Ok(())
    }

    fn build_outbound(
        &self,
        row: &scheduled_emails::Model,
        template: &email_templates::Model,
        account: Option<&accounts::Model>,
        owner: Option<&owners::Model>,
        log: &email_logs::Model,
        now: DateTime<Utc>,
    ) -> OutboundEmail {
        let ctx = MergeContext {
            scheduled: row,
            account,
            today: now.date_naive(),
        };

        let subject = merge::render_merge_fields(&row.subject, &ctx);
        let footer = merge::assemble_footer(
            owner,
            &self.config.unsubscribe_url,
            &row.id,
            &row.recipient_email,
        );
        let html_body = merge::append_footer(
            &merge::render_merge_fields(&template.html_content, &ctx),
            &footer,
        );
        let text_body = template
            .text_content
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| merge::render_merge_fields(t, &ctx));

        let from_domain = mime::email_domain(&row.from_email)
            .unwrap_or_else(|| "maildrip.local".to_string());
        let custom_message_id =
            format!("<isg-{}-{}@{}>", log.id, now.timestamp_millis(), from_domain);

        let mut headers = HashMap::new();
        headers.insert("Message-ID".to_string(), custom_message_id);

        let mut custom_args = HashMap::new();
        custom_args.insert("scheduled_email_id".to_string(), row.id.clone());
        if let Some(automation_id) = &row.automation_id {
            custom_args.insert("automation_id".to_string(), automation_id.clone());
        }
        custom_args.insert("account_id".to_string(), row.account_id.clone());
        custom_args.insert("owner_id".to_string(), row.owner_id.clone());
        custom_args.insert("email_log_id".to_string(), log.id.to_string());

        let mut categories = vec!["automation".to_string()];
        if let Some(category) = template.category.as_deref().filter(|c| !c.is_empty()) {
            categories.push(category.to_string());
        }

        OutboundEmail {
            to_email: row.recipient_email.clone(),
            to_name: row.recipient_name.clone(),
            from_email: row.from_email.clone(),
            from_name: row.from_name.clone(),
            // Direct replies go straight to the sender; inbound-parse
            // correlation rides on the Message-ID header instead.
            reply_to: Some(row.from_email.clone()),
            subject,
            html_body,
            text_body,
            headers,
            custom_args,
            categories,
        }
    }

    async fn fail_terminally(
        &self,
        row: scheduled_emails::Model,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut update: scheduled_emails::ActiveModel = row.into();
        update.status = Set(ScheduledEmailStatus::Failed.to_string());
        update.error_message = Set(Some(reason.to_string()));
        update.updated_at = Set(now);
        update.update(&*self.db).await?;
        Ok(())
    }
}
