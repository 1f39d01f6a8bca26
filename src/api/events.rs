use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection,
    EntityTrait, QueryFilter, Set,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::email_logs::EmailLogStatus;
use crate::database::{accounts, email_events, email_logs, suppressions, unsubscribes};
use crate::error::Result;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/events", post(receive_events))
}

/// One entry of the provider's event webhook batch. Unknown fields are
/// ignored wholesale.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub event: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    /// Bounce classification: `bounce` (hard) or `blocked`.
    #[serde(default, rename = "type")]
    pub classification: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub useragent: Option<String>,
}

/// Always 2xx: a failing event is logged and dropped, never bounced back
/// to the provider where it would trigger a retry storm.
async fn receive_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<ProviderEvent>>,
) -> (StatusCode, Json<Value>) {
    let mut processed = 0u32;
    for event in &events {
        match apply_event(&state.db, event).await {
            Ok(()) => processed += 1,
            Err(e) => {
                tracing::error!(event = %event.event, "Failed to apply delivery event: {e}");
            }
        }
    }
    (StatusCode::OK, Json(json!({ "processed": processed })))
}

pub async fn apply_event(db: &DatabaseConnection, event: &ProviderEvent) -> Result<()> {
    let event_type = event.event.as_str();
    if matches!(event_type, "deferred" | "processed") {
        tracing::debug!(event = event_type, "Informational event, no status change");
        return Ok(());
    }

    let occurred_at = event
        .timestamp
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let Some(raw_id) = event.sg_message_id.as_deref() else {
        tracing::debug!(event = event_type, "Event without sg_message_id, skipping");
        return Ok(());
    };
    // Anything after the first dot is a routing suffix.
    let normalized = raw_id.split('.').next().unwrap_or(raw_id);

    let Some(log) = find_log(db, raw_id, normalized).await? else {
        tracing::debug!(message_id = raw_id, "No email log for event, skipping");
        return Ok(());
    };

    let current = EmailLogStatus::from(log.status.clone());
    let mut update: email_logs::ActiveModel = log.clone().into();

    match event_type {
        "delivered" => {
            if current.can_advance_to(EmailLogStatus::Delivered) {
                update.status = Set(EmailLogStatus::Delivered.to_string());
            }
            update.delivered_at = Set(Some(occurred_at));
        }
        "open" => {
            update.open_count = Set(log.open_count + 1);
            if log.first_opened_at.is_none() {
                update.first_opened_at = Set(Some(occurred_at));
            }
            // Opens only upgrade Sent/Delivered; a click or terminal state
            // never regresses to Opened.
            if matches!(current, EmailLogStatus::Sent | EmailLogStatus::Delivered) {
                update.status = Set(EmailLogStatus::Opened.to_string());
            }
        }
        "click" => {
            update.click_count = Set(log.click_count + 1);
            if log.first_clicked_at.is_none() {
                update.first_clicked_at = Set(Some(occurred_at));
            }
            if current.can_advance_to(EmailLogStatus::Clicked) {
                update.status = Set(EmailLogStatus::Clicked.to_string());
            }

            let mut click = email_events::ActiveModel::new();
            click.email_log_id = Set(log.id);
            click.event_type = Set("click".to_string());
            click.url = Set(event.url.clone());
            click.ip = Set(event.ip.clone());
            click.useragent = Set(event.useragent.clone());
            click.occurred_at = Set(occurred_at);
            click.insert(db).await?;
        }
        "bounce" => {
            if current.can_advance_to(EmailLogStatus::Bounced) {
                update.status = Set(EmailLogStatus::Bounced.to_string());
            }
            update.bounced_at = Set(Some(occurred_at));
            update.bounce_type = Set(event.classification.clone());
            update.error_message = Set(event.reason.clone());

            // Hard bounces suppress the address; blocks are transient.
            if event.classification.as_deref() == Some("bounce") {
                if let Some(email) = &event.email {
                    add_suppression(db, email, Some("hard_bounce".to_string())).await?;
                }
            }
        }
        "dropped" => {
            if current.can_advance_to(EmailLogStatus::Dropped) {
                update.status = Set(EmailLogStatus::Dropped.to_string());
            }
            update.error_message = Set(event.reason.clone());
        }
        "spamreport" => {
            if current.can_advance_to(EmailLogStatus::SpamReport) {
                update.status = Set(EmailLogStatus::SpamReport.to_string());
            }
            if let Some(email) = &event.email {
                add_suppression(db, email, Some("spam_report".to_string())).await?;
            }
        }
        "unsubscribe" | "group_unsubscribe" => {
            if current.can_advance_to(EmailLogStatus::Unsubscribed) {
                update.status = Set(EmailLogStatus::Unsubscribed.to_string());
            }
            update.unsubscribed_at = Set(Some(occurred_at));

            if let Some(email) = &event.email {
                add_unsubscribe(db, email, Some(log.owner_id.clone()), Some(event_type.to_string()))
                    .await?;
                opt_out_matching_accounts(db, &log.owner_id, email).await?;
            }
        }
        other => {
            tracing::debug!(event = other, "Unrecognized event type, skipping");
            return Ok(());
        }
    }

    update.update(db).await?;
    Ok(())
}

/// Exact match first, then the suffix-stripped id, then treat the stored id
/// as a prefix of the reported one.
async fn find_log(
    db: &DatabaseConnection,
    raw_id: &str,
    normalized: &str,
) -> Result<Option<email_logs::Model>> {
    if let Some(log) = email_logs::Entity::find()
        .filter(email_logs::Column::MessageId.eq(raw_id))
        .one(db)
        .await?
    {
        return Ok(Some(log));
    }

    if normalized != raw_id {
        if let Some(log) = email_logs::Entity::find()
            .filter(email_logs::Column::MessageId.eq(normalized))
            .one(db)
            .await?
        {
            return Ok(Some(log));
        }
    }

    Ok(email_logs::Entity::find()
        .filter(email_logs::Column::MessageId.starts_with(normalized))
        .one(db)
        .await?)
}

/// Idempotent append: a case-insensitive duplicate is a no-op.
pub async fn add_suppression(
    db: &DatabaseConnection,
    email: &str,
    reason: Option<String>,
) -> Result<()> {
    let lowered = email.to_lowercase();
    let existing = suppressions::Entity::find()
        .filter(suppressions::Column::Email.eq(lowered.clone()))
        .one(db)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    let mut row = suppressions::ActiveModel::new();
    row.email = Set(lowered);
    row.reason = Set(reason);
    row.insert(db).await?;
    Ok(())
}

pub async fn add_unsubscribe(
    db: &DatabaseConnection,
    email: &str,
    owner_id: Option<String>,
    source: Option<String>,
) -> Result<()> {
    let lowered = email.to_lowercase();
    let existing = unsubscribes::Entity::find()
        .filter(unsubscribes::Column::Email.eq(lowered.clone()))
        .one(db)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    let mut row = unsubscribes::ActiveModel::new();
    row.email = Set(lowered);
    row.owner_id = Set(owner_id);
    row.source = Set(source);
    row.insert(db).await?;
    Ok(())
}

async fn opt_out_matching_accounts(
    db: &DatabaseConnection,
    owner_id: &str,
    email: &str,
) -> Result<()> {
    let lowered = email.to_lowercase();
    accounts::Entity::update_many()
        .col_expr(accounts::Column::OptedOut, Expr::value(true))
        .filter(accounts::Column::OwnerId.eq(owner_id))
        .filter(
            Condition::any()
                .add(
                    Expr::expr(Func::lower(Expr::col(accounts::Column::PersonEmail)))
                        .eq(lowered.clone()),
                )
                .add(Expr::expr(Func::lower(Expr::col(accounts::Column::Email))).eq(lowered)),
        )
        .exec(db)
        .await?;
    Ok(())
}
