use axum::{
    extract::{Multipart, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use serde_json::{json, Value};

use crate::database::{email_logs, email_replies, sender_domains};
use crate::error::Result;
use crate::mail::mime;
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/inbound", post(receive_inbound))
}

/// The inbound-parse webhook's multipart fields, flattened.
#[derive(Debug, Default, Clone)]
pub struct InboundEmail {
    pub to: String,
    pub from: String,
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    /// Raw header block as forwarded by the parse webhook.
    pub headers: Option<String>,
    /// Full MIME envelope, present when the webhook is configured to send
    /// the raw message.
    pub raw_email: Option<String>,
}

/// Always 2xx; a correlation miss reports `success: false` in the body so
/// the provider does not retry.
async fn receive_inbound(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut inbound = InboundEmail::default();
    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or_default().to_string();
        let value = field.text().await.unwrap_or_default();
        match name.as_str() {
            "to" => inbound.to = value,
            "from" => inbound.from = value,
            "subject" => inbound.subject = Some(value),
            "text" => inbound.text = Some(value),
            "html" => inbound.html = Some(value),
            "headers" => inbound.headers = Some(value),
            "email" => inbound.raw_email = Some(value),
            _ => {}
        }
    }

    match process_inbound(&state, inbound, Utc::now()).await {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => {
            tracing::error!("Failed to process inbound message: {e}");
            (StatusCode::OK, Json(json!({ "success": false })))
        }
    }
}

pub async fn process_inbound(
    state: &AppState,
    inbound: InboundEmail,
    now: DateTime<Utc>,
) -> Result<Value> {
    let header_map = inbound
        .headers
        .as_deref()
        .map(mime::parse_headers)
        .or_else(|| inbound.raw_email.as_deref().map(mime::parse_headers))
        .unwrap_or_default();

    let in_reply_to = header_map.get("in-reply-to").cloned();
    let references = header_map.get("references").cloned();

    let (from_name, from_email) = mime::parse_address(&inbound.from);
    let (_, to_email) = mime::parse_address(&inbound.to);

    let (mut body_text, mut body_html) = (inbound.text.clone(), inbound.html.clone());
    if body_text.is_none() && body_html.is_none() {
        if let Some(raw) = &inbound.raw_email {
            let (text, html) = mime::extract_bodies(raw);
            body_text = text;
            body_html = html;
        }
    }

    let log = correlate(state, &inbound.to, in_reply_to.as_deref()).await?;

    let owner_id = match &log {
        Some(log) => Some(log.owner_id.clone()),
        None => owner_from_domain(state, &to_email).await?,
    };
    let Some(owner_id) = owner_id else {
        tracing::info!(to = %inbound.to, "Inbound message matched no owner");
        return Ok(json!({
            "success": false,
            "message": "No matching owner for inbound message",
        }));
    };

    let (sender_verified, verification_notes, expected_sender_email) = match &log {
        Some(log) => {
            let expected = log.to_email.clone();
            if from_email.eq_ignore_ascii_case(&expected) {
                (true, "Exact email match".to_string(), Some(expected))
            } else if mime::email_domain(&from_email) == mime::email_domain(&expected) {
                (
                    false,
                    "Domain matches but sender differs from original recipient".to_string(),
                    Some(expected),
                )
            } else {
                (
                    false,
                    "Sender does not match original recipient".to_string(),
                    Some(expected),
                )
            }
        }
        None => (
            false,
            "No originating send matched".to_string(),
            None,
        ),
    };

    let mut reply = email_replies::ActiveModel::new();
    reply.owner_id = Set(owner_id.clone());
    reply.email_log_id = Set(log.as_ref().map(|l| l.id));
    reply.account_id = Set(log.as_ref().and_then(|l| l.account_id.clone()));
    reply.from_email = Set(from_email.clone());
    reply.from_name = Set(from_name);
    reply.to_email = Set(to_email);
    reply.subject = Set(inbound.subject.clone());
    reply.body_text = Set(body_text);
    reply.body_html = Set(body_html);
    reply.in_reply_to = Set(in_reply_to);
    reply.references_header = Set(references);
    reply.raw_headers = Set(serde_json::to_string(&header_map).ok());
    reply.received_at = Set(now);
    reply.sender_verified = Set(sender_verified);
    reply.expected_sender_email = Set(expected_sender_email);
    reply.verification_notes = Set(Some(verification_notes));
    let reply = reply.insert(&*state.db).await?;

    // Reply stats on the parent log are maintained here rather than by a
    // datastore trigger.
    if let Some(log) = &log {
        let mut update: email_logs::ActiveModel = log.clone().into();
        update.reply_count = Set(log.reply_count + 1);
        update.last_reply_at = Set(Some(now));
        update.update(&*state.db).await?;
    }

    let outcome = state.injector.inject_reply(&reply, log.as_ref(), now).await;
    let mut reply_update: email_replies::ActiveModel = reply.clone().into();
    reply_update.inbox_injected = Set(outcome.injected);
    reply_update.inbox_injected_at = Set(outcome.injected.then_some(now));
    reply_update.inbox_injection_provider = Set(outcome.provider.clone());
    reply_update.inbox_injection_error = Set(outcome.error.clone());
    reply_update.update(&*state.db).await?;

    Ok(json!({
        "success": true,
        "reply_id": reply.id,
        "email_log_id": log.map(|l| l.id),
        "inbox_injected": outcome.injected,
        "inbox_injection_provider": outcome.provider,
    }))
}

/// Correlation ladder: plus-addressed envelope, then the minted
/// Message-ID against In-Reply-To, then the log id embedded in it.
async fn correlate(
    state: &AppState,
    to: &str,
    in_reply_to: Option<&str>,
) -> Result<Option<email_logs::Model>> {
    if let Some(log_id) = mime::parse_reply_address_log_id(to) {
        if let Some(log) = email_logs::Entity::find_by_id(log_id).one(&*state.db).await? {
            return Ok(Some(log));
        }
    }

    if let Some(irt) = in_reply_to.map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(log) = email_logs::Entity::find()
            .filter(email_logs::Column::CustomMessageId.eq(irt))
            .one(&*state.db)
            .await?
        {
            return Ok(Some(log));
        }

        if let Some(log_id) = mime::extract_embedded_log_id(irt) {
            if let Some(log) = email_logs::Entity::find_by_id(log_id).one(&*state.db).await? {
                return Ok(Some(log));
            }
        }
    }

    Ok(None)
}

/// Last resort: an inbound-parse-enabled sender domain identifies the
/// owner, with no specific send to attach to.
async fn owner_from_domain(state: &AppState, to_email: &str) -> Result<Option<String>> {
    let Some(domain) = mime::email_domain(to_email) else {
        return Ok(None);
    };
    let row = sender_domains::Entity::find()
        .filter(sender_domains::Column::Domain.eq(domain))
        .filter(sender_domains::Column::InboundParseEnabled.eq(true))
        .one(&*state.db)
        .await?;
    Ok(row.map(|d| d.owner_id))
}
