use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::crypto::TokenVault;
use crate::database::{email_logs, email_replies, owners, provider_connections, sender_domains};
use crate::error::{MailDripError, Result};
use crate::mail::{OutboundEmail, SendGridClient};
use crate::oauth::{MailProvider, OAuthClient};

const GMAIL_INSERT_URL: &str =
    "https://gmail.googleapis.com/gmail/v1/users/me/messages?internalDateSource=dateHeader";
const GRAPH_INBOX_URL: &str = "https://graph.microsoft.com/v1.0/me/mailFolders/inbox/messages";

pub const FALLBACK_PROVIDER: &str = "sendgrid_fallback";

#[derive(Debug, Default, Clone)]
pub struct InjectionOutcome {
    pub injected: bool,
    pub provider: Option<String>,
    pub error: Option<String>,
}

/// Best-effort delivery of a stored reply into the owner's real mailbox.
/// Every failure cascades to the service-forward fallback; only when that
/// also fails does the outcome carry an error.
pub struct InboxInjector {
    db: Arc<DatabaseConnection>,
    vault: Option<Arc<TokenVault>>,
    oauth: Arc<OAuthClient>,
    sendgrid: Arc<SendGridClient>,
    config: Arc<Config>,
    http: reqwest::Client,
}

impl InboxInjector {
    pub fn new(
        db: Arc<DatabaseConnection>,
        vault: Option<Arc<TokenVault>>,
        oauth: Arc<OAuthClient>,
        sendgrid: Arc<SendGridClient>,
        config: Arc<Config>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            db,
            vault,
            oauth,
            sendgrid,
            config,
            http,
        })
    }

    pub async fn inject_reply(
        &self,
        reply: &email_replies::Model,
        log: Option<&email_logs::Model>,
        now: DateTime<Utc>,
    ) -> InjectionOutcome {
        let owner = match owners::Entity::find_by_id(reply.owner_id.clone())
            .one(&*self.db)
            .await
        {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                return InjectionOutcome {
                    injected: false,
                    provider: None,
                    error: Some(format!("Owner {} not found", reply.owner_id)),
                }
            }
            Err(e) => {
                return InjectionOutcome {
                    injected: false,
                    provider: None,
                    error: Some(format!("Owner lookup failed: {e}")),
                }
            }
        };

        match self.inject_via_provider(reply, &owner, now).await {
            Ok(provider) => InjectionOutcome {
                injected: true,
                provider: Some(provider.as_str().to_string()),
                error: None,
            },
            Err(e) => {
                tracing::info!(
                    reply_id = %reply.id,
                    "Inbox injection unavailable ({e}), using service-forward fallback"
                );
                match self.forward_via_service(reply, log, &owner).await {
                    Ok(()) => InjectionOutcome {
                        injected: true,
                        provider: Some(FALLBACK_PROVIDER.to_string()),
                        error: None,
                    },
                    Err(forward_err) => InjectionOutcome {
                        injected: false,
                        provider: None,
                        error: Some(format!("{e}; fallback failed: {forward_err}")),
                    },
                }
            }
        }
    }

    async fn inject_via_provider(
        &self,
        reply: &email_replies::Model,
        owner: &owners::Model,
        now: DateTime<Utc>,
    ) -> Result<MailProvider> {
        let connection = provider_connections::Entity::find()
            .filter(provider_connections::Column::OwnerId.eq(owner.id.clone()))
            .filter(provider_connections::Column::Status.eq("active"))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                MailDripError::provider("No active mailbox connection".to_string())
            })?;

        let provider = MailProvider::parse(&connection.provider).ok_or_else(|| {
            MailDripError::provider(format!("Unknown provider {}", connection.provider))
        })?;

        let vault = self
            .vault
            .as_ref()
            .ok_or_else(|| MailDripError::Crypto("Encryption key unavailable".to_string()))?;

        let mut access_token = vault.decrypt(&connection.access_token_encrypted)?;

        let expired = connection
            .token_expires_at
            .map(|expires| expires < now)
            .unwrap_or(false);
        if expired {
            access_token = self
                .refresh_connection(&connection, provider, vault, now)
                .await?;
        }

        let result = match provider {
            MailProvider::Gmail => self.inject_gmail(&access_token, reply, now).await,
            MailProvider::Microsoft => self.inject_microsoft(&access_token, reply).await,
        };

        match result {
            Ok(()) => {
                let mut update: provider_connections::ActiveModel = connection.into();
                update.last_used_at = Set(Some(now));
                update.updated_at = Set(now);
                update.update(&*self.db).await?;
                Ok(provider)
            }
            Err(e) => Err(e),
        }
    }

    /// Refreshes an expired access token (10 s bound inside the OAuth
    /// client). A refresh failure flips the connection to `expired` so the
    /// UI can prompt for a reconnect.
    async fn refresh_connection(
        &self,
        connection: &provider_connections::Model,
        provider: MailProvider,
        vault: &TokenVault,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let refresh_encrypted = connection.refresh_token_encrypted.as_ref().ok_or_else(|| {
            MailDripError::oauth("Connection has no refresh token".to_string())
        })?;
        let refresh_token = vault.decrypt(refresh_encrypted)?;

        match self.oauth.refresh(provider, &refresh_token).await {
            Ok(tokens) => {
                let mut update: provider_connections::ActiveModel = connection.clone().into();
                update.access_token_encrypted = Set(vault.encrypt(&tokens.access_token)?);
                if let Some(new_refresh) = &tokens.refresh_token {
                    update.refresh_token_encrypted = Set(Some(vault.encrypt(new_refresh)?));
                }
                update.token_expires_at = Set(tokens
                    .expires_in
                    .map(|secs| now + chrono::Duration::seconds(secs as i64)));
                update.status = Set("active".to_string());
                update.last_error = Set(None);
                update.updated_at = Set(now);
                update.update(&*self.db).await?;
                Ok(tokens.access_token)
            }
            Err(e) => {
                let mut update: provider_connections::ActiveModel = connection.clone().into();
                update.status = Set("expired".to_string());
                update.last_error = Set(Some(e.to_string()));
                update.updated_at = Set(now);
                update.update(&*self.db).await?;
                Err(e)
            }
        }
    }

    async fn inject_gmail(
        &self,
        access_token: &str,
        reply: &email_replies::Model,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let body = reply_body_html(reply);
        let from_display = match &reply.from_name {
            Some(name) => format!("\"{}\" <{}>", name.replace('"', ""), reply.from_email),
            None => format!("<{}>", reply.from_email),
        };
        let subject = reply.subject.clone().unwrap_or_else(|| "(no subject)".to_string());

        let rfc822 = format!(
            "From: {from_display}\r\nTo: me\r\nSubject: {subject}\r\nDate: {}\r\nReply-To: {from_display}\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{body}",
            now.to_rfc2822()
        );
        let raw = general_purpose::URL_SAFE_NO_PAD.encode(rfc822);

        let response = self
            .http
            .post(GMAIL_INSERT_URL)
            .bearer_auth(access_token)
            .json(&serde_json::json!({
                "raw": raw,
                "labelIds": ["INBOX", "UNREAD"],
            }))
            .send()
            .await
            .map_err(|e| MailDripError::provider(format!("Gmail insert failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MailDripError::provider(format!(
                "Gmail insert returned {status}: {text}"
            )));
        }
        Ok(())
    }

    /// Graph will not honor an external `from`, so the message opens with a
    /// banner naming the true sender and `replyTo` points back at them.
    async fn inject_microsoft(
        &self,
        access_token: &str,
        reply: &email_replies::Model,
    ) -> Result<()> {
        let banner = sender_banner(reply);
        let content = format!("{banner}{}", reply_body_html(reply));
        let subject = reply.subject.clone().unwrap_or_else(|| "(no subject)".to_string());

        let mut reply_to = serde_json::json!({ "address": reply.from_email });
        if let Some(name) = &reply.from_name {
            reply_to["name"] = serde_json::json!(name);
        }

        let response = self
            .http
            .post(GRAPH_INBOX_URL)
            .bearer_auth(access_token)
            .json(&serde_json::json!({
                "subject": subject,
                "body": { "contentType": "html", "content": content },
                "replyTo": [{ "emailAddress": reply_to }],
                "isRead": false,
                "isDraft": false,
            }))
            .send()
            .await
            .map_err(|e| MailDripError::provider(format!("Graph insert failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MailDripError::provider(format!(
                "Graph insert returned {status}: {text}"
            )));
        }
        Ok(())
    }

    /// Courtesy forward through the outbound mail service. The owner reads
    /// the reply in their registered mailbox; hitting "Reply" goes to the
    /// contact because Reply-To is set to them.
    async fn forward_via_service(
        &self,
        reply: &email_replies::Model,
        log: Option<&email_logs::Model>,
        owner: &owners::Model,
    ) -> Result<()> {
        let from_email = match self.verified_domain(&owner.id).await? {
            Some(domain) => format!("replies@{domain}"),
            None => self.config.sendgrid_forward_from.clone(),
        };

        let raw_subject = reply.subject.clone().unwrap_or_else(|| "(no subject)".to_string());
        let subject = if raw_subject.to_lowercase().starts_with("re:") {
            raw_subject
        } else {
            format!("Re: {raw_subject}")
        };

        let original_subject = log.map(|l| l.subject.as_str()).unwrap_or("your email");
        let html_body = format!(
            "{}<p style=\"color:#666;font-size:12px;\">Replying to: {}</p><blockquote style=\"border-left:3px solid #ccc;margin:8px 0;padding-left:12px;\">{}</blockquote>",
            sender_banner(reply),
            html_escape::encode_text(original_subject),
            reply_body_html(reply),
        );

        let email = OutboundEmail {
            to_email: owner.email.clone(),
            to_name: owner.name.clone(),
            from_email,
            from_name: reply.from_name.clone(),
            reply_to: Some(reply.from_email.clone()),
            subject,
            html_body,
            text_body: reply.body_text.clone(),
            headers: Default::default(),
            custom_args: Default::default(),
            categories: vec!["reply-forward".to_string()],
        };

        self.sendgrid.send(&email).await.map(|_| ())
    }

    async fn verified_domain(&self, owner_id: &str) -> Result<Option<String>> {
        let domain = sender_domains::Entity::find()
            .filter(sender_domains::Column::OwnerId.eq(owner_id))
            .filter(sender_domains::Column::Status.eq("verified"))
            .one(&*self.db)
            .await?;
        Ok(domain.map(|d| d.domain))
    }
}

fn reply_body_html(reply: &email_replies::Model) -> String {
    if let Some(html) = reply.body_html.as_deref().filter(|h| !h.is_empty()) {
        return html.to_string();
    }
    let text = reply.body_text.as_deref().unwrap_or("");
    format!(
        "<pre style=\"font-family:inherit;white-space:pre-wrap;\">{}</pre>",
        html_escape::encode_text(text)
    )
}

fn sender_banner(reply: &email_replies::Model) -> String {
    let display = match &reply.from_name {
        Some(name) => format!("{name} <{}>", reply.from_email),
        None => reply.from_email.clone(),
    };
    format!(
        "<div style=\"background:#f4f6f8;border-left:4px solid #3b82f6;padding:8px 12px;margin-bottom:12px;font-size:13px;\">Reply from {}</div>",
        html_escape::encode_text(&display)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(html: Option<&str>, text: Option<&str>) -> email_replies::Model {
        email_replies::Model {
            id: "rep-1".to_string(),
            owner_id: "own-1".to_string(),
            email_log_id: Some(1),
            account_id: None,
            from_email: "kim@hartley.example".to_string(),
            from_name: Some("Kim <script>".to_string()),
            to_email: "agent@agency.example".to_string(),
            subject: Some("Re: Renewal".to_string()),
            body_text: text.map(str::to_string),
            body_html: html.map(str::to_string),
            in_reply_to: None,
            references_header: None,
            raw_headers: None,
            received_at: Utc::now(),
            sender_verified: true,
            expected_sender_email: None,
            verification_notes: None,
            inbox_injected: false,
            inbox_injected_at: None,
            inbox_injection_provider: None,
            inbox_injection_error: None,
        }
    }

    #[test]
    fn banner_escapes_sender_controlled_text() {
        let banner = sender_banner(&reply(None, Some("hi")));
        assert!(banner.contains("&lt;script&gt;"));
        assert!(!banner.contains("<script>"));
    }

    #[test]
    fn text_body_is_wrapped_and_escaped() {
        let body = reply_body_html(&reply(None, Some("a < b")));
        assert!(body.starts_with("<pre"));
        assert!(body.contains("a &lt; b"));
    }

    #[test]
    fn html_body_passes_through() {
        let body = reply_body_html(&reply(Some("<p>hello</p>"), None));
        assert_eq!(body, "<p>hello</p>");
    }
}
