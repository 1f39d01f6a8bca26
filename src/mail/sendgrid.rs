use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{MailDripError, Result};

const SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const VALIDATION_URL: &str = "https://api.sendgrid.com/v3/validations/email";

/// One outbound message for the dispatch API. Everything is a snapshot:
/// the client does no lookups of its own.
#[derive(Debug, Clone, Default)]
pub struct OutboundEmail {
    pub to_email: String,
    pub to_name: Option<String>,
    pub from_email: String,
    pub from_name: Option<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    /// Extra headers, notably the minted Message-ID.
    pub headers: HashMap<String, String>,
    pub custom_args: HashMap<String, String>,
    pub categories: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message_id: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressValidation {
    /// valid | risky | invalid
    pub status: String,
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub details: Option<String>,
}

pub struct SendGridClient {
    http: reqwest::Client,
    api_key: Option<String>,
    validation_key: Option<String>,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl SendGridClient {
    pub fn new(
        api_key: Option<String>,
        validation_key: Option<String>,
        rate_limit_per_minute: u32,
        burst_limit: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let per_minute = NonZeroU32::new(rate_limit_per_minute.max(1))
            .ok_or_else(|| MailDripError::config("Send rate limit must be positive"))?;
        let burst = NonZeroU32::new(burst_limit.max(1))
            .ok_or_else(|| MailDripError::config("Send burst limit must be positive"))?;
        let quota = Quota::per_minute(per_minute).allow_burst(burst);
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Ok(Self {
            http,
            api_key,
            validation_key,
            rate_limiter,
        })
    }

    /// Without an API key every send is simulated: the payload is built and
    /// logged, a synthetic message id comes back, and callers advance their
    /// state machines as if the provider accepted the message.
    pub fn is_dry_run(&self) -> bool {
        self.api_key.is_none()
    }

    pub async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome> {
        let payload = build_payload(email);

        let Some(api_key) = &self.api_key else {
            tracing::info!(
                to = %email.to_email,
                subject = %email.subject,
                "Dry-run send (no SENDGRID_API_KEY)"
            );
            return Ok(SendOutcome {
                message_id: format!("dry-run-{}", Uuid::new_v4()),
                dry_run: true,
            });
        };

        self.rate_limiter.until_ready().await;

        let response = self
            .http
            .post(SEND_URL)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MailDripError::provider(format!("Send request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailDripError::provider(format!(
                "Mail service returned {status}: {body}"
            )));
        }

        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| format!("sg-{}", Uuid::new_v4()));

        tracing::debug!(to = %email.to_email, message_id = %message_id, "Email accepted by provider");

        Ok(SendOutcome {
            message_id,
            dry_run: false,
        })
    }

    /// Checks one address against the validation API. `Ok(None)` means the
    /// validation key is not configured.
    pub async fn validate_address(&self, email: &str) -> Result<Option<AddressValidation>> {
        let Some(key) = &self.validation_key else {
            return Ok(None);
        };

        let response = self
            .http
            .post(VALIDATION_URL)
            .bearer_auth(key)
            .json(&serde_json::json!({ "email": email, "source": "automation" }))
            .send()
            .await
            .map_err(|e| MailDripError::provider(format!("Validation request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailDripError::provider(format!(
                "Validation API returned {status}: {body}"
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let result = body.get("result").cloned().unwrap_or_default();
        let verdict = result
            .get("verdict")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_lowercase();
        let status = match verdict.as_str() {
            "valid" => "valid",
            "risky" => "risky",
            "invalid" => "invalid",
            _ => "unknown",
        };

        Ok(Some(AddressValidation {
            status: status.to_string(),
            score: result.get("score").and_then(|v| v.as_f64()),
            reason: result
                .get("suggestion")
                .or_else(|| result.get("reason"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            details: serde_json::to_string(&result).ok(),
        }))
    }
}

fn build_payload(email: &OutboundEmail) -> serde_json::Value {
    let mut to = serde_json::json!({ "email": email.to_email });
    if let Some(name) = &email.to_name {
        to["name"] = serde_json::json!(name);
    }

    let mut from = serde_json::json!({ "email": email.from_email });
    if let Some(name) = &email.from_name {
        from["name"] = serde_json::json!(name);
    }

    let mut content = Vec::new();
    if let Some(text) = &email.text_body {
        content.push(serde_json::json!({ "type": "text/plain", "value": text }));
    }
    content.push(serde_json::json!({ "type": "text/html", "value": email.html_body }));

    let mut payload = serde_json::json!({
        "personalizations": [{ "to": [to], "custom_args": email.custom_args }],
        "from": from,
        "subject": email.subject,
        "content": content,
        "headers": email.headers,
        "tracking_settings": {
            "click_tracking": { "enable": true },
            "open_tracking": { "enable": true }
        },
        "categories": email.categories,
    });

    if let Some(reply_to) = &email.reply_to {
        payload["reply_to"] = serde_json::json!({ "email": reply_to });
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_headers_and_custom_args() {
        let mut email = OutboundEmail {
            to_email: "kim@hartley.example".to_string(),
            to_name: Some("Kim".to_string()),
            from_email: "agent@agency.example".to_string(),
            reply_to: Some("agent@agency.example".to_string()),
            subject: "Renewal".to_string(),
            html_body: "<p>hi</p>".to_string(),
            text_body: Some("hi".to_string()),
            ..Default::default()
        };
        email
            .headers
            .insert("Message-ID".to_string(), "<isg-1-2@x>".to_string());
        email
            .custom_args
            .insert("email_log_id".to_string(), "1".to_string());
        email.categories.push("automation".to_string());

        let payload = build_payload(&email);
        assert_eq!(payload["headers"]["Message-ID"], "<isg-1-2@x>");
        assert_eq!(
            payload["personalizations"][0]["custom_args"]["email_log_id"],
            "1"
        );
        assert_eq!(payload["content"][0]["type"], "text/plain");
        assert_eq!(payload["content"][1]["type"], "text/html");
        assert_eq!(payload["reply_to"]["email"], "agent@agency.example");
        assert_eq!(payload["tracking_settings"]["open_tracking"]["enable"], true);
    }

    #[tokio::test]
    async fn dry_run_returns_synthetic_message_id() {
        let client = SendGridClient::new(None, None, 60, 10).unwrap();
        assert!(client.is_dry_run());

        let outcome = client
            .send(&OutboundEmail {
                to_email: "kim@hartley.example".to_string(),
                from_email: "agent@agency.example".to_string(),
                subject: "x".to_string(),
                html_body: "<p>x</p>".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outcome.dry_run);
        assert!(outcome.message_id.starts_with("dry-run-"));
    }
}
