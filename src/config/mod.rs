use crate::error::MailDripError;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub sendgrid_api_key: Option<String>,
    pub sendgrid_validation_key: Option<String>,
    /// From-address for service-forward fallback when no verified sender
    /// domain exists for the owner.
    pub sendgrid_forward_from: String,
    pub frontend_url: String,
    pub unsubscribe_url: String,
    /// Base URL that the provider redirects back to; the per-provider
    /// callback path is appended as `/{provider}/callback`.
    pub oauth_redirect_base: String,
    pub google_oauth: Option<OAuthProviderConfig>,
    pub microsoft_oauth: Option<OAuthProviderConfig>,
    /// Interval for the built-in verify+send ticker. 0 disables it.
    pub tick_seconds: u64,
    pub send_rate_limit_per_minute: u32,
    pub send_burst_limit: u32,
}

#[derive(Clone, Debug)]
pub struct OAuthProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Microsoft only; Google ignores it.
    pub tenant_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, MailDripError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/maildrip.db?mode=rwc".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3800".to_string())
            .parse()
            .map_err(|_| MailDripError::Config("Invalid PORT value".to_string()))?;

        // Ensure data directory exists
        if let Some(db_path_str) = database_url.strip_prefix("sqlite:") {
            if let Some(db_path) = db_path_str.split('?').next() {
                if db_path != ":memory:" {
                    if let Some(parent) = std::path::Path::new(db_path).parent() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            MailDripError::Config(format!("Failed to create data directory: {e}"))
                        })?;
                    }
                }
            }
        }

        let sendgrid_api_key = env::var("SENDGRID_API_KEY").ok().filter(|k| !k.is_empty());
        if sendgrid_api_key.is_none() {
            tracing::warn!("SENDGRID_API_KEY not set - dispatcher runs in dry-run mode");
        }

        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| format!("http://localhost:{port}"));
        let unsubscribe_url = env::var("UNSUBSCRIBE_URL")
            .unwrap_or_else(|_| format!("{frontend_url}/unsubscribe"));
        let oauth_redirect_base = env::var("OAUTH_REDIRECT_BASE")
            .unwrap_or_else(|_| format!("http://localhost:{port}/email-oauth"));

        let google_oauth = if let (Ok(client_id), Ok(client_secret)) = (
            env::var("GOOGLE_CLIENT_ID"),
            env::var("GOOGLE_CLIENT_SECRET"),
        ) {
            Some(OAuthProviderConfig {
                client_id,
                client_secret,
                tenant_id: None,
            })
        } else {
            tracing::info!("Google OAuth not configured - Gmail inbox injection unavailable");
            None
        };

        let microsoft_oauth = if let (Ok(client_id), Ok(client_secret)) = (
            env::var("MICROSOFT_CLIENT_ID"),
            env::var("MICROSOFT_CLIENT_SECRET"),
        ) {
            Some(OAuthProviderConfig {
                client_id,
                client_secret,
                tenant_id: Some(
                    env::var("MICROSOFT_TENANT_ID").unwrap_or_else(|_| "common".to_string()),
                ),
            })
        } else {
            tracing::info!("Microsoft OAuth not configured - Outlook inbox injection unavailable");
            None
        };

        let tick_seconds = env::var("MAILDRIP_TICK_SECONDS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| MailDripError::Config("Invalid MAILDRIP_TICK_SECONDS value".to_string()))?;

        let send_rate_limit_per_minute = env::var("SEND_RATE_LIMIT_PER_MINUTE")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                MailDripError::Config("Invalid SEND_RATE_LIMIT_PER_MINUTE value".to_string())
            })?;
        let send_burst_limit = env::var("SEND_BURST_LIMIT")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| MailDripError::Config("Invalid SEND_BURST_LIMIT value".to_string()))?;

        Ok(Config {
            database_url,
            port,
            sendgrid_api_key,
            sendgrid_validation_key: env::var("SENDGRID_VALIDATION_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            sendgrid_forward_from: env::var("SENDGRID_FORWARD_FROM")
                .unwrap_or_else(|_| "replies@maildrip.io".to_string()),
            frontend_url,
            unsubscribe_url,
            oauth_redirect_base,
            google_oauth,
            microsoft_oauth,
            tick_seconds,
            send_rate_limit_per_minute,
            send_burst_limit,
        })
    }
}
