use base64::{engine::general_purpose, Engine as _};
use oauth2::{
    basic::BasicClient, reqwest::async_http_client, AuthUrl, AuthorizationCode, ClientId,
    ClientSecret, CsrfToken, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::{Config, OAuthProviderConfig};
use crate::error::{MailDripError, Result};

/// The two mailbox providers a reply can be injected into. Everything above
/// the injector is provider-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    Gmail,
    Microsoft,
}

impl MailProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailProvider::Gmail => "gmail",
            MailProvider::Microsoft => "microsoft",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gmail" | "google" => Some(MailProvider::Gmail),
            "microsoft" | "outlook" => Some(MailProvider::Microsoft),
            _ => None,
        }
    }
}

impl std::fmt::Display for MailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUserInfo {
    pub provider_user_id: String,
    pub email: String,
}

/// Round-trips through the provider's `state` parameter as an opaque
/// base64url JSON blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthState {
    pub owner_id: String,
    pub redirect_after: String,
}

impl OAuthState {
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(general_purpose::URL_SAFE_NO_PAD.encode(json))
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(raw)
            .map_err(|e| MailDripError::oauth(format!("Invalid state parameter: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Stateless OAuth adapter pair. Token exchange and refresh go through the
/// `oauth2` crate; userinfo and revoke are plain HTTP. The client never
/// touches the datastore.
pub struct OAuthClient {
    http: reqwest::Client,
    google: Option<OAuthProviderConfig>,
    microsoft: Option<OAuthProviderConfig>,
    redirect_base: String,
}

impl OAuthClient {
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            google: config.google_oauth.clone(),
            microsoft: config.microsoft_oauth.clone(),
            redirect_base: config.oauth_redirect_base.trim_end_matches('/').to_string(),
        })
    }

    pub fn is_configured(&self, provider: MailProvider) -> bool {
        match provider {
            MailProvider::Gmail => self.google.is_some(),
            MailProvider::Microsoft => self.microsoft.is_some(),
        }
    }

    /// Path-based, never query-string: `{base}/{provider}/callback`.
    pub fn redirect_uri(&self, provider: MailProvider) -> String {
        format!("{}/{}/callback", self.redirect_base, provider.as_str())
    }

    fn provider_config(&self, provider: MailProvider) -> Result<&OAuthProviderConfig> {
        match provider {
            MailProvider::Gmail => self.google.as_ref(),
            MailProvider::Microsoft => self.microsoft.as_ref(),
        }
        .ok_or_else(|| MailDripError::oauth(format!("{provider} OAuth is not configured")))
    }

    fn basic_client(&self, provider: MailProvider) -> Result<BasicClient> {
        let config = self.provider_config(provider)?;

        let (auth_url, token_url) = match provider {
            MailProvider::Gmail => (
                "https://accounts.google.com/o/oauth2/auth".to_string(),
                "https://oauth2.googleapis.com/token".to_string(),
            ),
            MailProvider::Microsoft => {
                let tenant = config.tenant_id.as_deref().unwrap_or("common");
                (
                    format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"),
                    format!("https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"),
                )
            }
        };

        let auth_url = AuthUrl::new(auth_url)
            .map_err(|e| MailDripError::oauth(format!("Invalid auth URL: {e}")))?;
        let token_url = TokenUrl::new(token_url)
            .map_err(|e| MailDripError::oauth(format!("Invalid token URL: {e}")))?;
        let redirect_url = RedirectUrl::new(self.redirect_uri(provider))
            .map_err(|e| MailDripError::oauth(format!("Invalid redirect URL: {e}")))?;

        Ok(BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            auth_url,
            Some(token_url),
        )
        .set_redirect_uri(redirect_url))
    }

    /// Authorization URL carrying the opaque state blob. Google gets
    /// offline access with forced consent so a refresh token always comes
    /// back; Microsoft's `offline_access` scope does the same.
    pub fn authorization_url(&self, provider: MailProvider, state: &OAuthState) -> Result<String> {
        let client = self.basic_client(provider)?;
        let encoded_state = state.encode()?;

        let mut request = client.authorize_url(|| CsrfToken::new(encoded_state));

        request = match provider {
            MailProvider::Gmail => request
                .add_scope(Scope::new("openid".to_string()))
                .add_scope(Scope::new("email".to_string()))
                .add_scope(Scope::new(
                    "https://www.googleapis.com/auth/gmail.insert".to_string(),
                ))
                .add_extra_param("access_type", "offline")
                .add_extra_param("prompt", "consent"),
            MailProvider::Microsoft => request
                .add_scope(Scope::new("offline_access".to_string()))
                .add_scope(Scope::new("User.Read".to_string()))
                .add_scope(Scope::new("Mail.ReadWrite".to_string())),
        };

        let (url, _) = request.url();
        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, provider: MailProvider, code: &str) -> Result<TokenSet> {
        let client = self.basic_client(provider)?;

        let response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| MailDripError::oauth(format!("Failed to exchange OAuth code: {e}")))?;

        Ok(token_set_from_response(&response))
    }

    pub async fn refresh(&self, provider: MailProvider, refresh_token: &str) -> Result<TokenSet> {
        let client = self.basic_client(provider)?;

        let response = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| MailDripError::oauth(format!("Failed to refresh token: {e}")))?;

        Ok(token_set_from_response(&response))
    }

    pub async fn userinfo(
        &self,
        provider: MailProvider,
        access_token: &str,
    ) -> Result<ProviderUserInfo> {
        let url = match provider {
            MailProvider::Gmail => "https://www.googleapis.com/oauth2/v2/userinfo",
            MailProvider::Microsoft => "https://graph.microsoft.com/v1.0/me",
        };

        let response = self
            .http
            .get(url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| MailDripError::oauth(format!("Failed to fetch user info: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MailDripError::oauth(format!(
                "Userinfo endpoint returned {status}: {text}"
            )));
        }

        let body: serde_json::Value = response.json().await?;

        let (id, email) = match provider {
            MailProvider::Gmail => (
                body.get("id").and_then(|v| v.as_str()),
                body.get("email").and_then(|v| v.as_str()),
            ),
            MailProvider::Microsoft => (
                body.get("id").and_then(|v| v.as_str()),
                body.get("mail")
                    .and_then(|v| v.as_str())
                    .or_else(|| body.get("userPrincipalName").and_then(|v| v.as_str())),
            ),
        };

        match (id, email) {
            (Some(id), Some(email)) => Ok(ProviderUserInfo {
                provider_user_id: id.to_string(),
                email: email.to_string(),
            }),
            _ => Err(MailDripError::oauth(
                "Userinfo response missing id or email".to_string(),
            )),
        }
    }

    /// Best-effort revocation; failures are logged, never surfaced.
    pub async fn revoke(&self, provider: MailProvider, access_token: &str) {
        match provider {
            MailProvider::Gmail => {
                let result = self
                    .http
                    .post("https://oauth2.googleapis.com/revoke")
                    .form(&[("token", access_token)])
                    .send()
                    .await;
                if let Err(e) = result {
                    tracing::debug!("Google token revocation failed: {e}");
                }
            }
            MailProvider::Microsoft => {
                // Graph has no single-token revoke; the connection row removal
                // is the effective disconnect.
                tracing::debug!("Microsoft token revocation skipped");
            }
        }
    }
}

fn token_set_from_response(
    response: &oauth2::basic::BasicTokenResponse,
) -> TokenSet {
    TokenSet {
        access_token: response.access_token().secret().clone(),
        refresh_token: response.refresh_token().map(|t| t.secret().clone()),
        expires_in: response.expires_in().map(|d| d.as_secs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_blob_roundtrip() {
        let state = OAuthState {
            owner_id: "own-1".to_string(),
            redirect_after: "/settings/mailbox".to_string(),
        };
        let encoded = state.encode().unwrap();
        // opaque: no raw JSON punctuation leaks into the query string
        assert!(!encoded.contains('{'));
        assert_eq!(OAuthState::decode(&encoded).unwrap(), state);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(OAuthState::decode("not base64 !!!").is_err());
    }

    #[test]
    fn provider_parse_and_display() {
        assert_eq!(MailProvider::parse("gmail"), Some(MailProvider::Gmail));
        assert_eq!(MailProvider::parse("outlook"), Some(MailProvider::Microsoft));
        assert_eq!(MailProvider::parse("yahoo"), None);
        assert_eq!(MailProvider::Gmail.to_string(), "gmail");
    }

    #[test]
    fn redirect_uri_is_path_based() {
        let config = Config {
            database_url: "sqlite::memory:".to_string(),
            port: 3800,
            sendgrid_api_key: None,
            sendgrid_validation_key: None,
            sendgrid_forward_from: "replies@maildrip.io".to_string(),
            frontend_url: "http://localhost:3800".to_string(),
            unsubscribe_url: "http://localhost:3800/unsubscribe".to_string(),
            oauth_redirect_base: "https://api.example.com/email-oauth/".to_string(),
            google_oauth: None,
            microsoft_oauth: None,
            tick_seconds: 0,
            send_rate_limit_per_minute: 60,
            send_burst_limit: 10,
        };
        let client = OAuthClient::from_config(&config).unwrap();
        assert_eq!(
            client.redirect_uri(MailProvider::Gmail),
            "https://api.example.com/email-oauth/gmail/callback"
        );
        assert!(!client.redirect_uri(MailProvider::Microsoft).contains('?'));
    }
}
