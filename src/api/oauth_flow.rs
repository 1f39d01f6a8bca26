use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Json, Redirect},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, ColumnTrait, EntityTrait, ModelTrait, QueryFilter, Set};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::database::provider_connections;
use crate::error::{MailDripError, Result};
use crate::oauth::{MailProvider, OAuthState};
use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:provider/initiate", get(initiate))
        .route("/:provider/callback", get(callback))
        .route("/:provider/disconnect", post(disconnect))
}

#[derive(Debug, Deserialize)]
struct InitiateQuery {
    #[serde(rename = "ownerId")]
    owner_id: String,
    #[serde(default)]
    redirect: Option<String>,
}

async fn initiate(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<InitiateQuery>,
) -> (StatusCode, Json<Value>) {
    let Some(provider) = MailProvider::parse(&provider) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Unknown provider: {provider}") })),
        );
    };

    let oauth_state = OAuthState {
        owner_id: query.owner_id,
        redirect_after: query.redirect.unwrap_or_else(|| "/settings/email".to_string()),
    };

    match state.oauth.authorization_url(provider, &oauth_state) {
        Ok(url) => (StatusCode::OK, Json(json!({ "url": url }))),
        Err(e) => {
            tracing::error!("Failed to build authorization URL: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Finishes the provider round-trip: validates state, exchanges the code,
/// stores an encrypted connection, then bounces back to the frontend with
/// `oauth=success` or `oauth=error`.
async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    let provider_name = provider.clone();
    let redirect_after = query
        .state
        .as_deref()
        .and_then(|s| OAuthState::decode(s).ok())
        .map(|s| s.redirect_after)
        .unwrap_or_else(|| "/settings/email".to_string());

    match complete_callback(&state, &provider, query).await {
        Ok(()) => Redirect::to(&format!(
            "{}{}?oauth=success&provider={}",
            state.config.frontend_url, redirect_after, provider_name
        )),
        Err(e) => {
            tracing::error!(provider = %provider_name, "OAuth callback failed: {e}");
            let encoded: String =
                url::form_urlencoded::byte_serialize(e.to_string().as_bytes()).collect();
            Redirect::to(&format!(
                "{}{}?oauth=error&error={}",
                state.config.frontend_url, redirect_after, encoded
            ))
        }
    }
}

async fn complete_callback(
    state: &AppState,
    provider: &str,
    query: CallbackQuery,
) -> Result<()> {
    let provider = MailProvider::parse(provider)
        .ok_or_else(|| MailDripError::oauth(format!("Unknown provider: {provider}")))?;

    if let Some(error) = query.error {
        return Err(MailDripError::oauth(format!("Provider returned: {error}")));
    }

    let code = query
        .code
        .ok_or_else(|| MailDripError::oauth("Missing authorization code".to_string()))?;
    let oauth_state = query
        .state
        .as_deref()
        .ok_or_else(|| MailDripError::oauth("Missing state parameter".to_string()))
        .and_then(OAuthState::decode)?;

    let vault = state
        .vault
        .as_ref()
        .ok_or_else(|| MailDripError::Crypto("Token encryption is not configured".to_string()))?;

    let now = Utc::now();
    let tokens = state.oauth.exchange_code(provider, &code).await?;
    let userinfo = state.oauth.userinfo(provider, &tokens.access_token).await?;

    let access_encrypted = vault.encrypt(&tokens.access_token)?;
    let refresh_encrypted = tokens
        .refresh_token
        .as_deref()
        .map(|t| vault.encrypt(t))
        .transpose()?;
    let expires_at = tokens
        .expires_in
        .map(|secs| now + chrono::Duration::seconds(secs as i64));

    let existing = provider_connections::Entity::find()
        .filter(provider_connections::Column::OwnerId.eq(oauth_state.owner_id.clone()))
        .filter(provider_connections::Column::Provider.eq(provider.as_str()))
        .one(&*state.db)
        .await?;

    match existing {
        Some(connection) => {
            let keep_refresh = connection.refresh_token_encrypted.clone();
            let mut update: provider_connections::ActiveModel = connection.into();
            update.access_token_encrypted = Set(access_encrypted);
            // A re-consent may omit the refresh token; keep the stored one.
            update.refresh_token_encrypted = Set(refresh_encrypted.or(keep_refresh));
            update.token_expires_at = Set(expires_at);
            update.provider_email = Set(Some(userinfo.email));
            update.status = Set("active".to_string());
            update.last_error = Set(None);
            update.updated_at = Set(now);
            update.update(&*state.db).await?;
        }
        None => {
            let mut row = provider_connections::ActiveModel::new();
            row.owner_id = Set(oauth_state.owner_id.clone());
            row.provider = Set(provider.as_str().to_string());
            row.access_token_encrypted = Set(access_encrypted);
            row.refresh_token_encrypted = Set(refresh_encrypted);
            row.token_expires_at = Set(expires_at);
            row.provider_email = Set(Some(userinfo.email));
            row.insert(&*state.db).await?;
        }
    }

    tracing::info!(
        owner_id = %oauth_state.owner_id,
        provider = %provider,
        "Mailbox connection established"
    );
    Ok(())
}

#[derive(Debug, Deserialize)]
struct DisconnectRequest {
    #[serde(rename = "ownerId")]
    owner_id: String,
}

async fn disconnect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Json(request): Json<DisconnectRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(provider) = MailProvider::parse(&provider) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("Unknown provider: {provider}") })),
        );
    };

    let result = async {
        let connection = provider_connections::Entity::find()
            .filter(provider_connections::Column::OwnerId.eq(request.owner_id.clone()))
            .filter(provider_connections::Column::Provider.eq(provider.as_str()))
            .one(&*state.db)
            .await?;

        if let Some(connection) = connection {
            if let Some(vault) = &state.vault {
                if let Ok(access_token) = vault.decrypt(&connection.access_token_encrypted) {
                    state.oauth.revoke(provider, &access_token).await;
                }
            }
            connection.delete(&*state.db).await?;
        }
        Ok::<_, MailDripError>(())
    }
    .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(e) => {
            tracing::error!("Failed to disconnect mailbox: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
