use axum::{extract::State, http::StatusCode, response::Json, routing::post, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatcher::Dispatcher;
use crate::error::{MailDripError, Result};
use crate::scheduler::Refresher;
use crate::{validation, verifier, AppState};

pub fn routes() -> Router<AppState> {
    Router::new().route("/actions", post(run_action))
}

/// Body of the cron/webhook trigger. `automationId` is only meaningful for
/// `activate`.
#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default, alias = "automationId")]
    pub automation_id: Option<String>,
}

async fn run_action(
    State(state): State<AppState>,
    Json(request): Json<ActionRequest>,
) -> (StatusCode, Json<Value>) {
    let now = Utc::now();
    match execute_action(&state, &request, now).await {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(MailDripError::InvalidInput(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message })),
        ),
        Err(MailDripError::AutomationNotFound(id)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Automation not found: {id}") })),
        ),
        Err(e) => {
            tracing::error!(action = %request.action, "Action failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}

pub async fn execute_action(
    state: &AppState,
    request: &ActionRequest,
    now: DateTime<Utc>,
) -> Result<Value> {
    let refresher = Refresher::new(state.db.clone());
    let dispatcher = Dispatcher::new(state.db.clone(), state.sendgrid.clone(), state.config.clone());

    let body = match request.action.as_str() {
        "refresh" => {
            let refresh = refresher.refresh_all(now).await?;
            json!({ "action": "refresh", "refresh": refresh })
        }
        "verify" => {
            let verify = verifier::run_verification_pass(&state.db, now).await?;
            json!({ "action": "verify", "verify": verify })
        }
        "send" => {
            let send = dispatcher.run_dispatch_pass(now).await?;
            json!({ "action": "send", "send": send })
        }
        "process" => {
            let verify = verifier::run_verification_pass(&state.db, now).await?;
            let send = dispatcher.run_dispatch_pass(now).await?;
            json!({ "action": "process", "verify": verify, "send": send })
        }
        "daily" => {
            let refresh = refresher.refresh_all(now).await?;
            let verify = verifier::run_verification_pass(&state.db, now).await?;
            let send = dispatcher.run_dispatch_pass(now).await?;
            let validation = validation::run_validation_pass(&state.db, &state.sendgrid, now).await?;
            json!({
                "action": "daily",
                "refresh": refresh,
                "verify": verify,
                "send": send,
                "validation": validation,
            })
        }
        "activate" => {
            let automation_id = request.automation_id.as_deref().ok_or_else(|| {
                MailDripError::invalid("activate requires automationId".to_string())
            })?;
            let refresh = refresher.refresh_automation_by_id(automation_id, now).await?;
            json!({ "action": "activate", "automation_id": automation_id, "refresh": refresh })
        }
        other => {
            return Err(MailDripError::invalid(format!("Unknown action: {other}")));
        }
    };

    Ok(body)
}
