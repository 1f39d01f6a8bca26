pub mod actions;
pub mod events;
pub mod health;
pub mod inbound;
pub mod oauth_flow;

use crate::AppState;
use axum::Router;

pub fn create_router() -> Router<AppState> {
    Router::new()
        // Health check route (no auth required)
        .merge(health::routes())
        // Cron/action contract
        .nest("/api/v1", actions::routes())
        // Provider webhooks: delivery events + inbound parse
        .nest("/webhooks", events::routes().merge(inbound::routes()))
        // Mailbox OAuth flows
        .nest("/email-oauth", oauth_flow::routes())
}
