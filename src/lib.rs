use std::sync::Arc;

pub mod api;
pub mod automation;
pub mod config;
pub mod crypto;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod inbox;
pub mod mail;
pub mod oauth;
pub mod scheduler;
pub mod validation;
pub mod verifier;

pub use database::establish_connection;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<sea_orm::DatabaseConnection>,
    pub config: Arc<config::Config>,
    pub vault: Option<Arc<crypto::TokenVault>>,
    pub oauth: Arc<oauth::OAuthClient>,
    pub sendgrid: Arc<mail::SendGridClient>,
    pub injector: Arc<inbox::InboxInjector>,
}
