use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailDripError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Automation not found: {0}")]
    AutomationNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Cycle detected in automation nodes")]
    CycleDetected,

    #[error("Mail provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MailDripError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn oauth(message: impl Into<String>) -> Self {
        Self::OAuth(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

pub type Result<T> = std::result::Result<T, MailDripError>;
