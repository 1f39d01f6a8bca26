#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::{ActiveModelBehavior, ActiveModelTrait, DatabaseConnection, Set};
use std::sync::Arc;

use maildrip::config::Config;
use maildrip::database::{
    accounts, automations, email_logs, email_templates, owners, policies, scheduled_emails,
};
use maildrip::inbox::InboxInjector;
use maildrip::mail::SendGridClient;
use maildrip::oauth::OAuthClient;
use maildrip::AppState;

pub async fn setup_db() -> Arc<DatabaseConnection> {
    let db = maildrip::establish_connection("sqlite::memory:")
        .await
        .expect("in-memory database");
    Arc::new(db)
}

pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        port: 0,
        sendgrid_api_key: None,
        sendgrid_validation_key: None,
        sendgrid_forward_from: "replies@maildrip.io".to_string(),
        frontend_url: "http://localhost:3800".to_string(),
        unsubscribe_url: "http://localhost:3800/unsubscribe".to_string(),
        oauth_redirect_base: "http://localhost:3800/email-oauth".to_string(),
        google_oauth: None,
        microsoft_oauth: None,
        tick_seconds: 0,
        send_rate_limit_per_minute: 600,
        send_burst_limit: 100,
    }
}

/// App state wired for tests: dry-run mail client, no OAuth providers, no
/// encryption key.
pub fn app_state(db: Arc<DatabaseConnection>) -> AppState {
    let config = Arc::new(test_config());
    let oauth = Arc::new(OAuthClient::from_config(&config).expect("oauth client"));
    let sendgrid = Arc::new(
        SendGridClient::new(
            None,
            None,
            config.send_rate_limit_per_minute,
            config.send_burst_limit,
        )
        .expect("sendgrid client"),
    );
    let injector = Arc::new(
        InboxInjector::new(
            db.clone(),
            None,
            oauth.clone(),
            sendgrid.clone(),
            config.clone(),
        )
        .expect("injector"),
    );

    AppState {
        db,
        config,
        vault: None,
        oauth,
        sendgrid,
        injector,
    }
}

pub async fn seed_owner(db: &DatabaseConnection, id: &str, email: &str) -> owners::Model {
    let mut owner = owners::ActiveModel::new();
    owner.id = Set(id.to_string());
    owner.email = Set(email.to_string());
    owner.company_name = Set(Some("Hartley Insurance".to_string()));
    owner.insert(db).await.expect("seed owner")
}

pub async fn seed_account(
    db: &DatabaseConnection,
    id: &str,
    owner_id: &str,
    email: &str,
) -> accounts::Model {
    let mut account = accounts::ActiveModel::new();
    account.id = Set(id.to_string());
    account.owner_id = Set(owner_id.to_string());
    account.name = Set(Some("Hartley Trucking".to_string()));
    account.person_email = Set(Some(email.to_string()));
    account.first_name = Set(Some("Kim".to_string()));
    account.last_name = Set(Some("Hartley".to_string()));
    account.insert(db).await.expect("seed account")
}

pub async fn seed_policy(
    db: &DatabaseConnection,
    account_id: &str,
    line_of_business: &str,
    expiration: Option<NaiveDate>,
) -> policies::Model {
    let mut policy = policies::ActiveModel::new();
    policy.account_id = Set(account_id.to_string());
    policy.line_of_business = Set(line_of_business.to_string());
    policy.expiration_date = Set(expiration);
    policy.insert(db).await.expect("seed policy")
}

pub async fn seed_template(
    db: &DatabaseConnection,
    id: &str,
    owner_id: &str,
    default_key: Option<&str>,
) -> email_templates::Model {
    let mut template = email_templates::ActiveModel::new();
    template.id = Set(id.to_string());
    template.owner_id = Set(owner_id.to_string());
    template.default_key = Set(default_key.map(str::to_string));
    template.subject = Set("Your {{trigger_date}} renewal".to_string());
    template.html_content =
        Set("<html><body><p>Hi {{first_name}}, time to renew.</p></body></html>".to_string());
    template.text_content = Set(Some("Hi {{first_name}}, time to renew.".to_string()));
    template.from_email = Set("agent@agency.example".to_string());
    template.from_name = Set(Some("Agency".to_string()));
    template.insert(db).await.expect("seed template")
}

pub async fn seed_automation(
    db: &DatabaseConnection,
    id: &str,
    owner_id: Option<&str>,
    filter_config: serde_json::Value,
    nodes: serde_json::Value,
) -> automations::Model {
    let mut automation = automations::ActiveModel::new();
    automation.id = Set(id.to_string());
    automation.owner_id = Set(owner_id.map(str::to_string));
    automation.name = Set(format!("automation {id}"));
    automation.status = Set("Active".to_string());
    automation.filter_config = Set(filter_config.to_string());
    automation.nodes = Set(nodes.to_string());
    automation.insert(db).await.expect("seed automation")
}

/// A ready-to-dispatch scheduled row with sensible snapshots.
pub async fn seed_scheduled_email(
    db: &DatabaseConnection,
    id: &str,
    owner_id: &str,
    automation_id: Option<&str>,
    account_id: &str,
    template_id: &str,
    recipient: &str,
    scheduled_for: DateTime<Utc>,
    requires_verification: bool,
) -> scheduled_emails::Model {
    let mut row = scheduled_emails::ActiveModel::new();
    row.id = Set(id.to_string());
    row.owner_id = Set(owner_id.to_string());
    row.automation_id = Set(automation_id.map(str::to_string));
    row.account_id = Set(account_id.to_string());
    row.template_id = Set(template_id.to_string());
    row.node_id = Set("node-send-1".to_string());
    row.recipient_email = Set(recipient.to_string());
    row.recipient_name = Set(Some("Kim Hartley".to_string()));
    row.from_email = Set("agent@agency.example".to_string());
    row.from_name = Set(Some("Agency".to_string()));
    row.subject = Set("Your {{trigger_date}} renewal".to_string());
    row.scheduled_for = Set(scheduled_for);
    row.requires_verification = Set(requires_verification);
    row.qualification_value = Set("2025-06-01".to_string());
    row.trigger_field = Set("policy_expiration".to_string());
    row.insert(db).await.expect("seed scheduled email")
}

pub async fn seed_email_log(
    db: &DatabaseConnection,
    owner_id: &str,
    template_id: &str,
    to_email: &str,
    status: &str,
    sent_at: Option<DateTime<Utc>>,
) -> email_logs::Model {
    let mut log = email_logs::ActiveModel::new();
    log.owner_id = Set(owner_id.to_string());
    log.template_id = Set(Some(template_id.to_string()));
    log.to_email = Set(to_email.to_string());
    log.from_email = Set("agent@agency.example".to_string());
    log.subject = Set("Your renewal".to_string());
    log.status = Set(status.to_string());
    log.sent_at = Set(sent_at);
    log.insert(db).await.expect("seed email log")
}
