pub mod accounts;
pub mod automations;
pub mod email_events;
pub mod email_logs;
pub mod email_replies;
pub mod email_templates;
pub mod owners;
pub mod policies;
pub mod provider_connections;
pub mod scheduled_emails;
pub mod sender_domains;
pub mod suppressions;
pub mod unsubscribes;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Statement};

pub async fn establish_connection(database_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(database_url.to_string());
    // An in-memory sqlite database exists per connection; a pool bigger
    // than one would scatter the schema.
    if database_url.starts_with("sqlite::memory:") {
        options.max_connections(1);
    }
    let db = Database::connect(options).await?;
    create_tables(&db).await?;
    Ok(db)
}

pub async fn create_tables(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();

    let sql_statements = vec![
        r#"CREATE TABLE IF NOT EXISTS owners (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            name TEXT,
            company_name TEXT,
            company_address TEXT,
            company_phone TEXT,
            company_website TEXT,
            signature_html TEXT,
            timezone TEXT,
            created_at TIMESTAMP NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            name TEXT,
            person_email TEXT,
            email TEXT,
            first_name TEXT,
            last_name TEXT,
            phone TEXT,
            address TEXT,
            city TEXT,
            state TEXT,
            zip TEXT,
            opted_out INTEGER NOT NULL DEFAULT 0,
            email_validation_status TEXT NOT NULL DEFAULT 'unknown',
            email_validation_score REAL,
            email_validated_at TIMESTAMP,
            email_validation_reason TEXT,
            email_validation_details TEXT,
            created_at TIMESTAMP NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS policies (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            line_of_business TEXT NOT NULL,
            term TEXT,
            effective_date DATE,
            expiration_date DATE,
            status TEXT NOT NULL DEFAULT 'Active',
            FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS automations (
            id TEXT PRIMARY KEY,
            owner_id TEXT,
            name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Draft',
            filter_config TEXT NOT NULL,
            nodes TEXT NOT NULL,
            timezone TEXT,
            last_error TEXT,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS email_templates (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            default_key TEXT,
            category TEXT,
            subject TEXT NOT NULL,
            html_content TEXT NOT NULL,
            text_content TEXT,
            from_email TEXT NOT NULL,
            from_name TEXT,
            merge_fields TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS sender_domains (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            domain TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            inbound_parse_enabled INTEGER NOT NULL DEFAULT 0
        )"#,
        r#"CREATE TABLE IF NOT EXISTS scheduled_emails (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            automation_id TEXT,
            account_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            node_id TEXT NOT NULL,
            recipient_email TEXT NOT NULL,
            recipient_name TEXT,
            from_email TEXT NOT NULL,
            from_name TEXT,
            subject TEXT NOT NULL,
            scheduled_for TIMESTAMP NOT NULL,
            status TEXT NOT NULL DEFAULT 'Pending',
            requires_verification INTEGER NOT NULL DEFAULT 0,
            qualification_value TEXT NOT NULL,
            trigger_field TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            last_attempt_at TIMESTAMP,
            error_message TEXT,
            email_log_id INTEGER,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS email_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id TEXT NOT NULL,
            account_id TEXT,
            template_id TEXT,
            to_email TEXT NOT NULL,
            to_name TEXT,
            from_email TEXT NOT NULL,
            from_name TEXT,
            subject TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Queued',
            queued_at TIMESTAMP NOT NULL,
            sent_at TIMESTAMP,
            delivered_at TIMESTAMP,
            first_opened_at TIMESTAMP,
            first_clicked_at TIMESTAMP,
            bounced_at TIMESTAMP,
            unsubscribed_at TIMESTAMP,
            failed_at TIMESTAMP,
            open_count INTEGER NOT NULL DEFAULT 0,
            click_count INTEGER NOT NULL DEFAULT 0,
            message_id TEXT,
            custom_message_id TEXT,
            reply_to TEXT,
            bounce_type TEXT,
            error_message TEXT,
            reply_count INTEGER NOT NULL DEFAULT 0,
            last_reply_at TIMESTAMP
        )"#,
        r#"CREATE TABLE IF NOT EXISTS email_events (
            id TEXT PRIMARY KEY,
            email_log_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            url TEXT,
            ip TEXT,
            useragent TEXT,
            occurred_at TIMESTAMP NOT NULL,
            FOREIGN KEY (email_log_id) REFERENCES email_logs(id) ON DELETE CASCADE
        )"#,
        r#"CREATE TABLE IF NOT EXISTS email_replies (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            email_log_id INTEGER,
            account_id TEXT,
            from_email TEXT NOT NULL,
            from_name TEXT,
            to_email TEXT NOT NULL,
            subject TEXT,
            body_text TEXT,
            body_html TEXT,
            in_reply_to TEXT,
            references_header TEXT,
            raw_headers TEXT,
            received_at TIMESTAMP NOT NULL,
            sender_verified INTEGER NOT NULL DEFAULT 0,
            expected_sender_email TEXT,
            verification_notes TEXT,
            inbox_injected INTEGER NOT NULL DEFAULT 0,
            inbox_injected_at TIMESTAMP,
            inbox_injection_provider TEXT,
            inbox_injection_error TEXT
        )"#,
        r#"CREATE TABLE IF NOT EXISTS suppressions (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            reason TEXT,
            created_at TIMESTAMP NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS unsubscribes (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            owner_id TEXT,
            source TEXT,
            created_at TIMESTAMP NOT NULL
        )"#,
        r#"CREATE TABLE IF NOT EXISTS provider_connections (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            access_token_encrypted TEXT NOT NULL,
            refresh_token_encrypted TEXT,
            token_expires_at TIMESTAMP,
            provider_email TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            last_error TEXT,
            last_used_at TIMESTAMP,
            created_at TIMESTAMP NOT NULL,
            updated_at TIMESTAMP NOT NULL,
            UNIQUE(owner_id, provider)
        )"#,
        // Dedup key: one live row per (automation, account, template, qualification).
        // Partial so Cancelled/Failed rows can be legitimately re-created later.
        r#"CREATE UNIQUE INDEX IF NOT EXISTS ux_scheduled_emails_dedup
            ON scheduled_emails (COALESCE(automation_id, ''), account_id, template_id, qualification_value)
            WHERE status IN ('Pending', 'Processing', 'Sent')"#,
        r#"CREATE INDEX IF NOT EXISTS ix_scheduled_emails_due
            ON scheduled_emails (status, scheduled_for)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_email_logs_message_id ON email_logs (message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_email_logs_custom_message_id ON email_logs (custom_message_id)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_email_logs_recency ON email_logs (template_id, to_email, sent_at)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_policies_account ON policies (account_id)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_suppressions_email ON suppressions (email)"#,
        r#"CREATE INDEX IF NOT EXISTS ix_unsubscribes_email ON unsubscribes (email)"#,
    ];

    for sql in sql_statements {
        let statement = Statement::from_string(backend, sql);
        db.execute(statement).await?;
    }

    Ok(())
}
