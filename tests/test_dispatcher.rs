mod common;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use sea_orm::EntityTrait;
use std::sync::Arc;

use maildrip::database::{email_logs, scheduled_emails};
use maildrip::dispatcher::Dispatcher;
use maildrip::mail::SendGridClient;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

fn dry_run_dispatcher(db: Arc<sea_orm::DatabaseConnection>) -> Dispatcher {
    let config = Arc::new(common::test_config());
    let sendgrid = Arc::new(SendGridClient::new(None, None, 600, 100).unwrap());
    Dispatcher::new(db, sendgrid, config)
}

#[tokio::test]
async fn due_row_is_sent_and_linked_to_its_log() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        None,
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        false,
    )
    .await;

    let dispatcher = dry_run_dispatcher(db.clone());
    let now = at("2025-03-13T09:05:00Z");
    let outcome = dispatcher.run_dispatch_pass(now).await.unwrap();
    assert_eq!(outcome.sent, 1);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "Sent");
    assert_eq!(row.attempts, 1);
    let log_id = row.email_log_id.expect("log linked");

    let log = email_logs::Entity::find_by_id(log_id)
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(log.status, "Sent");
    assert!(log.sent_at.is_some());
    assert!(log.message_id.unwrap().starts_with("dry-run-"));

    // <isg-{log_id}-{epoch_ms}@{from_domain}>
    let custom = log.custom_message_id.unwrap();
    let pattern = Regex::new(r"^<isg-(\d+)-(\d+)@agency\.example>$").unwrap();
    let caps = pattern.captures(&custom).expect("custom message id shape");
    assert_eq!(caps[1].parse::<i64>().unwrap(), log_id);
    assert_eq!(caps[2].parse::<i64>().unwrap(), now.timestamp_millis());
    assert_eq!(log.reply_to.as_deref(), Some("agent@agency.example"));
}

#[tokio::test]
async fn recency_suppression_cancels_without_creating_a_log() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;

    let now = at("2025-03-13T09:05:00Z");
    // same template went out to the same address three days ago
    common::seed_email_log(
        &db,
        "own-1",
        "tpl-1",
        "kim@hartley.example",
        "Sent",
        Some(now - Duration::days(3)),
    )
    .await;

    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        None,
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        false,
    )
    .await;

    let dispatcher = dry_run_dispatcher(db.clone());
    let outcome = dispatcher.run_dispatch_pass(now).await.unwrap();
    assert_eq!(outcome.cancelled, 1);
    assert_eq!(outcome.sent, 0);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "Cancelled");
    assert_eq!(
        row.error_message.as_deref(),
        Some("Template already sent to this recipient within 7 days")
    );

    // no second log was created for the cancelled row
    let logs = email_logs::Entity::find().all(&*db).await.unwrap();
    assert_eq!(logs.len(), 1);
}

#[tokio::test]
async fn sends_older_than_the_window_do_not_suppress() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;

    let now = at("2025-03-13T09:05:00Z");
    common::seed_email_log(
        &db,
        "own-1",
        "tpl-1",
        "kim@hartley.example",
        "Sent",
        Some(now - Duration::days(8)),
    )
    .await;

    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        None,
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        false,
    )
    .await;

    let outcome = dry_run_dispatcher(db.clone())
        .run_dispatch_pass(now)
        .await
        .unwrap();
    assert_eq!(outcome.sent, 1);
}

#[tokio::test]
async fn unverified_rows_are_not_dispatched() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        None,
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        true, // still awaiting the 24h check
    )
    .await;

    let outcome = dry_run_dispatcher(db.clone())
        .run_dispatch_pass(at("2025-03-13T09:05:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome.examined, 0);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "Pending");
}

#[tokio::test]
async fn missing_template_fails_terminally() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    // tpl-1 is never seeded
    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        None,
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        false,
    )
    .await;

    let outcome = dry_run_dispatcher(db.clone())
        .run_dispatch_pass(at("2025-03-13T09:05:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome.failed, 1);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "Failed");
    assert!(row.error_message.unwrap().contains("Template"));
}

#[tokio::test]
async fn stale_processing_rows_are_recovered_then_dispatched() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    let row = common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        None,
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        false,
    )
    .await;

    let now = at("2025-03-13T10:00:00Z");
    {
        use sea_orm::{ActiveModelTrait, Set};
        let mut update: scheduled_emails::ActiveModel = row.into();
        update.status = Set("Processing".to_string());
        update.last_attempt_at = Set(Some(now - Duration::minutes(30)));
        update.update(&*db).await.unwrap();
    }

    let outcome = dry_run_dispatcher(db.clone())
        .run_dispatch_pass(now)
        .await
        .unwrap();
    assert_eq!(outcome.sent, 1);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "Sent");
}
