mod common;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::json;

use maildrip::database::{policies, scheduled_emails};
use maildrip::verifier;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

async fn seed_renewal_fixture(db: &sea_orm::DatabaseConnection) -> policies::Model {
    common::seed_owner(db, "own-1", "agent@agency.example").await;
    common::seed_account(db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(db, "tpl-1", "own-1", None).await;
    common::seed_automation(
        db,
        "auto-1",
        Some("own-1"),
        json!({ "groups": [] }),
        json!([{ "id": "s1", "type": "send_email", "config": { "template": "tpl-1" } }]),
    )
    .await;
    common::seed_policy(
        db,
        "acc-1",
        "Auto",
        Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
    )
    .await
}

#[tokio::test]
async fn verification_clears_flag_when_row_still_qualifies() {
    let db = common::setup_db().await;
    seed_renewal_fixture(&db).await;

    let now = at("2025-03-12T10:05:00Z");
    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        Some("auto-1"),
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        true,
    )
    .await;

    let outcome = verifier::run_verification_pass(&db, now).await.unwrap();
    assert_eq!(outcome.examined, 1);
    assert_eq!(outcome.verified, 1);
    assert_eq!(outcome.cancelled, 0);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert!(!row.requires_verification);
    assert_eq!(row.status, "Pending");
}

#[tokio::test]
async fn verification_cancels_when_policy_deactivated() {
    let db = common::setup_db().await;
    let policy = seed_renewal_fixture(&db).await;

    // Policy deactivated at 2025-03-12T10:00Z
    let mut update: policies::ActiveModel = policy.into();
    update.status = Set("Cancelled".to_string());
    update.update(&*db).await.unwrap();

    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        Some("auto-1"),
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        true,
    )
    .await;

    let outcome = verifier::run_verification_pass(&db, at("2025-03-12T10:05:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome.cancelled, 1);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, "Cancelled");
    let message = row.error_message.unwrap();
    assert!(message.contains("policy"), "unexpected reason: {message}");
}

#[tokio::test]
async fn verification_only_looks_24_hours_ahead() {
    let db = common::setup_db().await;
    seed_renewal_fixture(&db).await;

    let now = at("2025-03-10T09:00:00Z");
    // due in three days: outside the window, untouched
    common::seed_scheduled_email(
        &db,
        "sched-far",
        "own-1",
        Some("auto-1"),
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        true,
    )
    .await;

    let outcome = verifier::run_verification_pass(&db, now).await.unwrap();
    assert_eq!(outcome.examined, 0);

    let row = scheduled_emails::Entity::find_by_id("sched-far".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert!(row.requires_verification);
}

#[tokio::test]
async fn verification_cancels_unsubscribed_recipient() {
    let db = common::setup_db().await;
    seed_renewal_fixture(&db).await;

    maildrip::api::events::add_unsubscribe(&db, "Kim@Hartley.Example", None, None)
        .await
        .unwrap();

    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        Some("auto-1"),
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        true,
    )
    .await;

    let outcome = verifier::run_verification_pass(&db, at("2025-03-12T10:05:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome.cancelled, 1);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        row.error_message.as_deref(),
        Some("Recipient has unsubscribed")
    );
}

#[tokio::test]
async fn verification_cancels_recent_duplicate_template() {
    let db = common::setup_db().await;
    seed_renewal_fixture(&db).await;

    let now = at("2025-03-12T10:05:00Z");
    common::seed_email_log(
        &db,
        "own-1",
        "tpl-1",
        "KIM@hartley.example",
        "Delivered",
        Some(now - Duration::days(3)),
    )
    .await;

    common::seed_scheduled_email(
        &db,
        "sched-1",
        "own-1",
        Some("auto-1"),
        "acc-1",
        "tpl-1",
        "kim@hartley.example",
        at("2025-03-13T09:00:00Z"),
        true,
    )
    .await;

    let outcome = verifier::run_verification_pass(&db, now).await.unwrap();
    assert_eq!(outcome.cancelled, 1);

    let row = scheduled_emails::Entity::find_by_id("sched-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        row.error_message.as_deref(),
        Some(verifier::RECENCY_CANCEL_REASON)
    );
}
