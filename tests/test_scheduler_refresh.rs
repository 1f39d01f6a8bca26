mod common;

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::EntityTrait;
use serde_json::json;

use maildrip::database::scheduled_emails;
use maildrip::scheduler::Refresher;

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

fn renewal_nodes() -> serde_json::Value {
    json!([
        { "id": "t1", "type": "trigger", "config": { "time": "09:00" } },
        { "id": "s1", "type": "send_email", "config": { "template": "tpl-1" } }
    ])
}

fn renewal_filter(days: u32) -> serde_json::Value {
    json!({
        "groups": [{
            "rules": [{
                "field": "policy_expiration",
                "operator": "more_than_days_future",
                "value": days.to_string()
            }]
        }]
    })
}

#[tokio::test]
async fn policy_renewal_happy_path_schedules_exact_send_time() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_policy(
        &db,
        "acc-1",
        "Auto",
        Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
    )
    .await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_automation(&db, "auto-1", Some("own-1"), renewal_filter(80), renewal_nodes())
        .await;

    let refresher = Refresher::new(db.clone());
    let outcome = refresher.refresh_all(at("2025-02-01T00:00:00Z")).await.unwrap();

    assert_eq!(outcome.automations_processed, 1);
    assert_eq!(outcome.emails_scheduled, 1);
    assert!(outcome.errors.is_empty());

    let rows = scheduled_emails::Entity::find().all(&*db).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    // 2025-06-01 minus 80 days, at the trigger's 09:00 UTC
    assert_eq!(row.scheduled_for, at("2025-03-13T09:00:00Z"));
    assert_eq!(row.qualification_value, "2025-06-01");
    assert!(row.requires_verification);
    assert_eq!(row.trigger_field, "policy_expiration");
    assert_eq!(row.recipient_email, "kim@hartley.example");
    assert_eq!(row.from_email, "agent@agency.example");
    assert_eq!(row.status, "Pending");
    assert_eq!(row.automation_id.as_deref(), Some("auto-1"));
}

#[tokio::test]
async fn repeated_refresh_is_deduplicated() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_policy(
        &db,
        "acc-1",
        "Auto",
        Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
    )
    .await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_automation(&db, "auto-1", Some("own-1"), renewal_filter(80), renewal_nodes())
        .await;

    let refresher = Refresher::new(db.clone());
    let now = at("2025-02-01T00:00:00Z");
    let first = refresher.refresh_all(now).await.unwrap();
    assert_eq!(first.emails_scheduled, 1);

    let second = refresher.refresh_all(now).await.unwrap();
    assert_eq!(second.emails_scheduled, 0);
    assert!(second.errors.is_empty());

    let rows = scheduled_emails::Entity::find().all(&*db).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn activation_flow_shifts_past_first_step_to_tomorrow() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_template(&db, "tpl-2", "own-1", None).await;
    common::seed_automation(
        &db,
        "auto-1",
        Some("own-1"),
        json!({ "groups": [] }),
        json!([
            { "id": "t1", "type": "trigger", "config": { "time": "09:00" } },
            { "id": "s1", "type": "send_email", "config": { "template": "tpl-1" } },
            { "id": "d1", "type": "delay", "config": { "duration": 2, "unit": "days" } },
            { "id": "s2", "type": "send_email", "config": { "template": "tpl-2" } }
        ]),
    )
    .await;

    let refresher = Refresher::new(db.clone());
    // 12:00 is past the 09:00 trigger, so the journey starts tomorrow
    let outcome = refresher
        .refresh_automation_by_id("auto-1", at("2025-02-01T12:00:00Z"))
        .await
        .unwrap();
    assert_eq!(outcome.emails_scheduled, 2);

    let mut rows = scheduled_emails::Entity::find().all(&*db).await.unwrap();
    rows.sort_by_key(|r| r.scheduled_for);
    assert_eq!(rows[0].scheduled_for, at("2025-02-02T09:00:00Z"));
    assert_eq!(rows[1].scheduled_for, at("2025-02-04T09:00:00Z"));
    for row in &rows {
        assert_eq!(row.qualification_value, "immediate");
        assert!(!row.requires_verification);
        assert_eq!(row.trigger_field, "activation");
    }
}

#[tokio::test]
async fn far_future_sends_are_skipped() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    // Expiration more than a year past the horizon
    common::seed_policy(
        &db,
        "acc-1",
        "Auto",
        Some(NaiveDate::from_ymd_opt(2027, 6, 1).unwrap()),
    )
    .await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_automation(&db, "auto-1", Some("own-1"), renewal_filter(30), renewal_nodes())
        .await;

    let refresher = Refresher::new(db.clone());
    let outcome = refresher.refresh_all(at("2025-02-01T00:00:00Z")).await.unwrap();
    assert_eq!(outcome.emails_scheduled, 0);
}

#[tokio::test]
async fn missing_template_key_records_automation_error() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    common::seed_automation(
        &db,
        "auto-1",
        Some("own-1"),
        json!({ "groups": [] }),
        json!([
            { "id": "t1", "type": "trigger", "config": {} },
            { "id": "s1", "type": "send_email", "config": { "templateKey": "does_not_exist" } }
        ]),
    )
    .await;

    let refresher = Refresher::new(db.clone());
    let outcome = refresher.refresh_all(at("2025-02-01T00:00:00Z")).await.unwrap();

    assert_eq!(outcome.emails_scheduled, 0);
    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.errors[0].contains("does_not_exist"));

    let rows = scheduled_emails::Entity::find().all(&*db).await.unwrap();
    assert!(rows.is_empty());

    let automation = maildrip::database::automations::Entity::find_by_id("auto-1".to_string())
        .one(&*db)
        .await
        .unwrap()
        .unwrap();
    assert!(automation.last_error.is_some());
}

#[tokio::test]
async fn opted_out_accounts_are_never_scheduled() {
    let db = common::setup_db().await;
    common::seed_owner(&db, "own-1", "agent@agency.example").await;
    let account = common::seed_account(&db, "acc-1", "own-1", "kim@hartley.example").await;
    {
        use sea_orm::{ActiveModelTrait, Set};
        let mut update: maildrip::database::accounts::ActiveModel = account.into();
        update.opted_out = Set(true);
        update.update(&*db).await.unwrap();
    }
    common::seed_policy(
        &db,
        "acc-1",
        "Auto",
        Some(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()),
    )
    .await;
    common::seed_template(&db, "tpl-1", "own-1", None).await;
    common::seed_automation(&db, "auto-1", Some("own-1"), renewal_filter(80), renewal_nodes())
        .await;

    let refresher = Refresher::new(db.clone());
    let outcome = refresher.refresh_all(at("2025-02-01T00:00:00Z")).await.unwrap();
    assert_eq!(outcome.emails_scheduled, 0);
}
