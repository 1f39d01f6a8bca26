use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, Set,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::automation::{self, EmailStep, TemplateRef};
use crate::database::{accounts, automations, email_templates, owners, policies, scheduled_emails};
use crate::database::automations::AutomationStatus;
use crate::database::scheduled_emails::ScheduledEmailStatus;
use crate::error::{MailDripError, Result};
use crate::filter::{self, DateTrigger, FilterConfig, TriggerField};

const INSERT_CHUNK_SIZE: usize = 100;
const SCHEDULE_HORIZON_DAYS: i64 = 365;

fn default_send_time() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).expect("09:00 is a valid wall-clock time")
}

#[derive(Debug, Default, Serialize)]
pub struct RefreshOutcome {
    pub automations_processed: u32,
    pub emails_scheduled: u32,
    pub errors: Vec<String>,
}

/// Turns active automations into deduplicated pending send rows. One bad
/// automation never aborts the run; its error lands on the automation row
/// and in the outcome.
pub struct Refresher {
    db: Arc<DatabaseConnection>,
}

impl Refresher {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn refresh_all(&self, now: DateTime<Utc>) -> Result<RefreshOutcome> {
        let active = automations::Entity::find()
            .filter(automations::Column::Status.eq(AutomationStatus::Active.to_string()))
            .all(&*self.db)
            .await?;

        let mut outcome = RefreshOutcome::default();
        for automation in active {
            self.refresh_into(&automation, now, &mut outcome).await;
        }

        tracing::info!(
            processed = outcome.automations_processed,
            scheduled = outcome.emails_scheduled,
            errors = outcome.errors.len(),
            "Automation refresh complete"
        );
        Ok(outcome)
    }

    /// Activation flow: refresh exactly one automation, typically right
    /// after its status flipped to Active.
    pub async fn refresh_automation_by_id(
        &self,
        automation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<RefreshOutcome> {
        let automation = automations::Entity::find_by_id(automation_id.to_string())
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailDripError::AutomationNotFound(automation_id.to_string()))?;

        let mut outcome = RefreshOutcome::default();
        if AutomationStatus::from(automation.status.clone()) != AutomationStatus::Active {
            outcome.errors.push(format!(
                "Automation {} is not Active (status: {})",
                automation.id, automation.status
            ));
            return Ok(outcome);
        }

        self.refresh_into(&automation, now, &mut outcome).await;
        Ok(outcome)
    }

    async fn refresh_into(
        &self,
        automation: &automations::Model,
        now: DateTime<Utc>,
        outcome: &mut RefreshOutcome,
    ) {
        match self.refresh_automation(automation, now).await {
            Ok((scheduled, soft_errors)) => {
                outcome.automations_processed += 1;
                outcome.emails_scheduled += scheduled;
                let last_error = if soft_errors.is_empty() {
                    None
                } else {
                    Some(soft_errors.join("; "))
                };
                outcome.errors.extend(
                    soft_errors
                        .iter()
                        .map(|e| format!("{}: {e}", automation.name)),
                );
                self.record_automation_error(automation, last_error, now).await;
            }
            Err(e) => {
                tracing::error!(
                    automation_id = %automation.id,
                    "Failed to refresh automation: {e}"
                );
                outcome.errors.push(format!("{}: {e}", automation.name));
                self.record_automation_error(automation, Some(e.to_string()), now)
                    .await;
            }
        }
    }

    async fn record_automation_error(
        &self,
        automation: &automations::Model,
        error: Option<String>,
        now: DateTime<Utc>,
    ) {
        let mut update: automations::ActiveModel = automation.clone().into();
        update.last_error = Set(error);
        update.updated_at = Set(now);
        if let Err(e) = update.update(&*self.db).await {
            tracing::error!(automation_id = %automation.id, "Failed to record refresh result: {e}");
        }
    }

    /// Returns (rows scheduled, soft per-owner errors). A hard error means
    /// the automation as a whole could not be processed.
    async fn refresh_automation(
        &self,
        automation: &automations::Model,
        now: DateTime<Utc>,
    ) -> Result<(u32, Vec<String>)> {
        let filter_config = FilterConfig::parse(&automation.filter_config)?;
        let nodes = automation::parse_nodes(&automation.nodes)?;
        let steps = automation::build_email_schedule(&nodes)?;
        if steps.is_empty() {
            return Ok((0, Vec::new()));
        }

        let send_time = automation::trigger_time(&nodes).unwrap_or_else(default_send_time);
        let (date_triggers, non_date_filter) = filter::partition_rules(&filter_config);

        // Candidate accounts: owner-scoped unless this is a system-default
        // automation, never opted-out ones.
        let mut account_query =
            accounts::Entity::find().filter(accounts::Column::OptedOut.eq(false));
        if let Some(owner_id) = &automation.owner_id {
            account_query = account_query.filter(accounts::Column::OwnerId.eq(owner_id.clone()));
        }
        let candidate_accounts = account_query.all(&*self.db).await?;
        if candidate_accounts.is_empty() {
            return Ok((0, Vec::new()));
        }

        let account_ids: Vec<String> = candidate_accounts.iter().map(|a| a.id.clone()).collect();
        let all_policies = policies::Entity::find()
            .filter(policies::Column::AccountId.is_in(account_ids))
            .all(&*self.db)
            .await?;
        let mut policies_by_account: HashMap<&str, Vec<&policies::Model>> = HashMap::new();
        for policy in &all_policies {
            policies_by_account
                .entry(policy.account_id.as_str())
                .or_default()
                .push(policy);
        }

        let qualified: Vec<&accounts::Model> = candidate_accounts
            .iter()
            .filter(|account| {
                let account_policies = policies_by_account
                    .get(account.id.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                filter::account_matches(account, account_policies, &non_date_filter)
            })
            .collect();
        if qualified.is_empty() {
            return Ok((0, Vec::new()));
        }

        let owner_ids: Vec<String> = {
            let mut ids: Vec<String> = qualified.iter().map(|a| a.owner_id.clone()).collect();
            ids.sort();
            ids.dedup();
            ids
        };
        let owner_rows = owners::Entity::find()
            .filter(owners::Column::Id.is_in(owner_ids.clone()))
            .all(&*self.db)
            .await?;
        let owners_by_id: HashMap<String, owners::Model> =
            owner_rows.into_iter().map(|o| (o.id.clone(), o)).collect();

        let (templates, soft_errors) = self
            .resolve_templates(automation, &steps, &owner_ids)
            .await?;

        // Dedup keys already live for this automation.
        let existing = scheduled_emails::Entity::find()
            .filter(scheduled_emails::Column::AutomationId.eq(automation.id.clone()))
            .filter(scheduled_emails::Column::Status.is_in([
                ScheduledEmailStatus::Pending.to_string(),
                ScheduledEmailStatus::Processing.to_string(),
            ]))
            .all(&*self.db)
            .await?;
        let mut seen: HashSet<(String, String, String)> = existing
            .into_iter()
            .map(|row| (row.account_id, row.template_id, row.qualification_value))
            .collect();

        let mut new_rows: Vec<scheduled_emails::ActiveModel> = Vec::new();
        let today = now.date_naive();

        for account in &qualified {
            let recipient_email = match account.primary_email() {
                Some(email) => email.to_string(),
                None => continue,
            };
            let owner = owners_by_id.get(&account.owner_id);
            let tz = resolve_timezone(
                automation.timezone.as_deref(),
                owner.and_then(|o| o.timezone.as_deref()),
            );

            if date_triggers.is_empty() {
                self.emit_activation_rows(
                    automation,
                    account,
                    &recipient_email,
                    &steps,
                    &templates,
                    send_time,
                    tz,
                    now,
                    &mut seen,
                    &mut new_rows,
                );
            } else {
                let account_policies = policies_by_account
                    .get(account.id.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                self.emit_date_trigger_rows(
                    automation,
                    account,
                    account_policies,
                    &recipient_email,
                    &date_triggers,
                    &steps,
                    &templates,
                    send_time,
                    tz,
                    today,
                    &mut seen,
                    &mut new_rows,
                );
            }
        }

        let inserted = self.insert_rows(new_rows).await?;
        Ok((inserted, soft_errors))
    }

    /// Maps every step's template reference per owner. Direct ids resolve
    /// once; `templateKey` references resolve per owner through
    /// `default_key`. A missing mapping is fatal for a single-owner
    /// automation and a soft per-owner skip for system-default ones.
    async fn resolve_templates(
        &self,
        automation: &automations::Model,
        steps: &[EmailStep],
        owner_ids: &[String],
    ) -> Result<(TemplateResolution, Vec<String>)> {
        let mut direct_ids: Vec<String> = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        for step in steps {
            match &step.template_ref {
                TemplateRef::Id(id) => direct_ids.push(id.clone()),
                TemplateRef::Key(key) => keys.push(key.clone()),
            }
        }
        direct_ids.sort();
        direct_ids.dedup();
        keys.sort();
        keys.dedup();

        let mut by_id: HashMap<String, email_templates::Model> = HashMap::new();
        if !direct_ids.is_empty() {
            let rows = email_templates::Entity::find()
                .filter(email_templates::Column::Id.is_in(direct_ids.clone()))
                .all(&*self.db)
                .await?;
            by_id = rows.into_iter().map(|t| (t.id.clone(), t)).collect();
            for id in &direct_ids {
                if !by_id.contains_key(id) {
                    return Err(MailDripError::TemplateNotFound(id.clone()));
                }
            }
        }

        let mut by_owner_key: HashMap<(String, String), email_templates::Model> = HashMap::new();
        let mut soft_errors = Vec::new();
        if !keys.is_empty() {
            let rows = email_templates::Entity::find()
                .filter(email_templates::Column::OwnerId.is_in(owner_ids.to_vec()))
                .filter(email_templates::Column::DefaultKey.is_in(keys.clone()))
                .all(&*self.db)
                .await?;
            for template in rows {
                if let Some(key) = template.default_key.clone() {
                    by_owner_key.insert((template.owner_id.clone(), key), template);
                }
            }

            for owner_id in owner_ids {
                let missing: Vec<&String> = keys
                    .iter()
                    .filter(|key| !by_owner_key.contains_key(&(owner_id.clone(), (*key).clone())))
                    .collect();
                if missing.is_empty() {
                    continue;
                }
                let message = format!(
                    "No template with key(s) {} for owner {owner_id}",
                    missing
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if automation.owner_id.is_some() {
                    return Err(MailDripError::TemplateNotFound(message));
                }
                soft_errors.push(message);
            }
        }

        Ok((
            TemplateResolution {
                by_id,
                by_owner_key,
            },
            soft_errors,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_date_trigger_rows(
        &self,
        automation: &automations::Model,
        account: &accounts::Model,
        account_policies: &[&policies::Model],
        recipient_email: &str,
        date_triggers: &[DateTrigger],
        steps: &[EmailStep],
        templates: &TemplateResolution,
        send_time: NaiveTime,
        tz: Option<Tz>,
        today: NaiveDate,
        seen: &mut HashSet<(String, String, String)>,
        new_rows: &mut Vec<scheduled_emails::ActiveModel>,
    ) {
        let window_start = Utc
            .from_utc_datetime(&today.and_time(NaiveTime::MIN));
        let window_end = window_start + Duration::days(SCHEDULE_HORIZON_DAYS);

        for trigger in date_triggers {
            let trigger_dates = candidate_trigger_dates(trigger.field, account, account_policies);
            for trigger_date in trigger_dates {
                let first_qualification = trigger_date - Duration::days(trigger.days_before);
                let qualification_value = trigger_date.format("%Y-%m-%d").to_string();

                for step in steps {
                    let Some(template) = templates.resolve(&step.template_ref, &account.owner_id)
                    else {
                        continue;
                    };
                    let send_date =
                        first_qualification + Duration::days(step.days_offset.floor() as i64);
                    let send_at = local_to_utc(send_date, send_time, tz);
                    if send_at < window_start || send_at > window_end {
                        continue;
                    }

                    let key = (
                        account.id.clone(),
                        template.id.clone(),
                        qualification_value.clone(),
                    );
                    if !seen.insert(key) {
                        continue;
                    }

                    new_rows.push(build_row(
                        automation,
                        account,
                        template,
                        &step.node_id,
                        recipient_email,
                        send_at,
                        &qualification_value,
                        trigger.field,
                        true,
                    ));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_activation_rows(
        &self,
        automation: &automations::Model,
        account: &accounts::Model,
        recipient_email: &str,
        steps: &[EmailStep],
        templates: &TemplateResolution,
        send_time: NaiveTime,
        tz: Option<Tz>,
        now: DateTime<Utc>,
        seen: &mut HashSet<(String, String, String)>,
        new_rows: &mut Vec<scheduled_emails::ActiveModel>,
    ) {
        let today = now.date_naive();

        // If the first step would land earlier today, the whole journey
        // shifts to start tomorrow.
        let mut base = today;
        if let Some(first) = steps.first() {
            let first_date = today + Duration::days(first.days_offset.floor() as i64);
            if local_to_utc(first_date, send_time, tz) <= now {
                base = today + Duration::days(1);
            }
        }

        for step in steps {
            let Some(template) = templates.resolve(&step.template_ref, &account.owner_id) else {
                continue;
            };
            let send_date = base + Duration::days(step.days_offset.floor() as i64);
            let send_at = local_to_utc(send_date, send_time, tz);

            let key = (
                account.id.clone(),
                template.id.clone(),
                "immediate".to_string(),
            );
            if !seen.insert(key) {
                continue;
            }

            new_rows.push(build_row(
                automation,
                account,
                template,
                &step.node_id,
                recipient_email,
                send_at,
                "immediate",
                TriggerField::Activation,
                false,
            ));
        }
    }

    async fn insert_rows(&self, rows: Vec<scheduled_emails::ActiveModel>) -> Result<u32> {
        let mut inserted = 0u32;
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            match scheduled_emails::Entity::insert_many(chunk.to_vec())
                .exec_without_returning(&*self.db)
                .await
            {
                Ok(count) => inserted += count as u32,
                Err(_) => {
                    // A concurrent refresher may have landed some of these
                    // rows first; retry individually and swallow duplicates.
                    for row in chunk {
                        match scheduled_emails::Entity::insert(row.clone())
                            .exec_without_returning(&*self.db)
                            .await
                        {
                            Ok(count) => inserted += count as u32,
                            Err(e) => {
                                tracing::debug!("Skipping duplicate scheduled email: {e}");
                            }
                        }
                    }
                }
            }
        }
        Ok(inserted)
    }
}

struct TemplateResolution {
    by_id: HashMap<String, email_templates::Model>,
    by_owner_key: HashMap<(String, String), email_templates::Model>,
}

impl TemplateResolution {
    fn resolve(&self, template_ref: &TemplateRef, owner_id: &str) -> Option<&email_templates::Model> {
        match template_ref {
            TemplateRef::Id(id) => self.by_id.get(id),
            TemplateRef::Key(key) => self
                .by_owner_key
                .get(&(owner_id.to_string(), key.clone())),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_row(
    automation: &automations::Model,
    account: &accounts::Model,
    template: &email_templates::Model,
    node_id: &str,
    recipient_email: &str,
    send_at: DateTime<Utc>,
    qualification_value: &str,
    trigger_field: TriggerField,
    requires_verification: bool,
) -> scheduled_emails::ActiveModel {
    let mut row = scheduled_emails::ActiveModel::new();
    row.owner_id = Set(account.owner_id.clone());
    row.automation_id = Set(Some(automation.id.clone()));
    row.account_id = Set(account.id.clone());
    row.template_id = Set(template.id.clone());
    row.node_id = Set(node_id.to_string());
    row.recipient_email = Set(recipient_email.to_string());
    row.recipient_name = Set(Some(account.contact_name()).filter(|n| !n.is_empty()));
    row.from_email = Set(template.from_email.clone());
    row.from_name = Set(template.from_name.clone());
    row.subject = Set(template.subject.clone());
    row.scheduled_for = Set(send_at);
    row.requires_verification = Set(requires_verification);
    row.qualification_value = Set(qualification_value.to_string());
    row.trigger_field = Set(trigger_field.as_str().to_string());
    row
}

fn candidate_trigger_dates(
    field: TriggerField,
    account: &accounts::Model,
    account_policies: &[&policies::Model],
) -> Vec<NaiveDate> {
    let mut dates: Vec<NaiveDate> = match field {
        TriggerField::PolicyExpiration => account_policies
            .iter()
            .filter(|p| p.is_active())
            .filter_map(|p| p.expiration_date)
            .collect(),
        TriggerField::PolicyEffective => account_policies
            .iter()
            .filter(|p| p.is_active())
            .filter_map(|p| p.effective_date)
            .collect(),
        TriggerField::AccountCreated => vec![account.created_at.date_naive()],
        TriggerField::Activation => Vec::new(),
    };
    dates.sort();
    dates.dedup();
    dates
}

fn resolve_timezone(automation_tz: Option<&str>, owner_tz: Option<&str>) -> Option<Tz> {
    let name = automation_tz.or(owner_tz)?;
    match name.parse::<Tz>() {
        Ok(tz) => Some(tz),
        Err(_) => {
            tracing::warn!(timezone = name, "Unknown timezone, falling back to UTC");
            None
        }
    }
}

/// Resolves a local wall-clock send moment to UTC; without a zone the
/// wall-clock is taken as UTC. Ambiguous or skipped local times resolve to
/// the earliest valid instant.
fn local_to_utc(date: NaiveDate, time: NaiveTime, tz: Option<Tz>) -> DateTime<Utc> {
    let naive = date.and_time(time);
    match tz {
        Some(tz) => tz
            .from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive)),
        None => Utc.from_utc_datetime(&naive),
    }
}
