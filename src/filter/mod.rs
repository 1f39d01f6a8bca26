use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::database::{accounts, policies};
use crate::error::Result;

/// Tenant filter DSL: OR between groups, AND within a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub groups: Vec<FilterGroup>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub rules: Vec<FilterRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

impl FilterConfig {
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(json)?)
    }
}

/// Date-anchored trigger fields. `Activation` is the synthetic field used
/// for non-date automations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerField {
    PolicyExpiration,
    PolicyEffective,
    AccountCreated,
    Activation,
}

impl TriggerField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerField::PolicyExpiration => "policy_expiration",
            TriggerField::PolicyEffective => "policy_effective",
            TriggerField::AccountCreated => "account_created",
            TriggerField::Activation => "activation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "policy_expiration" => Some(TriggerField::PolicyExpiration),
            "policy_effective" => Some(TriggerField::PolicyEffective),
            "account_created" => Some(TriggerField::AccountCreated),
            "activation" => Some(TriggerField::Activation),
            _ => None,
        }
    }
}

const DATE_OPERATORS: [&str; 4] = [
    "in_next_days",
    "in_last_days",
    "less_than_days_future",
    "more_than_days_future",
];

pub fn is_date_trigger(rule: &FilterRule) -> bool {
    TriggerField::parse(&rule.field).map_or(false, |f| f != TriggerField::Activation)
        && DATE_OPERATORS.contains(&rule.operator.as_str())
}

/// A collapsed per-field date trigger. `days_before` is the offset from the
/// anchor date at which the journey starts; negative means days after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTrigger {
    pub field: TriggerField,
    pub days_before: i64,
}

/// Splits the filter into date triggers and the remaining (non-date) rules.
/// Multiple date rules on one field collapse to a single `days_before`:
/// the inner bound (`in_next_days` / `more_than_days_future`, max wins) is
/// where the journey starts; `less_than_days_future` counts only without an
/// inner bound; `in_last_days` yields a negative offset.
pub fn partition_rules(config: &FilterConfig) -> (Vec<DateTrigger>, FilterConfig) {
    let mut inner: HashMap<TriggerField, i64> = HashMap::new();
    let mut outer: HashMap<TriggerField, i64> = HashMap::new();
    let mut after: HashMap<TriggerField, i64> = HashMap::new();
    let mut non_date = FilterConfig::default();

    for group in &config.groups {
        let mut kept = FilterGroup::default();
        for rule in &group.rules {
            if !is_date_trigger(rule) {
                kept.rules.push(rule.clone());
                continue;
            }
            let field = match TriggerField::parse(&rule.field) {
                Some(f) => f,
                None => continue,
            };
            let days = rule.value.trim().parse::<f64>().unwrap_or(0.0) as i64;
            match rule.operator.as_str() {
                "in_next_days" | "more_than_days_future" => {
                    let entry = inner.entry(field).or_insert(days);
                    *entry = (*entry).max(days);
                }
                "less_than_days_future" => {
                    let entry = outer.entry(field).or_insert(days);
                    *entry = (*entry).max(days);
                }
                "in_last_days" => {
                    let entry = after.entry(field).or_insert(days);
                    *entry = (*entry).max(days);
                }
                _ => {}
            }
        }
        non_date.groups.push(kept);
    }

    let mut fields: Vec<TriggerField> = inner
        .keys()
        .chain(outer.keys())
        .chain(after.keys())
        .copied()
        .collect();
    fields.sort_by_key(|f| f.as_str());
    fields.dedup();

    let triggers = fields
        .into_iter()
        .map(|field| {
            let days_before = if let Some(d) = inner.get(&field) {
                *d
            } else if let Some(d) = outer.get(&field) {
                *d
            } else {
                -after.get(&field).copied().unwrap_or(0)
            };
            DateTrigger { field, days_before }
        })
        .collect();

    (triggers, non_date)
}

/// Applies the non-date portion of the filter to an account and its active
/// policies. Date-trigger rules evaluate as pass here; the scheduler turns
/// them into send dates separately.
pub fn account_matches(
    account: &accounts::Model,
    account_policies: &[&policies::Model],
    config: &FilterConfig,
) -> bool {
    if config.groups.is_empty() || config.groups.iter().all(|g| g.rules.is_empty()) {
        return true;
    }

    config.groups.iter().any(|group| {
        group
            .rules
            .iter()
            .all(|rule| is_date_trigger(rule) || rule_matches(account, account_policies, rule))
    })
}

fn rule_matches(
    account: &accounts::Model,
    account_policies: &[&policies::Model],
    rule: &FilterRule,
) -> bool {
    let field = rule.field.to_lowercase();
    match field.as_str() {
        "policy_type" | "line_of_business" => {
            let values: Vec<&str> = account_policies
                .iter()
                .filter(|p| p.is_active())
                .map(|p| p.line_of_business.as_str())
                .collect();
            any_value_matches(&values, &rule.operator, &rule.value)
        }
        "policy_term" | "term" => {
            let values: Vec<&str> = account_policies
                .iter()
                .filter(|p| p.is_active())
                .filter_map(|p| p.term.as_deref())
                .collect();
            any_value_matches(&values, &rule.operator, &rule.value)
        }
        _ => {
            let actual = account_field(account, &field).unwrap_or_default();
            string_op_matches(&rule.operator, &actual, &rule.value)
        }
    }
}

fn account_field(account: &accounts::Model, field: &str) -> Option<String> {
    let value = match field {
        "name" | "account_name" | "company_name" => account.name.clone(),
        "email" => account.primary_email().map(str::to_string),
        "person_email" => account.person_email.clone(),
        "first_name" => account.first_name.clone(),
        "last_name" => account.last_name.clone(),
        "phone" => account.phone.clone(),
        "address" => account.address.clone(),
        "city" => account.city.clone(),
        "state" => account.state.clone(),
        "zip" | "postal_code" => account.zip.clone(),
        "email_validation_status" => Some(account.email_validation_status.clone()),
        _ => None,
    };
    value.filter(|v| !v.is_empty())
}

/// A rule against a policy attribute matches if ANY active policy satisfies
/// it; emptiness operators look at the whole set.
fn any_value_matches(values: &[&str], operator: &str, expected: &str) -> bool {
    match operator {
        "is_empty" => values.is_empty(),
        "is_not_empty" => !values.is_empty(),
        _ => values
            .iter()
            .any(|actual| string_op_matches(operator, actual, expected)),
    }
}

fn string_op_matches(operator: &str, actual: &str, expected: &str) -> bool {
    let actual = actual.trim().to_lowercase();
    let expected = expected.trim().to_lowercase();
    match operator {
        "equals" | "is" => actual == expected,
        "not_equals" | "is_not" => actual != expected,
        "contains" => actual.contains(&expected),
        "not_contains" => !actual.contains(&expected),
        "starts_with" => actual.starts_with(&expected),
        "ends_with" => actual.ends_with(&expected),
        "is_empty" => actual.is_empty(),
        "is_not_empty" => !actual.is_empty(),
        "in" => expected
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == actual),
        "not_in" => !expected
            .split(',')
            .map(str::trim)
            .any(|candidate| candidate == actual),
        _ => {
            tracing::debug!(operator, "Unknown filter operator, rule fails");
            false
        }
    }
}
