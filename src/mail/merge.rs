use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::sync::OnceLock;

use crate::database::{accounts, owners, scheduled_emails};

fn merge_token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid merge regex"))
}

/// Everything merge-field resolution can draw on. `today` is passed in so
/// rendering is deterministic.
pub struct MergeContext<'a> {
    pub scheduled: &'a scheduled_emails::Model,
    pub account: Option<&'a accounts::Model>,
    pub today: NaiveDate,
}

/// Case-insensitive substitution of the recognized `{{field}}` tokens.
/// Unresolved fields become empty strings, so rendering twice is a no-op
/// as long as field values don't themselves contain `{{…}}` literals.
pub fn render_merge_fields(input: &str, ctx: &MergeContext) -> String {
    merge_token_regex()
        .replace_all(input, |caps: &regex::Captures| {
            resolve_field(&caps[1].to_lowercase(), ctx)
        })
        .into_owned()
}

fn resolve_field(field: &str, ctx: &MergeContext) -> String {
    let account = ctx.account;
    let opt = |v: Option<&str>| v.unwrap_or_default().to_string();

    match field {
        "first_name" => opt(account.and_then(|a| a.first_name.as_deref())),
        "last_name" => opt(account.and_then(|a| a.last_name.as_deref())),
        "full_name" | "name" => account.map(|a| a.contact_name()).unwrap_or_default(),
        "company_name" => opt(account.and_then(|a| a.name.as_deref())),
        "email" | "recipient_email" => ctx.scheduled.recipient_email.clone(),
        "phone" => opt(account.and_then(|a| a.phone.as_deref())),
        "address" => opt(account.and_then(|a| a.address.as_deref())),
        "city" => opt(account.and_then(|a| a.city.as_deref())),
        "state" => opt(account.and_then(|a| a.state.as_deref())),
        "zip" | "postal_code" => opt(account.and_then(|a| a.zip.as_deref())),
        "recipient_name" => ctx
            .scheduled
            .recipient_name
            .clone()
            .or_else(|| account.map(|a| a.contact_name()))
            .unwrap_or_default(),
        "today" => ctx.today.format("%Y-%m-%d").to_string(),
        "current_year" => ctx.today.year().to_string(),
        "trigger_date" => {
            let qv = &ctx.scheduled.qualification_value;
            if qv == "immediate" {
                String::new()
            } else {
                qv.clone()
            }
        }
        _ => String::new(),
    }
}

pub fn unsubscribe_link(base: &str, scheduled_email_id: &str, recipient_email: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(recipient_email.as_bytes()).collect();
    format!("{base}?id={scheduled_email_id}&email={encoded}")
}

/// Footer: optional signature HTML, a single-line pipe-separated company
/// block, and the unsubscribe link.
pub fn assemble_footer(
    owner: Option<&owners::Model>,
    unsubscribe_base: &str,
    scheduled_email_id: &str,
    recipient_email: &str,
) -> String {
    let mut footer = String::new();

    if let Some(signature) = owner.and_then(|o| o.signature_html.as_deref()) {
        if !signature.is_empty() {
            footer.push_str(signature);
        }
    }

    let company_parts: Vec<&str> = owner
        .map(|o| {
            [
                o.company_name.as_deref(),
                o.company_address.as_deref(),
                o.company_phone.as_deref(),
                o.company_website.as_deref(),
            ]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect()
        })
        .unwrap_or_default();
    if !company_parts.is_empty() {
        footer.push_str(&format!(
            "<p style=\"color:#888;font-size:12px;margin:16px 0 4px;\">{}</p>",
            company_parts.join(" | ")
        ));
    }

    let link = unsubscribe_link(unsubscribe_base, scheduled_email_id, recipient_email);
    footer.push_str(&format!(
        "<p style=\"color:#888;font-size:12px;margin:4px 0;\"><a href=\"{link}\">Unsubscribe</a></p>"
    ));

    footer
}

/// Appends the footer inside `</body>` when the content has one, otherwise
/// at the end.
pub fn append_footer(html: &str, footer: &str) -> String {
    if let Some(idx) = html.to_lowercase().rfind("</body>") {
        let mut out = String::with_capacity(html.len() + footer.len());
        out.push_str(&html[..idx]);
        out.push_str(footer);
        out.push_str(&html[idx..]);
        out
    } else {
        format!("{html}{footer}")
    }
}
