//! User report built from the user service's listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use upstream::ResponseBody;

const TITLE_EN: &str = "User Report";
const TITLE_AM: &str = "የተጠቃሚ መረጃ ሪፖርት";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReport {
    pub title: String,
    pub lang: String,
    pub total_users: u64,
    pub new_users_this_month: u64,
    pub active_users: u64,
    pub generated_at: DateTime<Utc>,
}

impl UserReport {
    /// Report with every count at zero, served when the listing is unavailable.
    pub fn empty(lang: &str, now: DateTime<Utc>) -> Self {
        Self {
            title: title(lang).to_string(),
            lang: lang.to_string(),
            total_users: 0,
            new_users_this_month: 0,
            active_users: 0,
            generated_at: now,
        }
    }

    /// Count the users in one listing page.
    ///
    /// `advertised_total` (from pagination headers or the wrapper) wins over
    /// the page length when it is larger.
    pub fn from_listing(
        body: &ResponseBody,
        advertised_total: Option<u64>,
        lang: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let records = body.records();
        let month = now.format("%Y-%m").to_string();

        let new_users_this_month = records
            .iter()
            .filter(|r| created_in(r, &month))
            .count() as u64;
        let active_users = records.iter().filter(|r| is_active(r)).count() as u64;
        let page_total = records.len() as u64;

        Self {
            total_users: advertised_total.map_or(page_total, |t| t.max(page_total)),
            new_users_this_month,
            active_users,
            ..Self::empty(lang, now)
        }
    }
}

pub fn title(lang: &str) -> &'static str {
    match lang {
        "am" => TITLE_AM,
        _ => TITLE_EN,
    }
}

fn created_in(record: &Value, month: &str) -> bool {
    ["created_at", "createdAt"]
        .iter()
        .find_map(|field| record.get(*field).and_then(Value::as_str))
        .is_some_and(|created| created.starts_with(month))
}

fn is_active(record: &Value) -> bool {
    match record.get("is_active") {
        Some(Value::Bool(active)) => *active,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}
