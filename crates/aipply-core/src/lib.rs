//! Core domain model for AIpply opportunity records.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "aipply-core";

/// Unvalidated record proposed by a scraping collaborator, not yet persisted.
///
/// Every field is optional; `deadline` stays free text until the upsert
/// boundary parses it into a calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CandidateRecord {
    pub title: Option<String>,
    pub organization: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub deadline: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub tags: Option<String>,
}

impl CandidateRecord {
    /// Dedup identity: a non-blank URL, if the candidate carries one.
    pub fn identity_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

/// Persisted opportunity row. `url` is the unique dedup key; `created_at`
/// is set once at insert and `updated_at` only on later mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityRecord {
    pub id: i64,
    pub title: String,
    pub organization: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub deadline: Option<NaiveDate>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub url: String,
    pub tags: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

const DEADLINE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %b %Y",
];

/// Best-effort parse of a free-text deadline into a calendar date.
///
/// Returns `None` rather than an error: an unparseable deadline degrades to
/// "no deadline" instead of rejecting the record that carries it.
pub fn parse_deadline(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    DEADLINE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}
