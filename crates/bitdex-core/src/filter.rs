//! Derived filter facets.
//!
//! Documents never carry filter labels directly. The index derives date
//! buckets from `created_at` and `updated_at`, and timeframe names used in
//! queries (`today`, `thisWeek`, ...) resolve to those buckets.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

use crate::error::{IndexError, IndexResult};
use crate::models::Document;

pub const CREATED_PREFIX: &str = "date/created";
pub const UPDATED_PREFIX: &str = "date/updated";

/// Query-time timeframe shorthands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Today,
    Yesterday,
    ThisWeek,
    ThisMonth,
    ThisYear,
}

impl Timeframe {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "today" => Some(Self::Today),
            "yesterday" => Some(Self::Yesterday),
            "thisWeek" => Some(Self::ThisWeek),
            "thisMonth" => Some(Self::ThisMonth),
            "thisYear" => Some(Self::ThisYear),
            _ => None,
        }
    }

    /// Bucket labels under `prefix` that together cover this timeframe
    /// relative to `now`.
    pub fn labels(&self, prefix: &str, now: DateTime<Utc>) -> Vec<String> {
        let today = now.date_naive();
        match self {
            Self::Today => vec![day_label(prefix, today)],
            Self::Yesterday => vec![day_label(prefix, today - Duration::days(1))],
            Self::ThisWeek => {
                // ISO week, Monday first, up to and including today.
                let back = today.weekday().num_days_from_monday() as i64;
                (0..=back)
                    .map(|d| day_label(prefix, today - Duration::days(back - d)))
                    .collect()
            }
            Self::ThisMonth => vec![month_label(prefix, today)],
            Self::ThisYear => vec![year_label(prefix, today)],
        }
    }
}

fn year_label(prefix: &str, d: NaiveDate) -> String {
    format!("{}/{:04}", prefix, d.year())
}

fn month_label(prefix: &str, d: NaiveDate) -> String {
    format!("{}/{:04}-{:02}", prefix, d.year(), d.month())
}

fn day_label(prefix: &str, d: NaiveDate) -> String {
    format!("{}/{:04}-{:02}-{:02}", prefix, d.year(), d.month(), d.day())
}

/// Year, month and day buckets for one timestamp.
pub fn date_buckets(prefix: &str, at: DateTime<Utc>) -> [String; 3] {
    let d = at.date_naive();
    [year_label(prefix, d), month_label(prefix, d), day_label(prefix, d)]
}

/// Every filter label a document contributes.
pub fn derive_filters(doc: &Document) -> Vec<String> {
    let mut out: Vec<String> = date_buckets(CREATED_PREFIX, doc.created_at)
        .into_iter()
        .chain(date_buckets(UPDATED_PREFIX, doc.updated_at))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Expand timeframe shorthands in a filter query array.
///
/// `today` and `created:today` resolve against `created_at`,
/// `updated:today` against `updated_at`. A `!` prefix is preserved on every
/// expanded label. Anything else passes through unchanged.
pub fn resolve_filters(filters: &[String], now: DateTime<Utc>) -> IndexResult<Vec<String>> {
    let mut out = Vec::with_capacity(filters.len());
    for raw in filters {
        let (negated, body) = match raw.strip_prefix(crate::bitmap::NEGATION_PREFIX) {
            Some(rest) => (true, rest),
            None => (false, raw.as_str()),
        };
        let (prefix, name) = match body.split_once(':') {
            Some(("created", name)) => (CREATED_PREFIX, name),
            Some(("updated", name)) => (UPDATED_PREFIX, name),
            Some((field, _)) if !body.contains('/') => {
                return Err(IndexError::validation(
                    "resolve_filters",
                    format!("unknown timeframe field '{}' in '{}'", field, raw),
                ));
            }
            _ => (CREATED_PREFIX, body),
        };
        match Timeframe::parse(name) {
            Some(tf) => {
                for label in tf.labels(prefix, now) {
                    out.push(if negated { format!("!{}", label) } else { label });
                }
            }
            None => out.push(raw.clone()),
        }
    }
    Ok(out)
}
