//! Turns untrusted model text into validated [`NewsItem`]s.
//!
//! The model is asked for JSON but grounded responses are free text, so the
//! parser tolerates code fences, surrounding prose, a bare array instead of
//! the `{"items": [...]}` envelope, and loosely typed fields. Anything it can
//! not use is dropped per record and counted.

use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::error::InvalidRecord;
use crate::news::{ExclusionSet, NewsItem};

#[derive(Deserialize, Debug, Default)]
struct RawItem {
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "description")]
    summary: Option<String>,
    #[serde(default, alias = "link")]
    url: Option<String>,
    #[serde(default, alias = "publisher")]
    source: Option<String>,
    #[serde(default, alias = "date")]
    published_at: Option<String>,
}

/// Result of parsing one response, with counts for the run log.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub items: Vec<NewsItem>,
    pub trend: Option<String>,
    /// Records that failed validation.
    pub rejected: usize,
    /// Records repeating an earlier record of the same response.
    pub duplicates: usize,
    /// Records matching the exclusion set.
    pub excluded: usize,
    /// Valid records beyond the item limit.
    pub truncated: usize,
}

/// Parse, validate, dedupe and filter one model response.
pub fn parse_response(text: &str, exclusions: &ExclusionSet, max_items: usize) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();

    let Some(value) = extract_json(text) else {
        warn!(text_len = text.len(), "Model response contained no parseable JSON");
        return parsed;
    };

    let (records, trend) = match value {
        Value::Array(records) => (records, None),
        Value::Object(mut map) => {
            let records = match map.remove("items") {
                Some(Value::Array(records)) => records,
                _ => Vec::new(),
            };
            let trend = match map.remove("trend") {
                Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            };
            (records, trend)
        }
        _ => (Vec::new(), None),
    };
    parsed.trend = trend;

    let mut seen: HashSet<String> = HashSet::new();
    for record in records {
        let item = match validate_record(record) {
            Ok(item) => item,
            Err(reason) => {
                debug!(reason = %reason, "Dropped invalid record");
                parsed.rejected += 1;
                continue;
            }
        };

        let url_key = item.dedupe_key();
        let title_key = item.title_key();
        if seen.contains(&url_key) || seen.contains(&title_key) {
            parsed.duplicates += 1;
            continue;
        }
        seen.insert(url_key);
        seen.insert(title_key);

        if exclusions.excludes(&item) {
            parsed.excluded += 1;
            continue;
        }

        if parsed.items.len() >= max_items {
            parsed.truncated += 1;
            continue;
        }
        parsed.items.push(item);
    }

    if parsed.rejected > 0 {
        warn!(rejected = parsed.rejected, "Dropped records that failed validation");
    }
    parsed
}

fn validate_record(record: Value) -> Result<NewsItem, InvalidRecord> {
    let raw: RawItem = serde_json::from_value(record).map_err(|_| InvalidRecord::Malformed)?;

    NewsItem::new(
        raw.title.as_deref().unwrap_or_default(),
        raw.summary.as_deref().unwrap_or_default(),
        raw.url.as_deref().unwrap_or_default(),
        raw.source.as_deref().unwrap_or_default(),
        raw.published_at.as_deref().and_then(parse_published_at),
    )
}

/// `YYYY-MM-DD` or an RFC 3339 timestamp; anything else is unknown.
pub fn parse_published_at(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

/// Find the JSON payload in a model response.
fn extract_json(text: &str) -> Option<Value> {
    let clean = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value) = serde_json::from_str::<Value>(clean) {
        return Some(value);
    }

    // Prose around the payload: try the widest object, then the widest array.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (clean.find(open), clean.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<Value>(&clean[start..=end]) {
                    return Some(value);
                }
            }
        }
    }
    None
}
