use chrono::NaiveDate;
use gemini_engine::GroundingSource;
use std::collections::HashSet;
use url::Url;

use crate::error::InvalidRecord;

/// Longest url accepted from the model; longer ones are almost always garbage.
pub const MAX_URL_CHARS: usize = 2000;

/// Query parameters that identify a campaign, not a page.
const TRACKING_PARAM_PREFIXES: [&str; 2] = ["utm_", "fbclid"];

/// A validated news item. Title and url are guaranteed non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsItem {
    title: String,
    summary: String,
    url: String,
    source: String,
    published_at: Option<NaiveDate>,
}

impl NewsItem {
    pub fn new(
        title: &str,
        summary: &str,
        url: &str,
        source: &str,
        published_at: Option<NaiveDate>,
    ) -> Result<Self, InvalidRecord> {
        let title = collapse_whitespace(title);
        if title.is_empty() {
            return Err(InvalidRecord::MissingTitle);
        }

        let url = url.trim();
        if url.is_empty() {
            return Err(InvalidRecord::MissingUrl);
        }
        let parsed = Url::parse(url).map_err(|_| InvalidRecord::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(InvalidRecord::InvalidUrl(url.to_string()));
        }
        let url = encode_link_separator(parsed.as_str());
        if url.chars().count() > MAX_URL_CHARS {
            return Err(InvalidRecord::InvalidUrl(format!("{} chars", url.chars().count())));
        }

        Ok(Self {
            title,
            summary: collapse_whitespace(summary),
            url,
            source: collapse_whitespace(source),
            published_at,
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn published_at(&self) -> Option<NaiveDate> {
        self.published_at
    }

    /// Preferred identity of the item across runs: its normalized url.
    pub fn dedupe_key(&self) -> String {
        normalize_url(&self.url).unwrap_or_else(|| normalize_title(&self.title))
    }

    pub fn title_key(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Everything one generation call produced, after validation.
#[derive(Debug, Clone, Default)]
pub struct Digest {
    pub items: Vec<NewsItem>,
    pub trend: Option<String>,
    pub sources: Vec<GroundingSource>,
}

impl Digest {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Keys of items already posted to one destination.
///
/// Holds normalized urls and titles for matching, plus the raw values in the
/// order they were seen so the prompt can list them.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    keys: HashSet<String>,
    entries: Vec<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_url(&mut self, raw: &str) {
        if let Some(key) = normalize_url(raw) {
            if self.keys.insert(key) {
                self.entries.push(raw.trim().to_string());
            }
        }
    }

    pub fn insert_title(&mut self, raw: &str) {
        let key = normalize_title(raw);
        if key.is_empty() {
            return;
        }
        if self.keys.insert(key) {
            self.entries.push(collapse_whitespace(raw));
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    /// True when either the item's url or its title was already posted.
    pub fn excludes(&self, item: &NewsItem) -> bool {
        self.keys.contains(&item.dedupe_key()) || self.keys.contains(&item.title_key())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The first `limit` entries in the order they were recorded.
    pub fn prompt_entries(&self, limit: usize) -> &[String] {
        &self.entries[..self.entries.len().min(limit)]
    }
}

/// Canonical form of a url for duplicate detection: host without `www.`,
/// path without trailing slash, query minus tracking parameters. Scheme and
/// fragment are dropped.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !TRACKING_PARAM_PREFIXES.iter().any(|p| k.starts_with(p)))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(kept);
    }

    let host = url.host_str()?.trim_start_matches("www.").to_string();
    let path = encode_link_separator(url.path().trim_end_matches('/'));
    let query = url.query().map(|q| format!("?{}", q)).unwrap_or_default();
    Some(format!("{}{}{}", host, path, query))
}

/// Canonical form of a title: trimmed, whitespace collapsed, lowercased.
/// `¦` folds back to `|`, since link labels are posted with the former.
pub fn normalize_title(raw: &str) -> String {
    collapse_whitespace(raw).replace('¦', "|").to_lowercase()
}

/// `Url` leaves `|` in paths as is, but Slack reads it as the end of a link target.
fn encode_link_separator(url: &str) -> String {
    url.replace('|', "%7C")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
