use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use slack_client::blocks::HistoryMessage;
use slack_client::{BotIdentity, SlackClient};
use std::sync::OnceLock;
use tracing::{debug, info, instrument, warn};

use crate::config::TopicConfig;
use crate::error::CuratorError;
use crate::formatter::TREND_HEADING;
use crate::news::ExclusionSet;

const HISTORY_PAGE_SIZE: u32 = 200;
const MAX_HISTORY_PAGES: usize = 5;

/// Source of the previously-posted keys for one destination.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn exclusion_set(&self, topic: &TopicConfig) -> Result<ExclusionSet, CuratorError>;
}

/// `<https://example.com/a|Label>` or `<https://example.com/a>`
fn link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"<(https?://[^|>\s]+)(?:\|([^>]*))?>").expect("link pattern is valid")
    })
}

/// A bold line, optionally prefixed by an emoji code or a list number:
/// `*Title*`, `:newspaper: *Title*`, `*1. Title*`
fn bold_title_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^(?::[a-zA-Z0-9_+-]+:\s*)?\*(?:\d+\.\s*)?([^*\n]+)\*")
            .expect("bold title pattern is valid")
    })
}

fn unescape_mrkdwn(s: &str) -> String {
    s.replace("&lt;", "<").replace("&gt;", ">").replace("&amp;", "&")
}

/// Record every url and title found in one section's mrkdwn.
pub fn collect_keys(text: &str, set: &mut ExclusionSet) {
    for caps in link_pattern().captures_iter(text) {
        set.insert_url(&unescape_mrkdwn(&caps[1]));
        if let Some(label) = caps.get(2) {
            set.insert_title(&unescape_mrkdwn(label.as_str()));
        }
    }

    for caps in bold_title_pattern().captures_iter(text) {
        if &caps[0] == TREND_HEADING {
            continue;
        }
        let title = caps[1].trim();
        // Linked titles were already recorded above
        if !title.starts_with('<') {
            set.insert_title(&unescape_mrkdwn(title));
        }
    }
}

/// Build the exclusion set from a channel's messages, keeping only our own posts.
pub fn exclusion_set_from_messages(identity: &BotIdentity, messages: &[HistoryMessage]) -> ExclusionSet {
    let mut set = ExclusionSet::new();
    for message in messages.iter().filter(|m| identity.authored(m)) {
        for text in message.section_texts() {
            collect_keys(text, &mut set);
        }
    }
    set
}

/// Reads the recent history of each destination channel from Slack.
pub struct SlackHistory {
    client: SlackClient,
    identity: Option<BotIdentity>,
    lookback: Duration,
    now: DateTime<Utc>,
}

impl SlackHistory {
    /// Resolve the bot identity once. Without it no message can be attributed,
    /// so every later fetch reports an error and dedup falls back to nothing.
    pub async fn connect(client: SlackClient, lookback_days: u32, now: DateTime<Utc>) -> Self {
        let identity = match client.auth_test().await {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(error = %e, "Could not resolve Slack bot identity");
                None
            }
        };

        Self {
            client,
            identity,
            lookback: Duration::days(i64::from(lookback_days)),
            now,
        }
    }

    fn oldest(&self) -> i64 {
        (self.now - self.lookback).timestamp()
    }
}

#[async_trait]
impl HistorySource for SlackHistory {
    #[instrument(skip(self, topic), fields(channel = %topic.destination_id))]
    async fn exclusion_set(&self, topic: &TopicConfig) -> Result<ExclusionSet, CuratorError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| CuratorError::HistoryFetch("bot identity is unknown".into()))?;

        let messages = self
            .client
            .recent_messages(&topic.destination_id, self.oldest(), HISTORY_PAGE_SIZE, MAX_HISTORY_PAGES)
            .await
            .map_err(CuratorError::HistoryFetch)?;

        let own = messages.iter().filter(|m| identity.authored(m)).count();
        let set = exclusion_set_from_messages(identity, &messages);

        info!(
            messages = messages.len(),
            own_messages = own,
            keys = set.len(),
            lookback_days = self.lookback.num_days(),
            "Built exclusion set from channel history"
        );
        debug!(entries = ?set.prompt_entries(20), "Recent keys");
        Ok(set)
    }
}
