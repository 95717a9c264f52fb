//! Block Kit rendering of a digest. Pure: the same inputs always give the
//! same message, so the clock is passed in through [`Footer`].

use chrono::{DateTime, Utc};
use gemini_engine::GroundingSource;
use slack_client::blocks::{Block, PostMessage, MAX_BLOCKS, MAX_HEADER_CHARS, MAX_SECTION_CHARS};

use crate::config::{TopicConfig, MAX_NEWS_ITEMS_LIMIT};
use crate::news::{Digest, NewsItem};

pub const MAX_SUMMARY_CHARS: usize = 500;
const MAX_TITLE_CHARS: usize = 200;
const MAX_SOURCE_LINKS: usize = 5;
const MAX_SOURCE_LABEL_CHARS: usize = 60;
const MAX_SOURCE_NAME_CHARS: usize = 100;

/// Heading of the trend section. History reading skips it as a title.
pub const TREND_HEADING: &str = ":chart_with_upwards_trend: *Trend*";

pub const EMPTY_DIGEST_TEXT: &str = "No new items found in the past 24 hours.";

/// Run-wide facts shown on every message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

impl Footer {
    fn date_line(&self) -> String {
        format!("📅 {}", self.generated_at.format("%Y-%m-%d"))
    }

    fn model_line(&self) -> String {
        format!(
            "⚡ {} · {}",
            escape_mrkdwn(&self.model),
            self.generated_at.format("%H:%M UTC")
        )
    }
}

/// Escape the three characters Slack treats as control sequences.
pub fn escape_mrkdwn(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Escape, then cut so the escaped text stays within `max_chars`.
/// Never splits an entity.
pub fn escape_truncated(text: &str, max_chars: usize) -> String {
    let escaped = escape_mrkdwn(text);
    if escaped.chars().count() <= max_chars {
        return escaped;
    }

    let budget = max_chars.saturating_sub(1);
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let entity = match c {
            '&' => Some("&amp;"),
            '<' => Some("&lt;"),
            '>' => Some("&gt;"),
            _ => None,
        };
        let width = entity.map_or(1, str::len);
        if used + width > budget {
            break;
        }
        match entity {
            Some(entity) => out.push_str(entity),
            None => out.push(c),
        }
        used += width;
    }
    out.push('…');
    out
}

/// Link labels additionally may not contain the `|` separator.
fn link_label(text: &str, max_chars: usize) -> String {
    escape_truncated(&text.replace('|', "¦"), max_chars)
}

/// Cut at a char boundary, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn item_section(item: &NewsItem) -> String {
    let link = format!("*<{}|{}>*", item.url(), link_label(item.title(), MAX_TITLE_CHARS));

    // Urls are capped well below the section limit, so the link alone always fits
    let room = MAX_SECTION_CHARS.saturating_sub(link.chars().count() + 2);
    if item.summary().is_empty() || room < 2 {
        return link;
    }

    let summary = escape_truncated(item.summary(), room.min(MAX_SUMMARY_CHARS));
    format!("{}\n>{}", link, summary)
}

fn item_context(item: &NewsItem) -> String {
    let source = if item.source().is_empty() {
        gemini_engine::extract_domain(item.url())
    } else {
        item.source().to_string()
    };
    let date = item
        .published_at()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "date unknown".to_string());
    format!("📰 {} · {}", escape_truncated(&source, MAX_SOURCE_NAME_CHARS), date)
}

fn sources_context(sources: &[GroundingSource]) -> Option<String> {
    let mut seen: Vec<&str> = Vec::new();
    let mut text = String::from("🔗");
    let mut len = text.chars().count();

    for source in sources {
        if seen.len() == MAX_SOURCE_LINKS {
            break;
        }
        if seen.contains(&source.uri.as_str()) || source.uri.contains('|') {
            continue;
        }

        let separator = if seen.is_empty() { " " } else { " · " };
        let link = format!(
            "{}<{}|{}>",
            separator,
            source.uri,
            link_label(&source.title, MAX_SOURCE_LABEL_CHARS)
        );
        let link_len = link.chars().count();
        if len + link_len > MAX_SECTION_CHARS {
            continue;
        }

        seen.push(&source.uri);
        text.push_str(&link);
        len += link_len;
    }

    if seen.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn opening(topic: &TopicConfig, footer: &Footer) -> Vec<Block> {
    vec![
        Block::header(truncate_chars(&topic.header, MAX_HEADER_CHARS)),
        Block::context(footer.date_line()),
    ]
}

fn closing(footer: &Footer) -> [Block; 2] {
    [Block::Divider, Block::context(footer.model_line())]
}

fn message(topic: &TopicConfig, blocks: Vec<Block>) -> PostMessage {
    debug_assert!(blocks.len() <= MAX_BLOCKS);
    PostMessage {
        channel: topic.destination_id.clone(),
        text: topic.header.clone(),
        blocks,
        unfurl_links: topic.unfurl_links,
        unfurl_media: topic.unfurl_media,
    }
}

/// Header, one card per item, optional trend and sources, footer.
pub fn format_digest(topic: &TopicConfig, digest: &Digest, footer: &Footer) -> PostMessage {
    let mut blocks = opening(topic, footer);

    for item in digest.items.iter().take(MAX_NEWS_ITEMS_LIMIT) {
        blocks.push(Block::Divider);
        blocks.push(Block::section(item_section(item)));
        blocks.push(Block::context(item_context(item)));
    }

    if let Some(trend) = digest.trend.as_deref().filter(|t| !t.is_empty()) {
        blocks.push(Block::Divider);
        let room = MAX_SECTION_CHARS - TREND_HEADING.chars().count() - 1;
        blocks.push(Block::section(format!(
            "{}\n{}",
            TREND_HEADING,
            escape_truncated(trend, room)
        )));
    }

    if let Some(sources) = sources_context(&digest.sources) {
        blocks.push(Block::context(sources));
    }

    blocks.extend(closing(footer));
    message(topic, blocks)
}

/// The single well-defined message for a topic with nothing new.
pub fn format_empty(topic: &TopicConfig, footer: &Footer) -> PostMessage {
    let mut blocks = opening(topic, footer);
    blocks.push(Block::Divider);
    blocks.push(Block::section(EMPTY_DIGEST_TEXT));
    blocks.extend(closing(footer));
    message(topic, blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn topic() -> TopicConfig {
        TopicConfig::new("生成AI", "C1", Some("🤖 News")).unwrap()
    }

    fn footer() -> Footer {
        Footer {
            model: "gemini-2.5-pro".to_string(),
            generated_at: Utc.with_ymd_and_hms(2026, 10, 18, 0, 5, 0).unwrap(),
        }
    }

    fn digest() -> Digest {
        Digest {
            items: vec![
                NewsItem::new(
                    "A <b> & c | d",
                    "Summary one",
                    "https://a.example/x",
                    "Example Wire",
                    NaiveDate::from_ymd_opt(2026, 10, 17),
                )
                .unwrap(),
                NewsItem::new("Second", "", "https://b.example/y", "", None).unwrap(),
            ],
            trend: Some("Models get <smaller>".to_string()),
            sources: vec![
                GroundingSource {
                    title: "a.example".to_string(),
                    uri: "https://grounding.example/1".to_string(),
                },
                GroundingSource {
                    title: "dup".to_string(),
                    uri: "https://grounding.example/1".to_string(),
                },
            ],
        }
    }

    fn all_texts(message: &PostMessage) -> Vec<String> {
        message
            .blocks
            .iter()
            .flat_map(|b| b.texts())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_digest_layout() {
        let message = format_digest(&topic(), &digest(), &footer());

        assert_eq!(message.channel, "C1");
        assert_eq!(message.text, "🤖 News");
        assert!(!message.unfurl_links);

        let texts = all_texts(&message);
        assert_eq!(
            texts,
            vec![
                "🤖 News".to_string(),
                "📅 2026-10-18".to_string(),
                "*<https://a.example/x|A &lt;b&gt; &amp; c ¦ d>*\n>Summary one".to_string(),
                "📰 Example Wire · 2026-10-17".to_string(),
                "*<https://b.example/y|Second>*".to_string(),
                "📰 b.example · date unknown".to_string(),
                ":chart_with_upwards_trend: *Trend*\nModels get &lt;smaller&gt;".to_string(),
                "🔗 <https://grounding.example/1|a.example>".to_string(),
                "⚡ gemini-2.5-pro · 00:05 UTC".to_string(),
            ]
        );
        assert_eq!(message.blocks.first(), Some(&Block::header("🤖 News")));
        assert_eq!(message.blocks[message.blocks.len() - 2], Block::Divider);
    }

    #[test]
    fn test_formatting_is_deterministic() {
        let first = serde_json::to_string(&format_digest(&topic(), &digest(), &footer())).unwrap();
        let second = serde_json::to_string(&format_digest(&topic(), &digest(), &footer())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_every_item_links_a_title() {
        let digest = digest();
        let message = format_digest(&topic(), &digest, &footer());
        let sections: Vec<String> = message
            .blocks
            .iter()
            .filter(|b| matches!(b, Block::Section { .. }))
            .flat_map(|b| b.texts())
            .map(str::to_string)
            .collect();

        for item in &digest.items {
            assert!(!item.title().is_empty());
            assert!(sections.iter().any(|s| s.starts_with(&format!("*<{}|", item.url()))));
        }
        assert!(!sections.iter().any(|s| s.contains("<|") || s.contains("|>")));
    }

    #[test]
    fn test_long_fields_are_truncated() {
        let long_summary = "あ".repeat(MAX_SUMMARY_CHARS + 50);
        let digest = Digest {
            items: vec![NewsItem::new("T", &long_summary, "https://a.example/x", "S", None).unwrap()],
            ..Default::default()
        };
        let mut topic = topic();
        topic.header = "h".repeat(MAX_HEADER_CHARS + 10);

        let message = format_digest(&topic, &digest, &footer());
        let header = message.blocks[0].texts()[0].chars().count();
        assert_eq!(header, MAX_HEADER_CHARS);

        let section = message.blocks[3].texts()[0].to_string();
        let quoted = section.split("\n>").nth(1).unwrap();
        assert_eq!(quoted.chars().count(), MAX_SUMMARY_CHARS);
        assert!(quoted.ends_with('…'));
    }

    #[test]
    fn test_block_budget_at_item_limit() {
        let items = (0..MAX_NEWS_ITEMS_LIMIT)
            .map(|i| NewsItem::new(&format!("T{}", i), "s", &format!("https://a.example/{}", i), "S", None).unwrap())
            .collect();
        let mut digest = digest();
        digest.items = items;

        let message = format_digest(&topic(), &digest, &footer());
        assert!(message.blocks.len() <= MAX_BLOCKS);
    }

    #[test]
    fn test_empty_digest_message() {
        let message = format_empty(&topic(), &footer());
        let sections: Vec<&Block> = message
            .blocks
            .iter()
            .filter(|b| matches!(b, Block::Section { .. }))
            .collect();
        assert_eq!(sections, vec![&Block::section(EMPTY_DIGEST_TEXT)]);
        assert_eq!(message.text, "🤖 News");
    }

    fn entities_intact(text: &str) -> bool {
        text.match_indices('&').all(|(i, _)| {
            let rest = &text[i..];
            rest.starts_with("&amp;") || rest.starts_with("&lt;") || rest.starts_with("&gt;")
        })
    }

    #[test]
    fn test_escaping_never_pushes_sections_past_the_limit() {
        let long_url = format!("https://a.example/{}", "p".repeat(1900));
        let digest = Digest {
            items: vec![
                NewsItem::new(&"R&D <AI> ".repeat(100), &"&<>".repeat(400), &long_url, &"&".repeat(300), None)
                    .unwrap(),
                NewsItem::new("Plain", &"Q&A ".repeat(300), "https://b.example/y", "S", None).unwrap(),
            ],
            trend: Some("R&D ".repeat(800)),
            sources: vec![GroundingSource {
                title: "&".repeat(100),
                uri: "https://grounding.example/1".to_string(),
            }],
        };

        let message = format_digest(&topic(), &digest, &footer());
        for text in all_texts(&message) {
            assert!(
                text.chars().count() <= MAX_SECTION_CHARS,
                "{} chars: {}…",
                text.chars().count(),
                text.chars().take(40).collect::<String>()
            );
            assert!(entities_intact(&text), "split entity in {:?}", text);
        }

        let first = message.blocks[3].texts()[0].to_string();
        assert!(first.starts_with(&format!("*<{}|R&amp;D &lt;AI&gt;", long_url)));
        assert!(first.contains("\n>&amp;&lt;&gt;"));
    }

    #[test]
    fn test_escape_truncated() {
        assert_eq!(escape_truncated("a<b", 10), "a&lt;b");
        assert_eq!(escape_truncated("&&&", 10), "&amp;…");
        assert_eq!(escape_truncated("&&&", 11), "&amp;&amp;…");
        assert_eq!(escape_truncated("ab&cd", 4), "ab…");
        assert_eq!(escape_truncated("日本&語", 4), "日本…");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 3), "abc");
        assert_eq!(truncate_chars("abcd", 3), "ab…");
        assert_eq!(truncate_chars("日本語テキスト", 4), "日本語…");
    }
}
