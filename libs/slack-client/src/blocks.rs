//! Block Kit layout types, outbound and inbound.
//!
//! Outbound blocks are strict enums so a malformed message cannot be built.
//! Inbound history is decoded through lenient views instead: channels contain
//! block types we never post, and one odd message must not fail the read.

use serde::{Deserialize, Serialize};

/// Slack rejects header blocks longer than this.
pub const MAX_HEADER_CHARS: usize = 150;
/// Slack rejects section text longer than this.
pub const MAX_SECTION_CHARS: usize = 3000;
/// Slack rejects messages with more blocks than this.
pub const MAX_BLOCKS: usize = 50;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextObject {
    PlainText { text: String, emoji: bool },
    Mrkdwn { text: String },
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        TextObject::PlainText {
            text: text.into(),
            emoji: true,
        }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        TextObject::Mrkdwn { text: text.into() }
    }

    pub fn text(&self) -> &str {
        match self {
            TextObject::PlainText { text, .. } | TextObject::Mrkdwn { text } => text,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Header { text: TextObject },
    Section { text: TextObject },
    Context { elements: Vec<TextObject> },
    Divider,
}

impl Block {
    pub fn header(text: impl Into<String>) -> Self {
        Block::Header {
            text: TextObject::plain(text),
        }
    }

    pub fn section(mrkdwn: impl Into<String>) -> Self {
        Block::Section {
            text: TextObject::mrkdwn(mrkdwn),
        }
    }

    pub fn context(mrkdwn: impl Into<String>) -> Self {
        Block::Context {
            elements: vec![TextObject::mrkdwn(mrkdwn)],
        }
    }

    /// Every piece of text the block displays.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Block::Header { text } | Block::Section { text } => vec![text.text()],
            Block::Context { elements } => elements.iter().map(TextObject::text).collect(),
            Block::Divider => Vec::new(),
        }
    }
}

/// `chat.postMessage` body.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PostMessage {
    pub channel: String,
    /// Notification fallback shown where blocks are not rendered.
    pub text: String,
    pub blocks: Vec<Block>,
    pub unfurl_links: bool,
    pub unfurl_media: bool,
}

// --- History views ---

#[derive(Deserialize, Debug, Clone, Default)]
pub struct HistoryText {
    #[serde(default)]
    pub text: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct HistoryBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub text: Option<HistoryText>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct HistoryMessage {
    #[serde(default)]
    pub ts: String,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub blocks: Vec<HistoryBlock>,
}

impl HistoryMessage {
    /// mrkdwn bodies of the message's section blocks.
    pub fn section_texts(&self) -> impl Iterator<Item = &str> {
        self.blocks
            .iter()
            .filter(|b| b.kind == "section")
            .filter_map(|b| b.text.as_ref())
            .map(|t| t.text.as_str())
    }
}
