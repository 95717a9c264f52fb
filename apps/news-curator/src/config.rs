use gemini_engine::Backend;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CuratorError;

// --- Defaults ---
pub const DEFAULT_GCP_LOCATION: &str = "asia-northeast1";
pub const DEFAULT_MODEL_NAME: &str = "gemini-2.5-pro";
pub const DEFAULT_HISTORY_DAYS: u32 = 3;
pub const DEFAULT_MAX_NEWS_ITEMS: usize = 5;
pub const DEFAULT_IMAGE_MODEL_NAME: &str = "gemini-2.5-flash-image";
/// Image models are served from the global Vertex endpoint.
pub const DEFAULT_IMAGE_GCP_LOCATION: &str = "global";
/// Upper bound keeps one digest well inside Slack's block limit.
pub const MAX_NEWS_ITEMS_LIMIT: usize = 10;

/// One topic and where its digest goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub name: String,
    pub destination_id: String,
    pub header: String,
    pub unfurl_links: bool,
    pub unfurl_media: bool,
}

impl TopicConfig {
    pub fn new(name: &str, destination_id: &str, header: Option<&str>) -> Result<Self, String> {
        let name = name.trim();
        if name.is_empty() {
            return Err("topic 'name' is required".to_string());
        }
        let destination_id = destination_id.trim();
        if destination_id.is_empty() {
            return Err("topic 'channel_id' is required".to_string());
        }
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_header(name));

        Ok(Self {
            name: name.to_string(),
            destination_id: destination_id.to_string(),
            header,
            unfurl_links: false,
            unfurl_media: false,
        })
    }
}

pub fn default_header(name: &str) -> String {
    format!("{} ニュース", name)
}

/// Entry of the `TOPICS_CONFIG` array as written by operators.
#[derive(Deserialize, Debug)]
struct TopicDescriptor {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    header: Option<String>,
    #[serde(default)]
    unfurl_links: Option<Value>,
    #[serde(default)]
    unfurl_media: Option<Value>,
}

/// Parse the multi-topic descriptor. Any invalid entry rejects the whole list.
pub fn parse_topics_descriptor(json: &str) -> Result<Vec<TopicConfig>, CuratorError> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| CuratorError::config(format!("invalid TOPICS_CONFIG JSON: {}", e)))?;

    let entries = value
        .as_array()
        .ok_or_else(|| CuratorError::config("TOPICS_CONFIG must be a JSON array"))?;

    if entries.is_empty() {
        return Err(CuratorError::config("TOPICS_CONFIG contains no topics"));
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            let descriptor: TopicDescriptor = serde_json::from_value(entry.clone()).map_err(|e| {
                CuratorError::config(format!("TOPICS_CONFIG[{}]: {}", index, e))
            })?;

            let mut topic = TopicConfig::new(
                descriptor.name.as_deref().unwrap_or_default(),
                descriptor.channel_id.as_deref().unwrap_or_default(),
                descriptor.header.as_deref(),
            )
            .map_err(|e| CuratorError::config(format!("TOPICS_CONFIG[{}]: {}", index, e)))?;

            topic.unfurl_links = descriptor.unfurl_links.as_ref().is_some_and(value_is_true);
            topic.unfurl_media = descriptor.unfurl_media.as_ref().is_some_and(value_is_true);
            Ok(topic)
        })
        .collect()
}

/// `true` or any casing of the string "true".
fn value_is_true(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Fully resolved run configuration. Built once at startup, then read-only.
#[derive(Clone)]
pub struct Config {
    pub topics: Vec<TopicConfig>,
    pub slack_bot_token: String,
    pub backend: Backend,
    pub model_name: String,
    pub history_days: u32,
    pub max_news_items: usize,
    pub post_empty_digest: bool,
    /// Attach a four-panel comic to each digest.
    pub generate_manga: bool,
    pub image_model_name: String,
    /// Vertex location for the image model; ignored by the Developer API.
    pub image_location: String,
    pub gemini_base_url: Option<String>,
    pub slack_api_base_url: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("topics", &self.topics)
            .field("slack_bot_token", &"<redacted>")
            .field("backend", &self.backend)
            .field("model_name", &self.model_name)
            .field("history_days", &self.history_days)
            .field("max_news_items", &self.max_news_items)
            .field("post_empty_digest", &self.post_empty_digest)
            .field("generate_manga", &self.generate_manga)
            .field("image_model_name", &self.image_model_name)
            .field("image_location", &self.image_location)
            .finish()
    }
}

impl Config {
    /// Load from process environment (call `dotenvy::dotenv()` first for local runs).
    pub fn from_env() -> Result<Self, CuratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CuratorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key).ok_or_else(|| {
                CuratorError::config(format!("{} environment variable is required", key))
            })
        };

        let topics = match get("TOPICS_CONFIG") {
            Some(json) => parse_topics_descriptor(&json)?,
            None => {
                let name = get("CURATOR_TOPIC").ok_or_else(|| {
                    CuratorError::config("either TOPICS_CONFIG or CURATOR_TOPIC must be set")
                })?;
                let channel = require("SLACK_CHANNEL_ID")?;
                let header = get("SLACK_HEADER");
                vec![TopicConfig::new(&name, &channel, header.as_deref())
                    .map_err(CuratorError::config)?]
            }
        };

        let backend = match get("GCP_PROJECT_ID") {
            Some(project) => Backend::Vertex {
                project,
                location: get("GCP_LOCATION").unwrap_or_else(|| DEFAULT_GCP_LOCATION.to_string()),
                access_token: require("VERTEX_ACCESS_TOKEN")?,
            },
            None => match get("GEMINI_API_KEY") {
                Some(api_key) => Backend::Developer { api_key },
                None => {
                    return Err(CuratorError::config(
                        "either GEMINI_API_KEY or GCP_PROJECT_ID must be set",
                    ))
                }
            },
        };

        let history_days = parse_number("HISTORY_DAYS", get("HISTORY_DAYS"), DEFAULT_HISTORY_DAYS)?;
        if history_days == 0 {
            return Err(CuratorError::config("HISTORY_DAYS must be at least 1"));
        }

        let max_news_items =
            parse_number("MAX_NEWS_ITEMS", get("MAX_NEWS_ITEMS"), DEFAULT_MAX_NEWS_ITEMS)?;
        if !(1..=MAX_NEWS_ITEMS_LIMIT).contains(&max_news_items) {
            return Err(CuratorError::config(format!(
                "MAX_NEWS_ITEMS must be between 1 and {}",
                MAX_NEWS_ITEMS_LIMIT
            )));
        }

        let post_empty_digest = parse_flag("POST_EMPTY_DIGEST", get("POST_EMPTY_DIGEST"))?;
        let generate_manga = parse_flag("GENERATE_MANGA", get("GENERATE_MANGA"))?;

        Ok(Self {
            topics,
            slack_bot_token: require("SLACK_BOT_TOKEN")?,
            backend,
            model_name: get("MODEL_NAME").unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            history_days,
            max_news_items,
            post_empty_digest,
            generate_manga,
            image_model_name: get("IMAGE_MODEL_NAME")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL_NAME.to_string()),
            image_location: get("IMAGE_GCP_LOCATION")
                .unwrap_or_else(|| DEFAULT_IMAGE_GCP_LOCATION.to_string()),
            gemini_base_url: get("GEMINI_BASE_URL"),
            slack_api_base_url: get("SLACK_API_BASE_URL"),
        })
    }
}

/// Unset is false; otherwise `true`/`false` in any casing.
fn parse_flag(key: &str, raw: Option<String>) -> Result<bool, CuratorError> {
    match raw {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(v) => Err(CuratorError::config(format!(
            "{} must be true or false, got '{}'",
            key, v
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &str,
    raw: Option<String>,
    default: T,
) -> Result<T, CuratorError> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| CuratorError::config(format!("{} must be a number, got '{}'", key, v))),
    }
}
