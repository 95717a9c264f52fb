//! Daily news curator: asks Gemini (with Google Search grounding) for fresh
//! news per topic, drops anything already posted to the topic's Slack channel
//! in the last few days, and posts the rest as a Block Kit digest. With
//! `GENERATE_MANGA` set, each digest also gets a four-panel comic in its thread.

pub mod config;
pub mod curator;
pub mod error;
pub mod formatter;
pub mod history;
pub mod illustrator;
pub mod news;
pub mod parser;
pub mod pipeline;
pub mod publisher;

use chrono::{DateTime, Utc};
use gemini_engine::{Backend, GeminiClient};
use slack_client::SlackClient;
use std::time::Duration;

pub use config::{Config, TopicConfig};
pub use error::CuratorError;
pub use pipeline::{RunReport, TopicOutcome};

use crate::curator::GeminiCurator;
use crate::formatter::Footer;
use crate::history::SlackHistory;
use crate::illustrator::GeminiIllustrator;
use crate::pipeline::{Pipeline, RunSettings};

/// Grounded generation routinely takes tens of seconds
const HTTP_TIMEOUT_SECS: u64 = 180;

/// Wire the real clients from `config` and process every topic once.
pub async fn run(config: &Config, now: DateTime<Utc>) -> Result<RunReport, CuratorError> {
    // Shared HTTP client (reused for connection pooling)
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .map_err(|e| CuratorError::config(format!("failed to build HTTP client: {}", e)))?;

    let gemini = gemini_client(config, &http_client, config.backend.clone(), &config.model_name);

    let mut slack = SlackClient::new(http_client.clone(), config.slack_bot_token.clone());
    if let Some(base_url) = &config.slack_api_base_url {
        slack = slack.with_base_url(base_url.clone());
    }

    let history = SlackHistory::connect(slack.clone(), config.history_days, now).await;
    let settings = RunSettings {
        max_news_items: config.max_news_items,
        post_empty_digest: config.post_empty_digest,
        footer: Footer {
            model: config.model_name.clone(),
            generated_at: now,
        },
    };

    let illustrator = config.generate_manga.then(|| {
        let image_backend = config.backend.in_location(&config.image_location);
        GeminiIllustrator::new(
            gemini.clone(),
            gemini_client(config, &http_client, image_backend, &config.image_model_name),
        )
    });

    let curator = GeminiCurator::new(gemini, config.max_news_items);
    let mut pipeline = Pipeline::new(&history, &curator, &slack, settings);
    if let Some(illustrator) = &illustrator {
        pipeline = pipeline.with_illustrator(illustrator);
    }
    Ok(pipeline.run(&config.topics).await)
}

fn gemini_client(config: &Config, http_client: &reqwest::Client, backend: Backend, model: &str) -> GeminiClient {
    let client = GeminiClient::new(http_client.clone(), backend, model);
    match &config.gemini_base_url {
        Some(base_url) => client.with_base_url(base_url.clone()),
        None => client,
    }
}
