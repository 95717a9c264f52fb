use async_trait::async_trait;
use gemini_engine::{GeminiClient, GroundedResponse};
use tracing::{info, instrument};

use crate::config::TopicConfig;
use crate::error::CuratorError;
use crate::news::ExclusionSet;

/// Most exclusion entries spelled out in one prompt.
pub const MAX_PROMPT_EXCLUSIONS: usize = 100;

/// Produces raw, untrusted model output for a topic.
#[async_trait]
pub trait NewsGenerator: Send + Sync {
    async fn generate(
        &self,
        topic: &TopicConfig,
        exclusions: &ExclusionSet,
    ) -> Result<GroundedResponse, CuratorError>;
}

/// Build the grounded news request for one topic.
pub fn build_prompt(topic: &str, exclusions: &ExclusionSet, max_items: usize) -> String {
    let mut prompt = format!(
        "Use Google Search to find news about \"{topic}\" published within the past 24 hours.\n\
         \n\
         Report at most {max_items} distinct news items. Prefer primary sources. \
         Write titles and summaries in the same language as the topic name.\n\
         \n\
         Respond with a single JSON object and nothing else: no greeting, no explanation, \
         no markdown headings. Use exactly this shape:\n\
         {{\"items\": [{{\"title\": \"...\", \"summary\": \"one or two sentences\", \
         \"url\": \"https://...\", \"source\": \"publisher name\", \
         \"published_at\": \"YYYY-MM-DD\"}}], \
         \"trend\": \"two or three sentences on the overall trend\"}}\n\
         \n\
         Rules:\n\
         - Every item must have a non-empty title and the full article url.\n\
         - Do not report the same story twice.\n\
         - Use \"unknown\" for published_at if the date is not stated.\n\
         - If there is no qualifying news, return {{\"items\": [], \"trend\": \"\"}}.\n"
    );

    let excluded = exclusions.prompt_entries(MAX_PROMPT_EXCLUSIONS);
    if !excluded.is_empty() {
        prompt.push_str(
            "\nThe following stories were already reported. Exclude any item whose title or url matches one of them:\n",
        );
        for entry in excluded {
            prompt.push_str("- ");
            prompt.push_str(entry);
            prompt.push('\n');
        }
    }

    prompt
}

/// Gemini with Google Search grounding.
pub struct GeminiCurator {
    client: GeminiClient,
    max_items: usize,
}

impl GeminiCurator {
    pub fn new(client: GeminiClient, max_items: usize) -> Self {
        Self { client, max_items }
    }
}

#[async_trait]
impl NewsGenerator for GeminiCurator {
    #[instrument(skip(self, topic, exclusions), fields(topic = %topic.name, model = %self.client.model()))]
    async fn generate(
        &self,
        topic: &TopicConfig,
        exclusions: &ExclusionSet,
    ) -> Result<GroundedResponse, CuratorError> {
        let prompt = build_prompt(&topic.name, exclusions, self.max_items);
        let response = self
            .client
            .generate_grounded(prompt)
            .await
            .map_err(CuratorError::Generation)?;

        info!(
            text_len = response.text.len(),
            grounding_sources = response.sources.len(),
            "Received grounded response"
        );
        Ok(response)
    }
}
