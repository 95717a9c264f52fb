use std::process::ExitCode;
use tracing::{error, info, instrument, warn};

use crate::config::TopicConfig;
use crate::curator::NewsGenerator;
use crate::error::CuratorError;
use crate::formatter::{format_digest, format_empty, Footer};
use crate::history::HistorySource;
use crate::illustrator::Illustrator;
use crate::news::{Digest, ExclusionSet};
use crate::parser::parse_response;
use crate::publisher::Publisher;

/// Run-wide knobs shared by every topic.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_news_items: usize,
    /// Post an explicit "no news" message instead of staying silent.
    pub post_empty_digest: bool,
    pub footer: Footer,
}

#[derive(Debug)]
pub enum TopicOutcome {
    /// `illustrated` is false when no comic was requested or drawing it failed.
    Posted {
        ts: String,
        items: usize,
        illustrated: bool,
    },
    /// Nothing new; the empty-state message was posted.
    EmptyPosted { ts: String },
    /// Nothing new; nothing was posted.
    NoNews,
    Failed(CuratorError),
}

impl TopicOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TopicOutcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct TopicReport {
    pub topic: String,
    pub outcome: TopicOutcome,
}

/// Outcome of every topic in declaration order.
#[derive(Debug, Default)]
pub struct RunReport {
    pub topics: Vec<TopicReport>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &TopicReport> {
        self.topics.iter().filter(|t| t.outcome.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn exit_code(&self) -> ExitCode {
        if self.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }

    pub fn log_summary(&self) {
        for report in &self.topics {
            match &report.outcome {
                TopicOutcome::Posted {
                    ts,
                    items,
                    illustrated,
                } => {
                    info!(topic = %report.topic, ts = %ts, items, illustrated, "Topic posted")
                }
                TopicOutcome::EmptyPosted { ts } => {
                    info!(topic = %report.topic, ts = %ts, "Topic had no news; empty digest posted")
                }
                TopicOutcome::NoNews => info!(topic = %report.topic, "Topic had no news; nothing posted"),
                TopicOutcome::Failed(e) => {
                    error!(topic = %report.topic, kind = e.kind(), error = %e, "Topic failed")
                }
            }
        }
        info!(
            topics = self.topics.len(),
            failed = self.failures().count(),
            "Run finished"
        );
    }
}

/// History → generation → parse → format → publish, once per topic.
pub struct Pipeline<'a> {
    history: &'a dyn HistorySource,
    generator: &'a dyn NewsGenerator,
    publisher: &'a dyn Publisher,
    illustrator: Option<&'a dyn Illustrator>,
    settings: RunSettings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        history: &'a dyn HistorySource,
        generator: &'a dyn NewsGenerator,
        publisher: &'a dyn Publisher,
        settings: RunSettings,
    ) -> Self {
        Self {
            history,
            generator,
            publisher,
            illustrator: None,
            settings,
        }
    }

    /// Follow every posted digest with a comic in its thread.
    pub fn with_illustrator(mut self, illustrator: &'a dyn Illustrator) -> Self {
        self.illustrator = Some(illustrator);
        self
    }

    /// Process every topic in order. A failing topic never stops the next one.
    pub async fn run(&self, topics: &[TopicConfig]) -> RunReport {
        let mut report = RunReport::default();

        for topic in topics {
            info!(topic = %topic.name, channel = %topic.destination_id, "Processing topic");
            let outcome = match self.process_topic(topic).await {
                Ok(outcome) => outcome,
                Err(e) => TopicOutcome::Failed(e),
            };
            report.topics.push(TopicReport {
                topic: topic.name.clone(),
                outcome,
            });
        }

        report
    }

    #[instrument(skip_all, fields(topic = %topic.name))]
    async fn process_topic(&self, topic: &TopicConfig) -> Result<TopicOutcome, CuratorError> {
        let exclusions = match self.history.exclusion_set(topic).await {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "Duplicate suppression disabled for this topic");
                ExclusionSet::new()
            }
        };

        let response = self.generator.generate(topic, &exclusions).await?;

        let parsed = parse_response(&response.text, &exclusions, self.settings.max_news_items);
        info!(
            valid = parsed.items.len(),
            rejected = parsed.rejected,
            duplicates = parsed.duplicates,
            excluded = parsed.excluded,
            truncated = parsed.truncated,
            "Parsed model response"
        );

        if parsed.items.is_empty() {
            if !self.settings.post_empty_digest {
                return Ok(TopicOutcome::NoNews);
            }
            let message = format_empty(topic, &self.settings.footer);
            let ts = self.publisher.publish(&message).await?;
            return Ok(TopicOutcome::EmptyPosted { ts });
        }

        let digest = Digest {
            items: parsed.items,
            trend: parsed.trend,
            sources: response.sources,
        };
        let message = format_digest(topic, &digest, &self.settings.footer);
        let ts = self.publisher.publish(&message).await?;

        let illustrated = match self.illustrator {
            Some(illustrator) => self.attach_comic(illustrator, topic, &digest, &ts).await,
            None => false,
        };

        Ok(TopicOutcome::Posted {
            ts,
            items: digest.items.len(),
            illustrated,
        })
    }

    /// Best effort: the digest is already posted, so failures are only logged.
    async fn attach_comic(
        &self,
        illustrator: &dyn Illustrator,
        topic: &TopicConfig,
        digest: &Digest,
        ts: &str,
    ) -> bool {
        let result = match illustrator.illustrate(digest).await {
            Ok(image) => {
                let title = format!("{} comic", topic.name);
                self.publisher
                    .attach_image(&topic.destination_id, ts, &image, &title)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = e.kind(), error = %e, "Comic skipped; digest was posted without it");
                false
            }
        }
    }
}
