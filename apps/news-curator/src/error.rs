use gemini_engine::BoxError;
use thiserror::Error;

/// Failures the run loop distinguishes between.
///
/// `Config` aborts the run before any topic is touched. `HistoryFetch` is
/// downgraded to an empty exclusion set by the caller. `Generation` and
/// `Publish` fail only the topic they happened in. `Illustration` is only
/// ever logged: the digest goes out without its comic.
#[derive(Debug, Error)]
pub enum CuratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("history fetch failed: {0}")]
    HistoryFetch(#[source] BoxError),

    #[error("generation failed: {0}")]
    Generation(#[source] BoxError),

    #[error("publish failed: {0}")]
    Publish(#[source] BoxError),

    #[error("illustration failed: {0}")]
    Illustration(#[source] BoxError),
}

impl CuratorError {
    pub fn config(msg: impl Into<String>) -> Self {
        CuratorError::Config(msg.into())
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CuratorError::Config(_) => "config",
            CuratorError::HistoryFetch(_) => "history_fetch",
            CuratorError::Generation(_) => "generation",
            CuratorError::Publish(_) => "publish",
            CuratorError::Illustration(_) => "illustration",
        }
    }
}

/// Why a single record from the model was dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidRecord {
    #[error("record is not an object with string fields")]
    Malformed,
    #[error("title is missing or empty")]
    MissingTitle,
    #[error("url is missing or empty")]
    MissingUrl,
    #[error("url is not an absolute http(s) url: {0}")]
    InvalidUrl(String),
}
