pub mod blocks;

use backoff::{future::retry, ExponentialBackoff};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;

pub use blocks::{Block, HistoryMessage, PostMessage, TextObject};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Public Slack Web API root
pub const DEFAULT_SLACK_API_BASE_URL: &str = "https://slack.com/api";

const MAX_RETRY_ELAPSED_SECS: u64 = 30;

/// Slack error codes worth another attempt
const TRANSIENT_SLACK_ERRORS: [&str; 5] = [
    "ratelimited",
    "internal_error",
    "fatal_error",
    "service_unavailable",
    "request_timeout",
];

fn is_transient_slack_error(code: &str) -> bool {
    TRANSIENT_SLACK_ERRORS.contains(&code)
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Who the token belongs to; used to recognise our own past posts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotIdentity {
    pub user_id: Option<String>,
    pub bot_id: Option<String>,
}

impl BotIdentity {
    pub fn authored(&self, message: &HistoryMessage) -> bool {
        let by_bot = matches!((&self.bot_id, &message.bot_id), (Some(a), Some(b)) if a == b);
        let by_user = matches!((&self.user_id, &message.user), (Some(a), Some(b)) if a == b);
        by_bot || by_user
    }
}

// --- Wire Structs ---

#[derive(Deserialize, Debug)]
struct AuthTestResponse {
    ok: bool,
    error: Option<String>,
    user_id: Option<String>,
    bot_id: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: String,
    #[serde(default)]
    messages: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct HistoryResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    messages: Vec<HistoryMessage>,
    #[serde(default)]
    has_more: bool,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize, Debug)]
struct PostMessageResponse {
    ok: bool,
    error: Option<String>,
    ts: Option<String>,
    response_metadata: Option<ResponseMetadata>,
}

#[derive(Deserialize, Debug)]
struct UploadUrlResponse {
    ok: bool,
    error: Option<String>,
    upload_url: Option<String>,
    file_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct CompleteUploadResponse {
    ok: bool,
    error: Option<String>,
}

#[derive(Serialize, Debug)]
struct UploadedFile<'a> {
    id: &'a str,
    title: &'a str,
}

#[derive(Serialize, Debug)]
struct CompleteUploadRequest<'a> {
    files: [UploadedFile<'a>; 1],
    channel_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_ts: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_comment: Option<&'a str>,
}

/// A file to share into a channel, optionally as a thread reply.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub channel: String,
    pub thread_ts: Option<String>,
    pub filename: String,
    pub title: String,
    pub initial_comment: Option<String>,
    pub data: Vec<u8>,
}

/// One page of `conversations.history`.
#[derive(Debug)]
pub struct HistoryPage {
    pub messages: Vec<HistoryMessage>,
    pub next_cursor: Option<String>,
}

// --- Client ---

#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
    retry_budget: Duration,
}

impl std::fmt::Debug for SlackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackClient")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl SlackClient {
    pub fn new(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            base_url: DEFAULT_SLACK_API_BASE_URL.to_string(),
            retry_budget: Duration::from_secs(MAX_RETRY_ELAPSED_SECS),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Upper bound on time spent retrying a read call.
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    fn method_url(&self, method: &str) -> Result<Url, BoxError> {
        Ok(Url::parse(&format!("{}/{}", self.base_url, method))?)
    }

    /// Retry read-only calls on rate limits and server trouble.
    async fn with_retry<T, F, Fut>(&self, method: &'static str, op: F) -> Result<T, BoxError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, backoff::Error<BoxError>>>,
    {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.retry_budget),
            ..Default::default()
        };

        retry(backoff, op).await.map_err(|e| {
            warn!(method, error = %e, "Slack call failed");
            e
        })
    }

    /// GET a Web API method and decode the envelope, classifying failures for retry.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, backoff::Error<BoxError>> {
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    backoff::Error::transient(BoxError::from(e))
                } else {
                    backoff::Error::permanent(BoxError::from(e))
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let retry_after = res
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let err: BoxError = format!("Slack API returned {}", status).into();
            return Err(match (is_transient_status(status), retry_after) {
                (true, Some(after)) => backoff::Error::retry_after(err, after),
                (true, None) => backoff::Error::transient(err),
                (false, _) => backoff::Error::permanent(err),
            });
        }

        res.json::<T>()
            .await
            .map_err(|e| backoff::Error::permanent(BoxError::from(e)))
    }

    /// `auth.test`: identify the bot behind the token.
    #[instrument(skip(self))]
    pub async fn auth_test(&self) -> Result<BotIdentity, BoxError> {
        let url = self.method_url("auth.test")?;

        let resp: AuthTestResponse = self
            .with_retry("auth.test", || async {
                let resp: AuthTestResponse = self.get_json(url.clone()).await?;
                check_envelope(resp.ok, resp.error.as_deref())?;
                Ok::<_, backoff::Error<BoxError>>(resp)
            })
            .await?;

        debug!(user_id = ?resp.user_id, bot_id = ?resp.bot_id, "Resolved bot identity");
        Ok(BotIdentity {
            user_id: resp.user_id,
            bot_id: resp.bot_id,
        })
    }

    /// One page of `conversations.history` newer than `oldest` (unix seconds).
    #[instrument(skip(self, cursor))]
    pub async fn conversations_history(
        &self,
        channel: &str,
        oldest: i64,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, BoxError> {
        let mut url = self.method_url("conversations.history")?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("channel", channel)
                .append_pair("oldest", &oldest.to_string())
                .append_pair("limit", &limit.to_string());
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let resp: HistoryResponse = self
            .with_retry("conversations.history", || async {
                let resp: HistoryResponse = self.get_json(url.clone()).await?;
                check_envelope(resp.ok, resp.error.as_deref())?;
                Ok::<_, backoff::Error<BoxError>>(resp)
            })
            .await?;

        let next_cursor = resp
            .response_metadata
            .map(|m| m.next_cursor)
            .filter(|c| resp.has_more && !c.is_empty());

        debug!(count = resp.messages.len(), has_more = next_cursor.is_some(), "Fetched history page");
        Ok(HistoryPage {
            messages: resp.messages,
            next_cursor,
        })
    }

    /// Walk history pages newest-first until exhausted or `max_pages` is reached.
    pub async fn recent_messages(
        &self,
        channel: &str,
        oldest: i64,
        page_size: u32,
        max_pages: usize,
    ) -> Result<Vec<HistoryMessage>, BoxError> {
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..max_pages {
            let page = self
                .conversations_history(channel, oldest, page_size, cursor.as_deref())
                .await?;
            messages.extend(page.messages);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(messages),
            }
        }

        debug!(channel, max_pages, "Stopped paging history at page limit");
        Ok(messages)
    }

    /// `chat.postMessage`. Never retried: a repeated post is a duplicate post.
    /// Returns the message `ts`.
    #[instrument(skip(self, message), fields(channel = %message.channel, blocks = message.blocks.len()))]
    pub async fn post_message(&self, message: &PostMessage) -> Result<String, BoxError> {
        let url = self.method_url("chat.postMessage")?;

        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(message)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(format!("Slack API returned {}: {}", status, body).into());
        }

        let resp: PostMessageResponse = res.json().await?;
        if !resp.ok {
            let details = resp
                .response_metadata
                .map(|m| m.messages.join("; "))
                .filter(|d| !d.is_empty());
            let code = resp.error.as_deref().unwrap_or("unknown_error");
            return Err(match details {
                Some(details) => format!("Slack API error: {} ({})", code, details),
                None => format!("Slack API error: {}", code),
            }
            .into());
        }

        Ok(resp.ts.unwrap_or_default())
    }
}

impl SlackClient {
    /// Share a file via `files.getUploadURLExternal`, a raw upload, then
    /// `files.completeUploadExternal`. Only the first step is retried;
    /// nothing is visible in the channel until the last one succeeds.
    /// Returns the file id.
    #[instrument(skip(self, upload), fields(channel = %upload.channel, bytes = upload.data.len()))]
    pub async fn upload_file(&self, upload: &FileUpload) -> Result<String, BoxError> {
        let mut url = self.method_url("files.getUploadURLExternal")?;
        url.query_pairs_mut()
            .append_pair("filename", &upload.filename)
            .append_pair("length", &upload.data.len().to_string());

        let resp: UploadUrlResponse = self
            .with_retry("files.getUploadURLExternal", || async {
                let resp: UploadUrlResponse = self.get_json(url.clone()).await?;
                check_envelope(resp.ok, resp.error.as_deref())?;
                Ok::<_, backoff::Error<BoxError>>(resp)
            })
            .await?;
        let (upload_url, file_id) = match (resp.upload_url, resp.file_id) {
            (Some(upload_url), Some(file_id)) => (upload_url, file_id),
            _ => return Err("files.getUploadURLExternal returned no upload_url".into()),
        };

        let res = self
            .http
            .post(&upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(upload.data.clone())
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(format!("File upload returned {}", res.status()).into());
        }
        debug!(file_id = %file_id, "File bytes uploaded");

        let request = CompleteUploadRequest {
            files: [UploadedFile {
                id: &file_id,
                title: &upload.title,
            }],
            channel_id: &upload.channel,
            thread_ts: upload.thread_ts.as_deref(),
            initial_comment: upload.initial_comment.as_deref(),
        };
        let res = self
            .http
            .post(self.method_url("files.completeUploadExternal")?)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(format!("Slack API returned {}", res.status()).into());
        }
        let resp: CompleteUploadResponse = res.json().await?;
        if !resp.ok {
            return Err(format!(
                "Slack API error: {}",
                resp.error.as_deref().unwrap_or("unknown_error")
            )
            .into());
        }

        Ok(file_id)
    }
}

fn check_envelope(ok: bool, error: Option<&str>) -> Result<(), backoff::Error<BoxError>> {
    if ok {
        return Ok(());
    }
    let code = error.unwrap_or("unknown_error");
    let err: BoxError = format!("Slack API error: {}", code).into();
    if is_transient_slack_error(code) {
        Err(backoff::Error::transient(err))
    } else {
        Err(backoff::Error::permanent(err))
    }
}
