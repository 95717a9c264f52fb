use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;

/// Boxed error shared by the workspace clients.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Public endpoint of the Gemini Developer API
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Grounded answers stay close to the search results
const GROUNDED_TEMPERATURE: f32 = 0.2;

/// Vertex location served from the global endpoint rather than a region
const GLOBAL_LOCATION: &str = "global";

// --- Shared Utilities ---

/// Extract the domain/host from a URL string safely.
/// Returns "unknown" if the URL cannot be parsed.
pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Regional Vertex AI endpoint, e.g. `https://asia-northeast1-aiplatform.googleapis.com`.
/// The `global` location has no regional prefix.
pub fn vertex_base_url(location: &str) -> String {
    if location == GLOBAL_LOCATION {
        "https://aiplatform.googleapis.com".to_string()
    } else {
        format!("https://{}-aiplatform.googleapis.com", location)
    }
}

// --- Shared Logging ---

/// Initialize structured logging with JSON format in production (when RUST_LOG is set),
/// or pretty format for local development.
pub fn init_logging() {
    let is_production = std::env::var("RUST_LOG").is_ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if is_production {
        let _ = fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}

// --- Backend Selection ---

/// Which Gemini surface to call and how to authenticate against it.
#[derive(Clone)]
pub enum Backend {
    /// Gemini Developer API, authenticated with an API key.
    Developer { api_key: String },
    /// Vertex AI in a specific project/region, authenticated with an OAuth access token.
    Vertex {
        project: String,
        location: String,
        access_token: String,
    },
}

impl Backend {
    pub fn label(&self) -> &'static str {
        match self {
            Backend::Developer { .. } => "gemini-api",
            Backend::Vertex { .. } => "vertex-ai",
        }
    }

    /// Same credentials against another Vertex region. Developer keys have no region.
    pub fn in_location(&self, new_location: &str) -> Backend {
        match self {
            Backend::Vertex {
                project,
                access_token,
                ..
            } => Backend::Vertex {
                project: project.clone(),
                location: new_location.to_string(),
                access_token: access_token.clone(),
            },
            developer => developer.clone(),
        }
    }

    fn default_base_url(&self) -> String {
        match self {
            Backend::Developer { .. } => DEFAULT_GEMINI_BASE_URL.to_string(),
            Backend::Vertex { location, .. } => vertex_base_url(location),
        }
    }
}

// Credentials stay out of logs
impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Developer { .. } => f
                .debug_struct("Developer")
                .field("api_key", &"<redacted>")
                .finish(),
            Backend::Vertex { project, location, .. } => f
                .debug_struct("Vertex")
                .field("project", project)
                .field("location", location)
                .field("access_token", &"<redacted>")
                .finish(),
        }
    }
}

// --- Gemini Structs ---
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

/// Binary part payload; `data` is base64 on the wire.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Serialize, Debug, Default)]
pub struct GoogleSearch {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    pub google_search: GoogleSearch,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiRequest {
    pub contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

fn user_turn(prompt: String) -> Vec<GeminiContent> {
    vec![GeminiContent {
        role: Some("user".to_string()),
        parts: vec![GeminiPart {
            text: prompt,
            ..Default::default()
        }],
    }]
}

impl GeminiRequest {
    /// Single user turn with Google Search grounding switched on.
    pub fn grounded(prompt: String) -> Self {
        Self {
            contents: user_turn(prompt),
            tools: vec![GeminiTool {
                google_search: GoogleSearch::default(),
            }],
            generation_config: Some(GenerationConfig {
                temperature: Some(GROUNDED_TEMPERATURE),
                ..Default::default()
            }),
        }
    }

    /// Plain text generation, no tools.
    pub fn text(prompt: String, temperature: f32) -> Self {
        Self {
            contents: user_turn(prompt),
            tools: Vec::new(),
            generation_config: Some(GenerationConfig {
                temperature: Some(temperature),
                ..Default::default()
            }),
        }
    }

    /// Ask an image-capable model for image output only.
    pub fn image(prompt: String) -> Self {
        Self {
            contents: user_turn(prompt),
            tools: Vec::new(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec!["IMAGE".to_string()],
                ..Default::default()
            }),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct WebChunk {
    pub uri: Option<String>,
    pub title: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct GroundingChunk {
    pub web: Option<WebChunk>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    pub content: Option<GeminiContent>,
    pub grounding_metadata: Option<GroundingMetadata>,
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct GeminiResponse {
    pub candidates: Option<Vec<GeminiCandidate>>,
    pub error: Option<GeminiError>,
}

#[derive(Deserialize, Debug)]
pub struct GeminiError {
    pub message: String,
    pub status: Option<String>,
}

/// A web page the model consulted while answering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

/// Text of the first candidate plus the search results it was grounded on.
#[derive(Debug, Clone)]
pub struct GroundedResponse {
    pub text: String,
    pub sources: Vec<GroundingSource>,
}

/// Decoded image bytes from an image-modality response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl GeneratedImage {
    /// File extension matching the mime type.
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/jpeg" => "jpg",
            "image/webp" => "webp",
            _ => "png",
        }
    }
}

impl GeminiCandidate {
    fn finish_reason(&self) -> &str {
        self.finish_reason.as_deref().unwrap_or("none")
    }
}

impl GeminiResponse {
    fn into_first_candidate(self) -> Result<GeminiCandidate, BoxError> {
        if let Some(error) = self.error {
            return Err(format!(
                "Gemini API Error ({}): {}",
                error.status.as_deref().unwrap_or("UNKNOWN"),
                error.message
            )
            .into());
        }

        self.candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| "No candidates returned from Gemini".into())
    }

    /// Concatenated text of the first candidate. Empty text is an error.
    pub fn into_text(self) -> Result<String, BoxError> {
        Ok(self.into_grounded()?.text)
    }

    /// Collapse the raw API response into text + sources, surfacing API errors.
    pub fn into_grounded(self) -> Result<GroundedResponse, BoxError> {
        let mut candidate = self.into_first_candidate()?;

        let text: String = candidate
            .content
            .take()
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(format!(
                "No content returned from Gemini (finish reason: {})",
                candidate.finish_reason()
            )
            .into());
        }

        let sources = candidate
            .grounding_metadata
            .unwrap_or_default()
            .grounding_chunks
            .into_iter()
            .filter_map(|chunk| chunk.web)
            .filter_map(|web| {
                let uri = web.uri.filter(|u| !u.is_empty())?;
                let title = web
                    .title
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| extract_domain(&uri));
                Some(GroundingSource { title, uri })
            })
            .collect();

        Ok(GroundedResponse { text, sources })
    }

    /// First inline image of the first candidate.
    pub fn into_image(self) -> Result<GeneratedImage, BoxError> {
        let mut candidate = self.into_first_candidate()?;

        let inline = candidate
            .content
            .take()
            .and_then(|c| c.parts.into_iter().find_map(|p| p.inline_data))
            .ok_or_else(|| {
                format!(
                    "No image returned from Gemini (finish reason: {})",
                    candidate.finish_reason()
                )
            })?;

        let data = general_purpose::STANDARD.decode(inline.data.trim())?;
        if data.is_empty() {
            return Err("Gemini returned an empty image".into());
        }

        Ok(GeneratedImage {
            mime_type: inline.mime_type,
            data,
        })
    }
}

// --- Client ---

/// Thin client over `models.generateContent`.
#[derive(Clone, Debug)]
pub struct GeminiClient {
    http: reqwest::Client,
    backend: Backend,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, backend: Backend, model: impl Into<String>) -> Self {
        let base_url = backend.default_base_url();
        Self {
            http,
            backend,
            model: model.into(),
            base_url,
        }
    }

    /// Point the client at a different host (proxies, mock servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> String {
        match &self.backend {
            Backend::Developer { .. } => format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ),
            Backend::Vertex { project, location, .. } => format!(
                "{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
                self.base_url, project, location, self.model
            ),
        }
    }

    /// Send one grounded prompt. No retry: the scheduler re-runs failed jobs.
    #[instrument(skip(self, prompt), fields(model = %self.model, backend = self.backend.label(), prompt_len = prompt.len()))]
    pub async fn generate_grounded(&self, prompt: String) -> Result<GroundedResponse, BoxError> {
        let grounded = self.send(&GeminiRequest::grounded(prompt)).await?.into_grounded()?;
        debug!(
            text_len = grounded.text.len(),
            sources = grounded.sources.len(),
            "Grounded response decoded"
        );
        Ok(grounded)
    }

    /// Ungrounded text generation.
    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    pub async fn generate_text(&self, prompt: String, temperature: f32) -> Result<String, BoxError> {
        self.send(&GeminiRequest::text(prompt, temperature))
            .await?
            .into_text()
    }

    /// Image generation with `responseModalities: ["IMAGE"]`.
    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    pub async fn generate_image(&self, prompt: String) -> Result<GeneratedImage, BoxError> {
        let image = self.send(&GeminiRequest::image(prompt)).await?.into_image()?;
        debug!(mime_type = %image.mime_type, bytes = image.data.len(), "Image decoded");
        Ok(image)
    }

    async fn send(&self, request: &GeminiRequest) -> Result<GeminiResponse, BoxError> {
        let builder = self.http.post(self.endpoint()).json(request);
        let builder = match &self.backend {
            Backend::Developer { api_key } => builder.header("x-goog-api-key", api_key),
            Backend::Vertex { access_token, .. } => builder.bearer_auth(access_token),
        };

        debug!("Sending request to Gemini API");
        let res = builder.send().await?;

        let status = res.status();
        debug!(status = %status, "Gemini API response received");

        if !status.is_success() {
            let error_body = res.text().await.unwrap_or_default();
            return Err(format!("Gemini API returned {}: {}", status, error_body).into());
        }

        Ok(res.json().await?)
    }
}
