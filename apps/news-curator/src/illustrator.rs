//! Optional four-panel comic drawn from a digest.
//!
//! Two model calls: a text call writes one line per panel, then an
//! image-capable model draws the strip from those lines. Either call failing
//! only costs the comic; the digest is posted regardless.

use async_trait::async_trait;
use gemini_engine::{GeminiClient, GeneratedImage};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, info, instrument, warn};

use crate::error::CuratorError;
use crate::formatter::truncate_chars;
use crate::news::Digest;

/// Storytelling wants more variety than news extraction
const STORY_TEMPERATURE: f32 = 0.9;
const MAX_PANEL_CHARS: usize = 120;
const MAX_SOURCE_ITEMS: usize = 5;

const FALLBACK_PANELS: [&str; 4] = [
    "Zundamon bursts in, excited about today's news",
    "Ankomon raises an eyebrow and asks what the catch is",
    "The two argue over what it will change",
    "They shrug, share a mochi and agree to keep watching",
];

/// One short scene description per panel, top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComicPanels(pub [String; 4]);

impl ComicPanels {
    pub fn fallback() -> Self {
        ComicPanels(FALLBACK_PANELS.map(str::to_string))
    }
}

/// `1コマ目: ...`, `Panel 1: ...`, with optional list or bold markers.
fn panel_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?mi)^\s*(?:[-*]\s*)?(?:\*\*)?(?:([1-4])\s*コマ目|panel\s*([1-4]))(?:\*\*)?\s*[:：]\s*(.+?)\s*$")
            .expect("panel line pattern is valid")
    })
}

/// The text the story is based on: the trend, or the headlines when there is none.
pub fn story_source(digest: &Digest) -> Option<String> {
    if let Some(trend) = digest.trend.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return Some(trend.to_string());
    }
    if digest.items.is_empty() {
        return None;
    }
    let lines: Vec<String> = digest
        .items
        .iter()
        .take(MAX_SOURCE_ITEMS)
        .map(|item| match item.summary() {
            "" => format!("- {}", item.title()),
            summary => format!("- {}: {}", item.title(), summary),
        })
        .collect();
    Some(lines.join("\n"))
}

pub fn build_story_prompt(source: &str) -> String {
    format!(
        "Write a four-panel (yonkoma) comic script about the news below.\n\
         \n\
         News:\n\
         {source}\n\
         \n\
         Cast:\n\
         - Zundamon: a green zunda-mochi fairy. Cheerful and always optimistic.\n\
         - Ankomon: a brown anko-mochi fairy and Zundamon's rival. Cautious and \
         practical, but kind underneath.\n\
         \n\
         Reply with exactly four lines in this format and nothing else:\n\
         1コマ目: <scene>\n\
         2コマ目: <scene>\n\
         3コマ目: <scene>\n\
         4コマ目: <scene with the punchline>\n\
         \n\
         Keep each scene to one short sentence that names what the characters do \
         or how they look. The two must talk to each other, the news must be \
         recognisable, and the last panel must land a joke or a twist. Write the \
         scenes in the same language as the news.\n"
    )
}

/// Pull the four scene lines out of a script. Panels the model skipped are
/// filled from a stock story.
pub fn parse_panels(script: &str) -> ComicPanels {
    let mut panels: [Option<String>; 4] = Default::default();

    for caps in panel_line_pattern().captures_iter(script) {
        let Some(number) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let Ok(index) = number.as_str().parse::<usize>() else {
            continue;
        };
        let scene = caps[3].trim_matches(|c| c == '[' || c == ']').trim();
        let slot = &mut panels[index - 1];
        if slot.is_none() && !scene.is_empty() {
            *slot = Some(truncate_chars(scene, MAX_PANEL_CHARS));
        }
    }

    let found = panels.iter().filter(|p| p.is_some()).count();
    if found < panels.len() {
        debug!(found, "Script incomplete; filling panels from the stock story");
    }

    let mut index = 0;
    ComicPanels(panels.map(|panel| {
        let scene = panel.unwrap_or_else(|| FALLBACK_PANELS[index].to_string());
        index += 1;
        scene
    }))
}

pub fn build_image_prompt(panels: &ComicPanels) -> String {
    let [first, second, third, fourth] = &panels.0;
    format!(
        "Draw a cute four-panel vertical comic strip in the style of a Japanese \
         yonkoma manga.\n\
         \n\
         Panel 1 (top): {first}\n\
         Panel 2: {second}\n\
         Panel 3: {third}\n\
         Panel 4 (bottom, punchline): {fourth}\n\
         \n\
         Characters:\n\
         - Zundamon: round green mochi fairy with big sparkling eyes and a small \
         leaf on top of the head, beaming and full of energy.\n\
         - Ankomon: round reddish-brown mochi fairy with smaller eyes, a slight \
         frown that keeps turning into a hidden smile, and a red bean ornament.\n\
         \n\
         Style: soft hand-drawn lines, pastel greens and warm browns on cream, \
         chibi proportions, simple gradient backgrounds, clear borders between \
         vertically stacked panels, expressive faces (sweat drops, blushes, \
         sparkles), simple speech bubbles. Warm, lightly comedic slice-of-life \
         mood.\n"
    )
}

/// Draws a comic for a digest.
#[async_trait]
pub trait Illustrator: Send + Sync {
    async fn illustrate(&self, digest: &Digest) -> Result<GeneratedImage, CuratorError>;
}

/// Script from the text model, drawing from the image model.
pub struct GeminiIllustrator {
    story: GeminiClient,
    image: GeminiClient,
}

impl GeminiIllustrator {
    pub fn new(story: GeminiClient, image: GeminiClient) -> Self {
        Self { story, image }
    }
}

#[async_trait]
impl Illustrator for GeminiIllustrator {
    #[instrument(skip_all, fields(image_model = %self.image.model()))]
    async fn illustrate(&self, digest: &Digest) -> Result<GeneratedImage, CuratorError> {
        let source = story_source(digest)
            .ok_or_else(|| CuratorError::Illustration("digest has nothing to illustrate".into()))?;

        let script = self
            .story
            .generate_text(build_story_prompt(&source), STORY_TEMPERATURE)
            .await
            .map_err(CuratorError::Illustration)?;
        let panels = parse_panels(&script);
        if panels == ComicPanels::fallback() {
            warn!("Comic script was unusable; drawing the stock story");
        }

        let image = self
            .image
            .generate_image(build_image_prompt(&panels))
            .await
            .map_err(CuratorError::Illustration)?;
        info!(mime_type = %image.mime_type, bytes = image.data.len(), "Comic drawn");
        Ok(image)
    }
}
