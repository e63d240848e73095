use std::env;
use std::io::Cursor;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use image::imageops::FilterType;
use image::{ImageFormat, Rgb, RgbImage};
use indexmap::IndexMap;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use uuid::Uuid;

use rekindle_contracts::costs::COST_PER_OPERATION_USD;
use rekindle_contracts::errors::{error_code, SceneError};
use rekindle_contracts::events::{EventLog, EventPayload};
use rekindle_contracts::history::{ConversationLedger, EntryKind};
use rekindle_contracts::images::{GeneratedImage, ImagePayload};
use rekindle_contracts::photos::{Orientation, Photo, PhotoRole, StyleSettings};
use rekindle_contracts::scenarios::{palette_for, scenario_catalog, Scenario, PERSON_PLACEHOLDER};
use rekindle_contracts::session::{ActionSlot, SessionContext};

const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";
const MAX_OUTPUT_TOKENS: u32 = 1290;
const GENERATE_TEMPERATURE: f32 = 0.7;
const EDIT_TEMPERATURE: f32 = 0.6;
const ENHANCE_TEMPERATURE: f32 = 0.3;

const ANALYSIS_MAX_SIDE: u32 = 100;
const SEPIA_FRACTION_THRESHOLD: f64 = 0.30;
const BRIGHTNESS_THRESHOLD: f64 = 100.0;
const CHANNEL_VARIANCE_THRESHOLD: f64 = 20.0;

const BATCH_INTER_REQUEST_DELAY: Duration = Duration::from_secs(1);
const SIMULATED_GENERATE_DELAY: Duration = Duration::from_secs(2);
const SIMULATED_EDIT_DELAY: Duration = Duration::from_millis(1500);

const RECENT_EDIT_CONTEXT: usize = 3;

/// One content block of an outbound request. Attachment order is a contract
/// with the backend model: base image first, then historical photos, then
/// background photos, then the instruction text as the final block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    Image { mime_type: String, data: Vec<u8> },
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Generate,
    Edit,
    Enhance,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// The unit of work sent to the backend. Built per action, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneRequest {
    pub kind: RequestKind,
    pub parts: Vec<RequestPart>,
    pub instruction: String,
    pub orientation: Orientation,
    pub scenario_id: String,
    pub scenario_title: String,
    pub emotional_tone: String,
    pub historical_count: usize,
    pub current_count: usize,
    pub background_count: usize,
    pub expected_people: usize,
    pub params: GenerationParams,
}

/// One content block of a backend reply. The first inline block with an
/// `image/` media type is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBlock {
    Inline { mime_type: String, data: Vec<u8> },
    Text(String),
}

impl ResponseBlock {
    fn is_image(&self) -> bool {
        matches!(self, ResponseBlock::Inline { mime_type, .. } if mime_type.starts_with("image/"))
    }
}

// ---------------------------------------------------------------------------
// Photo classifier
// ---------------------------------------------------------------------------

/// Heuristic role assignment from pixel statistics over a downsampled raster.
/// Sepia fraction is checked before brightness; both short-circuit ahead of
/// the channel-variance test. The user can always override by cycling.
pub fn classify_photo(bytes: &[u8]) -> Result<PhotoRole> {
    let decoded = image::load_from_memory(bytes).context("failed decoding uploaded image")?;
    let sample = decoded
        .resize(ANALYSIS_MAX_SIDE, ANALYSIS_MAX_SIDE, FilterType::Triangle)
        .to_rgb8();

    let mut total_brightness = 0.0f64;
    let mut total_variance = 0.0f64;
    let mut sepia_count = 0usize;
    let pixel_count = (sample.width() * sample.height()) as usize;

    for Rgb([r, g, b]) in sample.pixels() {
        let (r, g, b) = (*r as f64, *g as f64, *b as f64);
        total_brightness += (r + g + b) / 3.0;
        total_variance += (r - g).abs() + (g - b).abs() + (r - b).abs();
        if r > g && g > b && r - b > 30.0 && g - b > 10.0 {
            sepia_count += 1;
        }
    }

    Ok(role_from_stats(
        total_brightness / pixel_count as f64,
        total_variance / pixel_count as f64,
        sepia_count as f64 / pixel_count as f64,
    ))
}

fn role_from_stats(avg_brightness: f64, avg_variance: f64, sepia_fraction: f64) -> PhotoRole {
    if sepia_fraction > SEPIA_FRACTION_THRESHOLD || avg_brightness < BRIGHTNESS_THRESHOLD {
        PhotoRole::Historical
    } else if avg_variance < CHANNEL_VARIANCE_THRESHOLD {
        PhotoRole::Background
    } else {
        PhotoRole::Current
    }
}

// ---------------------------------------------------------------------------
// Composite-scene request builder
// ---------------------------------------------------------------------------

/// Builds the generation request for one scenario. Fails before any call is
/// issued when a required photo role is missing, naming that role.
pub fn build_generation_request(
    photos: &[Photo],
    scenario: &Scenario,
    orientation: Orientation,
    style: &StyleSettings,
) -> Result<SceneRequest, SceneError> {
    let historical: Vec<&Photo> = photos.iter().filter(|p| p.role == PhotoRole::Historical).collect();
    let current: Vec<&Photo> = photos.iter().filter(|p| p.role == PhotoRole::Current).collect();
    let background: Vec<&Photo> = photos.iter().filter(|p| p.role == PhotoRole::Background).collect();

    if current.is_empty() {
        return Err(SceneError::PreconditionFailed {
            role: PhotoRole::Current,
        });
    }
    if historical.is_empty() {
        return Err(SceneError::PreconditionFailed {
            role: PhotoRole::Historical,
        });
    }

    // Background photos relocate every subject, so the full union is attached
    // to the head count when any are present.
    let expected_people = if background.is_empty() {
        historical.len() + current.len()
    } else {
        historical.len() + current.len() + background.len()
    };

    let instruction = generation_instruction(
        scenario,
        orientation,
        style,
        expected_people,
        !background.is_empty(),
    );

    let mut parts = Vec::new();
    parts.push(image_part(current[0]));
    for photo in &historical {
        parts.push(image_part(photo));
    }
    for photo in &background {
        parts.push(image_part(photo));
    }
    parts.push(RequestPart::Text(instruction.clone()));

    Ok(SceneRequest {
        kind: RequestKind::Generate,
        parts,
        instruction,
        orientation,
        scenario_id: scenario.id.clone(),
        scenario_title: scenario.title.clone(),
        emotional_tone: scenario.emotional_tone.clone(),
        historical_count: historical.len(),
        current_count: current.len(),
        background_count: background.len(),
        expected_people,
        params: GenerationParams {
            max_output_tokens: MAX_OUTPUT_TOKENS,
            temperature: GENERATE_TEMPERATURE,
        },
    })
}

fn image_part(photo: &Photo) -> RequestPart {
    RequestPart::Image {
        mime_type: photo.mime_type.clone(),
        data: photo.bytes.clone(),
    }
}

/// Counts, orientation and exclusions are repeated in the text because the
/// backend has no hard constraint mechanism; the instruction is the only
/// lever against drift.
fn generation_instruction(
    scenario: &Scenario,
    orientation: Orientation,
    style: &StyleSettings,
    expected_people: usize,
    relocating: bool,
) -> String {
    let scene = scenario
        .prompt
        .replace(PERSON_PLACEHOLDER, "the people from the historical photos");

    let mut text = format!(
        "Create a photorealistic {orientation} image showing these {expected_people} people: {scene}. \
         Make each person look exactly as they appear in their uploaded photo - same facial \
         features, hair, age, and appearance. Set in a {} {} scene with natural lighting.",
        scenario.emotional_tone,
        scenario.title.to_lowercase(),
    );
    if relocating {
        text.push_str(
            " Relocate every person into the setting shown in the background photos.",
        );
    }
    text.push_str(&format!(
        " The finished scene must contain exactly {expected_people} people."
    ));
    text.push_str(&format!(
        " Compose the frame as a {} image at a {} aspect ratio.",
        orientation.framing(),
        orientation.aspect_ratio(),
    ));
    text.push_str(&format!(
        " Cultural style: {}. Time period: {}. Clothing: {}. Setting: {}.",
        style.cultural_style, style.time_period, style.clothing_style, style.location_style,
    ));
    text.push_str(&format!(
        " Do not introduce any additional or generic people beyond the {expected_people} supplied."
    ));
    text
}

// ---------------------------------------------------------------------------
// Response resolver
// ---------------------------------------------------------------------------

/// Everything the resolver needs beyond the raw blocks to shape the record.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub scenario_id: String,
    pub scenario_title: String,
    pub historical_used: usize,
    pub current_used: usize,
    pub expected_people: Option<usize>,
    pub quality: String,
    pub features: Vec<String>,
    pub processing_time: String,
    pub cost_usd: Option<f64>,
    pub edit_history: Vec<String>,
}

/// Resolves a backend reply into a displayable record. Image-bearing replies
/// win; text-only replies fall back to a synthesized placeholder so the user
/// always receives some visual artifact. Neither image nor text is a failure.
pub fn resolve_response(
    blocks: &[ResponseBlock],
    ctx: &ResolveContext,
) -> Result<GeneratedImage, SceneError> {
    let (payload, description) = if let Some(ResponseBlock::Inline { mime_type, data }) =
        blocks.iter().find(|block| block.is_image())
    {
        (
            ImagePayload::from_bytes(data, mime_type.clone()),
            "AI-generated photorealistic family reunion image".to_string(),
        )
    } else {
        let text = blocks
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::Text(text) if !text.trim().is_empty() => Some(text.trim()),
                _ => None,
            })
            .collect::<Vec<&str>>()
            .join("\n");
        if text.is_empty() {
            return Err(SceneError::NoContentInResponse);
        }
        let svg = placeholder_scene_svg(
            &ctx.scenario_id,
            &ctx.scenario_title,
            ctx.historical_used,
            ctx.current_used,
        );
        (ImagePayload::from_svg(&svg), text)
    };

    Ok(GeneratedImage {
        id: Uuid::new_v4().to_string(),
        scenario_id: ctx.scenario_id.clone(),
        scenario_title: ctx.scenario_title.clone(),
        description,
        payload,
        created_at: now_utc_iso(),
        historical_photos_used: ctx.historical_used,
        current_photos_used: ctx.current_used,
        quality: ctx.quality.clone(),
        processing_time: ctx.processing_time.clone(),
        features: ctx.features.clone(),
        cost_usd: ctx.cost_usd,
        edit_history: ctx.edit_history.clone(),
        expected_people: ctx.expected_people,
    })
}

/// Deterministic placeholder: per-scenario palette, one person marker per
/// historical and current photo, title text and a photo-count caption.
fn placeholder_scene_svg(
    scenario_id: &str,
    scenario_title: &str,
    historical: usize,
    current: usize,
) -> String {
    let palette = palette_for(scenario_id);
    let people = historical + current;

    let mut markers = String::new();
    for idx in 0..people {
        let x = 200.0 + idx as f64 * 60.0 - people as f64 * 30.0;
        let y = 180.0 + (idx as f64 * 0.5).sin() * 20.0;
        let fill = if idx < historical {
            palette.secondary
        } else {
            palette.accent
        };
        markers.push_str(&format!(
            "<circle cx=\"{x:.1}\" cy=\"{y:.1}\" r=\"25\" fill=\"{fill}\" opacity=\"0.8\"/>\
             <circle cx=\"{x:.1}\" cy=\"{y:.1}\" r=\"15\" fill=\"white\" opacity=\"0.9\"/>"
        ));
    }

    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"600\" height=\"400\" viewBox=\"0 0 600 400\">\
         <defs>\
         <linearGradient id=\"bg\" x1=\"0%\" y1=\"0%\" x2=\"100%\" y2=\"100%\">\
         <stop offset=\"0%\" stop-color=\"{primary}\" stop-opacity=\"1\"/>\
         <stop offset=\"100%\" stop-color=\"{secondary}\" stop-opacity=\"0.3\"/>\
         </linearGradient>\
         <radialGradient id=\"glow\" cx=\"50%\" cy=\"50%\" r=\"50%\">\
         <stop offset=\"0%\" stop-color=\"white\" stop-opacity=\"0.8\"/>\
         <stop offset=\"100%\" stop-color=\"{accent}\" stop-opacity=\"0.1\"/>\
         </radialGradient>\
         </defs>\
         <rect width=\"600\" height=\"400\" fill=\"url(#bg)\"/>\
         <circle cx=\"300\" cy=\"200\" r=\"150\" fill=\"url(#glow)\" opacity=\"0.6\"/>\
         {markers}\
         <text x=\"300\" y=\"320\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"18\" font-weight=\"bold\" fill=\"{secondary}\">{title}</text>\
         <text x=\"300\" y=\"340\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"12\" fill=\"{secondary}\" opacity=\"0.8\">AI-Enhanced Family Memory</text>\
         <text x=\"300\" y=\"360\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"10\" fill=\"{secondary}\" opacity=\"0.6\">{historical} Historical + {current} Current Photos</text>\
         </svg>",
        primary = palette.primary,
        secondary = palette.secondary,
        accent = palette.accent,
        title = scenario_title,
    )
}

// ---------------------------------------------------------------------------
// Edit/refinement orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditIntent {
    BlendRepair,
    RestorePerson,
    General,
}

impl EditIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditIntent::BlendRepair => "blend_repair",
            EditIntent::RestorePerson => "restore_person",
            EditIntent::General => "general",
        }
    }
}

const BLEND_TRIGGERS: [&str; 7] = [
    "blend",
    "lighting",
    "shadow",
    "natural",
    "skin tone",
    "artificial",
    "cutout",
];
const RESTORE_SUBJECTS: [&str; 3] = ["person", "historical", "missing"];

/// Ordered keyword classification, first match wins. The uncovered case is
/// the explicit `General` branch.
pub fn classify_edit_intent(text: &str) -> EditIntent {
    let lowered = text.to_lowercase();
    if BLEND_TRIGGERS.iter().any(|trigger| lowered.contains(trigger)) {
        return EditIntent::BlendRepair;
    }
    if lowered.contains("add") && RESTORE_SUBJECTS.iter().any(|subject| lowered.contains(subject)) {
        return EditIntent::RestorePerson;
    }
    EditIntent::General
}

/// Builds a follow-up request that applies one free-text edit to a previously
/// produced image. The backend keeps no state across calls, so the request is
/// fully self-contained: prior image attached, recent edit context summarized
/// into the instruction.
pub fn build_edit_request(
    prior: &GeneratedImage,
    edit_text: &str,
    ledger: &ConversationLedger,
    orientation: Orientation,
) -> Result<SceneRequest, SceneError> {
    let prior_bytes = prior.payload.decode()?;
    let intent = classify_edit_intent(edit_text);
    let people = prior
        .expected_people
        .unwrap_or(prior.historical_photos_used + prior.current_photos_used);

    let core = match intent {
        EditIntent::BlendRepair => format!(
            "Rework the image so every person blends naturally into the scene: {edit_text}. \
             Keep exactly {people} people in the frame. Improve the lighting, shadows and skin \
             tones so nobody looks artificially cut out. Do not remove or obscure anyone."
        ),
        EditIntent::RestorePerson => format!(
            "A person from the historical photos was lost in a previous edit. {edit_text}. \
             Reinsert that missing person and blend them with the existing people, matching \
             lighting, scale and photographic style."
        ),
        EditIntent::General => format!(
            "{edit_text}. Keep the exact same set of people - no additions, no removals - \
             with the same faces and appearance as the original image."
        ),
    };

    let recent: Vec<&str> = ledger
        .recent(RECENT_EDIT_CONTEXT, EntryKind::Edit)
        .into_iter()
        .map(|entry| entry.content.as_str())
        .collect();
    let instruction = if recent.is_empty() {
        core
    } else {
        format!("Following previous edits ({}), now: {core}", recent.join(", "))
    };

    let parts = vec![
        RequestPart::Image {
            mime_type: prior.payload.mime_type.clone(),
            data: prior_bytes,
        },
        RequestPart::Text(instruction.clone()),
    ];

    Ok(SceneRequest {
        kind: RequestKind::Edit,
        parts,
        instruction,
        orientation,
        scenario_id: prior.scenario_id.clone(),
        scenario_title: prior.scenario_title.clone(),
        emotional_tone: String::new(),
        historical_count: prior.historical_photos_used,
        current_count: prior.current_photos_used,
        background_count: 0,
        expected_people: people,
        params: GenerationParams {
            max_output_tokens: MAX_OUTPUT_TOKENS,
            temperature: EDIT_TEMPERATURE,
        },
    })
}

/// Single-photo restoration request used by the enhancement pass.
pub fn build_enhancement_request(photo: &Photo, custom_prompt: Option<&str>) -> SceneRequest {
    let instruction = custom_prompt
        .map(str::to_string)
        .unwrap_or_else(|| {
            "Restore and enhance this historical photograph. Improve sharpness and clarity \
             while keeping the person exactly the same."
                .to_string()
        });

    SceneRequest {
        kind: RequestKind::Enhance,
        parts: vec![
            image_part(photo),
            RequestPart::Text(instruction.clone()),
        ],
        instruction,
        orientation: Orientation::Square,
        scenario_id: String::new(),
        scenario_title: String::new(),
        emotional_tone: String::new(),
        historical_count: 0,
        current_count: 0,
        background_count: 0,
        expected_people: 1,
        params: GenerationParams {
            max_output_tokens: MAX_OUTPUT_TOKENS,
            temperature: ENHANCE_TEMPERATURE,
        },
    }
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// One interface, two implementations. Calling code never branches on demo
/// versus live beyond construction-time selection.
pub trait SceneBackend {
    fn name(&self) -> &str;
    fn is_simulated(&self) -> bool {
        false
    }
    fn quality_label(&self) -> &str;
    fn feature_tags(&self) -> Vec<String>;
    fn generate(&self, request: &SceneRequest) -> Result<Vec<ResponseBlock>>;
}

pub struct LiveBackend {
    api_base: String,
    api_key: String,
    model: String,
    http: HttpClient,
}

impl LiveBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_base: env::var("REKINDLE_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.api_base, self.model)
    }

    fn build_payload(request: &SceneRequest) -> Value {
        let parts: Vec<Value> = request
            .parts
            .iter()
            .map(|part| match part {
                RequestPart::Image { mime_type, data } => json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": BASE64.encode(data),
                    }
                }),
                RequestPart::Text(text) => json!({ "text": text }),
            })
            .collect();

        json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
            "generationConfig": {
                "maxOutputTokens": request.params.max_output_tokens,
                "temperature": request.params.temperature,
            },
        })
    }

    fn extract_blocks(payload: &Value) -> Result<Vec<ResponseBlock>> {
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut blocks = Vec::new();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(inline) = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                {
                    let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
                    if data.is_empty() {
                        continue;
                    }
                    let bytes = BASE64
                        .decode(data.as_bytes())
                        .context("inline image base64 decode failed")?;
                    let mime_type = inline
                        .get("mimeType")
                        .or_else(|| inline.get("mime_type"))
                        .and_then(Value::as_str)
                        .unwrap_or("image/png")
                        .to_string();
                    blocks.push(ResponseBlock::Inline { mime_type, data: bytes });
                } else if let Some(text) = part.get("text").and_then(Value::as_str) {
                    blocks.push(ResponseBlock::Text(text.to_string()));
                }
            }
        }

        Ok(blocks)
    }
}

impl SceneBackend for LiveBackend {
    fn name(&self) -> &str {
        "live"
    }

    fn quality_label(&self) -> &str {
        "AI-Enhanced"
    }

    fn feature_tags(&self) -> Vec<String> {
        [
            "AI Image Generation",
            "Family Photo Fusion",
            "Scene Synthesis",
            "Character Consistency",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    // One outbound call per action, no automatic retries: retry is always a
    // manual user action.
    fn generate(&self, request: &SceneRequest) -> Result<Vec<ResponseBlock>> {
        let endpoint = self.endpoint();
        let payload = Self::build_payload(request);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .with_context(|| format!("scene request failed ({endpoint})"))?;
        let body = response_json_or_error(response)?;
        Self::extract_blocks(&body)
    }
}

fn response_json_or_error(response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let text = response.text().context("failed reading backend response body")?;
    if !status.is_success() {
        bail!(
            "backend returned {}: {}",
            status.as_u16(),
            truncate_text(&text, 512)
        );
    }
    serde_json::from_str(&text).context("backend response was not valid JSON")
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let truncated: String = value.chars().take(max_chars).collect();
    format!("{truncated}…")
}

/// Stand-in backend used when no credential is configured or demo mode is
/// forced. Exercises the exact same contract as the live path with a fixed
/// artificial latency and deterministic per-scenario output.
pub struct SimulatedBackend {
    generate_delay: Duration,
    edit_delay: Duration,
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self {
            generate_delay: SIMULATED_GENERATE_DELAY,
            edit_delay: SIMULATED_EDIT_DELAY,
        }
    }

    pub fn with_delays(generate_delay: Duration, edit_delay: Duration) -> Self {
        Self {
            generate_delay,
            edit_delay,
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneBackend for SimulatedBackend {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_simulated(&self) -> bool {
        true
    }

    fn quality_label(&self) -> &str {
        "High"
    }

    fn feature_tags(&self) -> Vec<String> {
        [
            "Character Consistency",
            "Multi-Image Fusion",
            "World Knowledge",
            "Natural Language",
        ]
        .into_iter()
        .map(str::to_string)
        .collect()
    }

    fn generate(&self, request: &SceneRequest) -> Result<Vec<ResponseBlock>> {
        let delay = match request.kind {
            RequestKind::Generate => self.generate_delay,
            RequestKind::Edit | RequestKind::Enhance => self.edit_delay,
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let svg = match request.kind {
            RequestKind::Generate => demo_scene_svg(
                &request.scenario_id,
                &request.scenario_title,
                request.expected_people,
            ),
            RequestKind::Edit => demo_edit_svg(&request.instruction),
            RequestKind::Enhance => demo_enhance_svg(),
        };

        Ok(vec![ResponseBlock::Inline {
            mime_type: "image/svg+xml".to_string(),
            data: svg.into_bytes(),
        }])
    }
}

struct DemoTheme {
    bg: &'static str,
    accent: &'static str,
    theme: &'static str,
}

fn demo_theme(scenario_id: &str) -> DemoTheme {
    match scenario_id {
        "wedding" => DemoTheme { bg: "#be185d", accent: "#f8fafc", theme: "Romantic" },
        "holiday" => DemoTheme { bg: "#166534", accent: "#ef4444", theme: "Festive" },
        "birthday" => DemoTheme { bg: "#7c3aed", accent: "#fb7185", theme: "Celebratory" },
        "newborn" => DemoTheme { bg: "#0369a1", accent: "#fde047", theme: "Tender" },
        "vacation" => DemoTheme { bg: "#0891b2", accent: "#34d399", theme: "Adventure" },
        _ => DemoTheme { bg: "#1e3a8a", accent: "#fbbf24", theme: "Academic" },
    }
}

fn demo_scene_svg(scenario_id: &str, scenario_title: &str, people: usize) -> String {
    let theme = demo_theme(scenario_id);
    let mut silhouettes = String::new();
    for idx in 0..people.max(1) {
        let x = 150.0 + idx as f64 * (300.0 / people.max(1) as f64);
        silhouettes.push_str(&format!(
            "<circle cx=\"{x:.0}\" cy=\"200\" r=\"35\" fill=\"#2d3748\" opacity=\"0.8\"/>\
             <rect x=\"{rx:.0}\" y=\"235\" width=\"30\" height=\"60\" fill=\"#2d3748\" opacity=\"0.8\" rx=\"15\"/>",
            rx = x - 15.0,
        ));
    }

    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"600\" height=\"400\" viewBox=\"0 0 600 400\">\
         <defs>\
         <linearGradient id=\"bg\" x1=\"0%\" y1=\"0%\" x2=\"100%\" y2=\"100%\">\
         <stop offset=\"0%\" stop-color=\"{bg}\" stop-opacity=\"1\"/>\
         <stop offset=\"100%\" stop-color=\"{accent}\" stop-opacity=\"0.3\"/>\
         </linearGradient>\
         </defs>\
         <rect width=\"600\" height=\"400\" fill=\"url(#bg)\"/>\
         <rect x=\"50\" y=\"300\" width=\"500\" height=\"100\" fill=\"{bg}\" opacity=\"0.2\" rx=\"10\"/>\
         {silhouettes}\
         <rect x=\"150\" y=\"30\" width=\"300\" height=\"50\" fill=\"white\" opacity=\"0.9\" rx=\"25\"/>\
         <text x=\"300\" y=\"50\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"16\" fill=\"{bg}\" font-weight=\"bold\">{title}</text>\
         <text x=\"300\" y=\"70\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"12\" fill=\"{bg}\" opacity=\"0.8\">{theme} Family Reunion</text>\
         <text x=\"550\" y=\"380\" text-anchor=\"end\" font-family=\"Arial\" font-size=\"10\" fill=\"white\" opacity=\"0.5\">DEMO</text>\
         </svg>",
        bg = theme.bg,
        accent = theme.accent,
        theme = theme.theme,
        title = scenario_title,
    )
}

fn demo_edit_svg(instruction: &str) -> String {
    let excerpt: String = instruction.chars().take(30).collect();
    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"600\" height=\"400\" viewBox=\"0 0 600 400\">\
         <rect width=\"600\" height=\"400\" fill=\"#059669\"/>\
         <circle cx=\"300\" cy=\"200\" r=\"60\" fill=\"white\" opacity=\"0.9\"/>\
         <text x=\"300\" y=\"200\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"16\" fill=\"#059669\">Demo Edit</text>\
         <text x=\"300\" y=\"280\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"12\" fill=\"white\" opacity=\"0.8\">{excerpt}</text>\
         </svg>"
    )
}

fn demo_enhance_svg() -> String {
    "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"400\" height=\"300\" viewBox=\"0 0 400 300\">\
     <rect width=\"400\" height=\"300\" fill=\"#2563eb\"/>\
     <circle cx=\"200\" cy=\"150\" r=\"50\" fill=\"white\" opacity=\"0.9\"/>\
     <text x=\"200\" y=\"155\" text-anchor=\"middle\" font-family=\"Arial\" font-size=\"14\" fill=\"#2563eb\">Enhanced</text>\
     </svg>"
        .to_string()
}

// ---------------------------------------------------------------------------
// Demo sample photos
// ---------------------------------------------------------------------------

pub struct DemoSamplePhoto {
    pub name: &'static str,
    pub bytes: Vec<u8>,
}

/// A handful of canned sample sets for demo activation. Which set loads is
/// random at activation time; everything downstream stays deterministic.
/// Each set carries one sepia-toned, one colorful and one flat raster so the
/// classifier assigns historical, current and background roles respectively.
pub fn demo_sample_set(selector: usize) -> Result<Vec<DemoSamplePhoto>> {
    let sets: [[(&'static str, [u8; 3]); 3]; 3] = [
        [
            ("archive_portrait_1947.png", [120, 90, 60]),
            ("family_portrait.png", [80, 180, 220]),
            ("city_park.png", [140, 140, 140]),
        ],
        [
            ("archive_portrait_1920s.png", [110, 78, 52]),
            ("graduation_snapshot.png", [60, 190, 170]),
            ("seaside_view.png", [150, 150, 150]),
        ],
        [
            ("archive_wedding_1953.png", [130, 96, 64]),
            ("birthday_snapshot.png", [90, 160, 230]),
            ("garden_lawn.png", [132, 132, 132]),
        ],
    ];

    let set = &sets[selector % sets.len()];
    let mut photos = Vec::new();
    for (name, [r, g, b]) in set {
        let mut raster = RgbImage::new(64, 64);
        for pixel in raster.pixels_mut() {
            *pixel = Rgb([*r, *g, *b]);
        }
        photos.push(DemoSamplePhoto {
            name,
            bytes: encode_png(&raster)?,
        });
    }
    Ok(photos)
}

fn encode_png(raster: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(raster.clone())
        .write_to(&mut buffer, ImageFormat::Png)
        .context("failed encoding sample raster")?;
    Ok(buffer.into_inner())
}

// ---------------------------------------------------------------------------
// Batch runner outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Success {
        scenario_id: String,
        image: GeneratedImage,
    },
    Failure {
        scenario_id: String,
        code: String,
        message: String,
    },
}

impl BatchOutcome {
    pub fn scenario_id(&self) -> &str {
        match self {
            BatchOutcome::Success { scenario_id, .. } => scenario_id,
            BatchOutcome::Failure { scenario_id, .. } => scenario_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BatchOutcome::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Orchestration layer owning the session state, the backend and the event
/// log. One outbound call per action; the initiating flow blocks until it
/// settles.
pub struct SceneEngine {
    backend: Box<dyn SceneBackend>,
    events: EventLog,
    session: SessionContext,
    scenarios: IndexMap<String, Scenario>,
    batch_delay: Duration,
}

impl SceneEngine {
    /// Absence of a credential is not an error: it selects the simulated
    /// backend so the rest of the pipeline is backend-agnostic.
    pub fn new(events_path: impl Into<PathBuf>, api_key: Option<String>) -> Result<Self> {
        let backend: Box<dyn SceneBackend> = match api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
        {
            Some(key) => Box::new(LiveBackend::new(key)),
            None => Box::new(SimulatedBackend::new()),
        };
        Self::with_backend(events_path, backend)
    }

    pub fn with_backend(
        events_path: impl Into<PathBuf>,
        backend: Box<dyn SceneBackend>,
    ) -> Result<Self> {
        let session_id = format!("session-{}", timestamp_millis());
        let events = EventLog::new(events_path.into(), session_id);
        events.emit(
            "session_started",
            payload(json!({
                "backend": backend.name(),
                "simulated": backend.is_simulated(),
            })),
        )?;

        Ok(Self {
            backend,
            events,
            session: SessionContext::new(),
            scenarios: scenario_catalog(),
            batch_delay: BATCH_INTER_REQUEST_DELAY,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn scenarios(&self) -> &IndexMap<String, Scenario> {
        &self.scenarios
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_simulated(&self) -> bool {
        self.backend.is_simulated()
    }

    pub fn set_batch_delay(&mut self, delay: Duration) {
        self.batch_delay = delay;
    }

    /// Classification runs synchronously after decode; an undecodable image
    /// is an upload error and the photo is not added.
    pub fn add_photo(&mut self, name: &str, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let role = classify_photo(&bytes)?;
        let photo = Photo::new(name, bytes, mime_type, role);
        let id = photo.id.clone();
        self.events.emit(
            "photo_added",
            payload(json!({
                "photo_id": id,
                "name": name,
                "role": role.as_str(),
                "auto_detected": true,
            })),
        )?;
        self.session.add_photo(photo);
        Ok(id)
    }

    pub fn cycle_photo_role(&mut self, photo_id: &str) -> Result<PhotoRole> {
        let Some(role) = self.session.cycle_photo_role(photo_id) else {
            bail!("no photo with id {photo_id}");
        };
        self.events.emit(
            "photo_role_changed",
            payload(json!({
                "photo_id": photo_id,
                "role": role.as_str(),
            })),
        )?;
        Ok(role)
    }

    pub fn remove_photo(&mut self, photo_id: &str) -> Result<()> {
        if !self.session.remove_photo(photo_id) {
            bail!("no photo with id {photo_id}");
        }
        Ok(())
    }

    /// Loads one canned sample set and records a system ledger entry. The
    /// random part is confined to which set loads.
    pub fn load_demo_photos(&mut self) -> Result<Vec<String>> {
        let selector = timestamp_millis() as usize;
        let mut ids = Vec::new();
        for sample in demo_sample_set(selector)? {
            ids.push(self.add_photo(sample.name, sample.bytes, "image/png")?);
        }
        self.session.ledger_mut().append(
            EntryKind::System,
            "Demo mode activated - sample photos loaded",
        );
        Ok(ids)
    }

    pub fn generate(
        &mut self,
        scenario_id: &str,
        orientation: Orientation,
        style: &StyleSettings,
    ) -> Result<GeneratedImage> {
        self.generate_scene(scenario_id, orientation, style, false)
    }

    /// One ledger entry per user action: a variation records only its
    /// `Variation` entry, never an inner `Generation` one.
    fn generate_scene(
        &mut self,
        scenario_id: &str,
        orientation: Orientation,
        style: &StyleSettings,
        variation: bool,
    ) -> Result<GeneratedImage> {
        let Some(scenario) = self.scenarios.get(scenario_id).cloned() else {
            bail!("unknown scenario {scenario_id}");
        };
        let request =
            build_generation_request(self.session.photos(), &scenario, orientation, style)?;
        let token = self.session.begin(ActionSlot::Generation);

        self.events.emit(
            "generation_started",
            payload(json!({
                "scenario": scenario.id,
                "orientation": orientation.as_str(),
                "expected_people": request.expected_people,
                "variation": variation,
                "backend": self.backend.name(),
            })),
        )?;

        let started = Instant::now();
        let blocks = self.backend.generate(&request)?;
        let mut image = self.resolve(&blocks, &request, Vec::new(), started)?;
        if variation {
            image.description.push_str(" (Variation)");
        }

        if self.session.is_current(token) {
            self.session.record_image(image.clone());
            let (kind, content) = if variation {
                (
                    EntryKind::Variation,
                    format!("Generated variation of {} scene", scenario.title),
                )
            } else {
                (
                    EntryKind::Generation,
                    format!(
                        "Generated {} scene using {} historical and {} current photos",
                        scenario.title, request.historical_count, request.current_count
                    ),
                )
            };
            self.session.ledger_mut().append(kind, content);
        } else {
            self.events.emit(
                "stale_result_discarded",
                payload(json!({ "slot": "generation" })),
            )?;
        }
        Ok(image)
    }

    /// Applies one free-text edit to a prior image. The result supersedes the
    /// prior record in the current view; the prior record stays in history.
    pub fn edit(
        &mut self,
        image_id: Option<&str>,
        edit_text: &str,
        orientation: Orientation,
    ) -> Result<GeneratedImage> {
        let prior = match image_id {
            Some(id) => self.session.image(id).cloned(),
            None => self.session.latest_image().cloned(),
        };
        let Some(prior) = prior else {
            bail!("no generated image to edit");
        };

        let intent = classify_edit_intent(edit_text);
        let request = build_edit_request(&prior, edit_text, self.session.ledger(), orientation)?;
        let token = self.session.begin(ActionSlot::Edit);

        let started = Instant::now();
        let blocks = self.backend.generate(&request)?;
        let mut edit_history = prior.edit_history.clone();
        edit_history.push(edit_text.to_string());
        let image = self.resolve(&blocks, &request, edit_history, started)?;

        if self.session.is_current(token) {
            self.session.supersede_image(&prior.id, image.clone());
            self.session.ledger_mut().append(EntryKind::Edit, edit_text);
            self.events.emit(
                "edit_applied",
                payload(json!({
                    "image_id": image.id,
                    "superseded": prior.id,
                    "intent": intent.as_str(),
                })),
            )?;
        } else {
            self.events
                .emit("stale_result_discarded", payload(json!({ "slot": "edit" })))?;
        }
        Ok(image)
    }

    /// Re-runs the prior image's scenario against the current photo set,
    /// independent of any edit history.
    pub fn variation(
        &mut self,
        image_id: &str,
        orientation: Orientation,
        style: &StyleSettings,
    ) -> Result<GeneratedImage> {
        let Some(prior) = self.session.image(image_id).cloned() else {
            bail!("no generated image with id {image_id}");
        };
        let scenario_id = prior.scenario_id.clone();
        self.generate_scene(&scenario_id, orientation, style, true)
    }

    /// Restoration pass over one photo. Unlike generation, a text-only reply
    /// is a failure here: there is no placeholder that improves a photo.
    pub fn enhance_photo(&mut self, photo_id: &str, custom_prompt: Option<&str>) -> Result<()> {
        let Some(photo) = self.session.photo(photo_id).cloned() else {
            bail!("no photo with id {photo_id}");
        };
        let request = build_enhancement_request(&photo, custom_prompt);
        let token = self.session.begin(ActionSlot::Enhancement);

        let blocks = self.backend.generate(&request)?;
        let Some(ResponseBlock::Inline { mime_type, data }) =
            blocks.iter().find(|block| block.is_image()).cloned()
        else {
            bail!("enhancement produced no image");
        };

        if self.session.is_current(token) {
            self.session
                .replace_photo_bytes(photo_id, data, mime_type, true);
            self.events.emit(
                "enhancement_applied",
                payload(json!({ "photo_id": photo_id })),
            )?;
        }
        Ok(())
    }

    /// Sequential batch over scenarios with a fixed inter-request delay on
    /// the live backend. One bad scenario never halts the rest.
    pub fn run_batch(
        &mut self,
        scenario_ids: &[String],
        orientation: Orientation,
        style: &StyleSettings,
    ) -> Result<Vec<BatchOutcome>> {
        let mut outcomes = Vec::with_capacity(scenario_ids.len());
        for (idx, scenario_id) in scenario_ids.iter().enumerate() {
            let outcome = match self.generate(scenario_id, orientation, style) {
                Ok(image) => BatchOutcome::Success {
                    scenario_id: scenario_id.clone(),
                    image,
                },
                Err(err) => BatchOutcome::Failure {
                    scenario_id: scenario_id.clone(),
                    code: error_code(&err).to_string(),
                    message: format!("{err:#}"),
                },
            };
            self.events.emit(
                "batch_item",
                payload(json!({
                    "scenario": scenario_id,
                    "index": idx,
                    "success": outcome.is_success(),
                })),
            )?;
            outcomes.push(outcome);

            if !self.backend.is_simulated() && idx + 1 < scenario_ids.len() {
                thread::sleep(self.batch_delay);
            }
        }
        Ok(outcomes)
    }

    fn resolve(
        &self,
        blocks: &[ResponseBlock],
        request: &SceneRequest,
        edit_history: Vec<String>,
        started: Instant,
    ) -> Result<GeneratedImage> {
        let fell_back = !blocks.iter().any(ResponseBlock::is_image);
        let ctx = ResolveContext {
            scenario_id: request.scenario_id.clone(),
            scenario_title: request.scenario_title.clone(),
            historical_used: request.historical_count,
            current_used: request.current_count,
            expected_people: Some(request.expected_people),
            quality: self.backend.quality_label().to_string(),
            features: self.backend.feature_tags(),
            processing_time: format!("{:.1} seconds", started.elapsed().as_secs_f64()),
            cost_usd: if self.backend.is_simulated() {
                Some(0.0)
            } else {
                Some(COST_PER_OPERATION_USD)
            },
            edit_history,
        };
        let image = resolve_response(blocks, &ctx)?;

        if fell_back {
            self.events.emit(
                "resolver_fallback",
                payload(json!({
                    "scenario": request.scenario_id,
                    "image_id": image.id,
                })),
            )?;
        }
        // Head-count drift cannot be corrected here; it is surfaced for the
        // caller to display instead.
        self.events.emit(
            "image_resolved",
            payload(json!({
                "image_id": image.id,
                "quality": image.quality,
                "fallback": fell_back,
                "expected_people": image.expected_people,
                "historical_used": image.historical_photos_used,
                "current_used": image.current_photos_used,
            })),
        )?;
        Ok(image)
    }
}

fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    use image::{ImageFormat, Rgb, RgbImage};

    use rekindle_contracts::errors::SceneError;
    use rekindle_contracts::history::{ConversationLedger, EntryKind};
    use rekindle_contracts::images::{GeneratedImage, ImagePayload};
    use rekindle_contracts::photos::{Orientation, Photo, PhotoRole, StyleSettings};
    use rekindle_contracts::scenarios::scenario_catalog;

    use super::{
        build_edit_request, build_generation_request, classify_edit_intent, classify_photo,
        demo_sample_set, resolve_response, role_from_stats, EditIntent, RequestPart, ResolveContext,
        ResponseBlock, SceneBackend, SceneEngine, SimulatedBackend,
    };

    fn png_of_color(r: u8, g: u8, b: u8) -> Vec<u8> {
        let mut raster = RgbImage::new(32, 32);
        for pixel in raster.pixels_mut() {
            *pixel = Rgb([r, g, b]);
        }
        let mut buffer = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(raster)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        buffer.into_inner()
    }

    fn photo(name: &str, role: PhotoRole) -> Photo {
        Photo::new(name, png_of_color(80, 180, 220), "image/png", role)
    }

    fn wedding() -> rekindle_contracts::scenarios::Scenario {
        scenario_catalog().get("wedding").cloned().unwrap()
    }

    fn resolve_ctx() -> ResolveContext {
        ResolveContext {
            scenario_id: "wedding".to_string(),
            scenario_title: "Wedding Celebration".to_string(),
            historical_used: 1,
            current_used: 1,
            expected_people: Some(2),
            quality: "AI-Enhanced".to_string(),
            features: vec!["Scene Synthesis".to_string()],
            processing_time: "1.0 seconds".to_string(),
            cost_usd: Some(0.0387),
            edit_history: Vec::new(),
        }
    }

    fn demo_engine() -> (SceneEngine, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let engine = SceneEngine::with_backend(
            temp.path().join("events.jsonl"),
            Box::new(SimulatedBackend::with_delays(
                Duration::ZERO,
                Duration::ZERO,
            )),
        )
        .unwrap();
        (engine, temp)
    }

    // -- classifier --------------------------------------------------------

    #[test]
    fn sepia_fraction_wins_before_brightness() {
        // Bright sepia: brightness above the threshold, still historical.
        assert_eq!(role_from_stats(150.0, 300.0, 0.5), PhotoRole::Historical);
    }

    #[test]
    fn dark_photos_classify_historical_even_without_sepia() {
        assert_eq!(role_from_stats(80.0, 300.0, 0.0), PhotoRole::Historical);
        // Low variance never reached: brightness short-circuits first.
        assert_eq!(role_from_stats(80.0, 5.0, 0.0), PhotoRole::Historical);
    }

    #[test]
    fn flat_bright_photos_classify_background() {
        assert_eq!(role_from_stats(140.0, 0.0, 0.0), PhotoRole::Background);
    }

    #[test]
    fn colorful_bright_photos_classify_current() {
        assert_eq!(role_from_stats(160.0, 280.0, 0.0), PhotoRole::Current);
    }

    #[test]
    fn classify_decodes_real_rasters() {
        assert_eq!(
            classify_photo(&png_of_color(120, 90, 60)).unwrap(),
            PhotoRole::Historical
        );
        assert_eq!(
            classify_photo(&png_of_color(80, 180, 220)).unwrap(),
            PhotoRole::Current
        );
        assert_eq!(
            classify_photo(&png_of_color(140, 140, 140)).unwrap(),
            PhotoRole::Background
        );
    }

    #[test]
    fn undecodable_bytes_are_an_upload_error() {
        assert!(classify_photo(b"not an image").is_err());
    }

    // -- request builder ---------------------------------------------------

    #[test]
    fn missing_current_role_fails_precondition() {
        let photos = vec![photo("h.png", PhotoRole::Historical)];
        let err = build_generation_request(
            &photos,
            &wedding(),
            Orientation::Landscape,
            &StyleSettings::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SceneError::PreconditionFailed {
                role: PhotoRole::Current
            }
        );
        assert_eq!(err.code(), "PRECONDITION_FAILED");
    }

    #[test]
    fn missing_historical_role_fails_precondition() {
        let photos = vec![photo("c.png", PhotoRole::Current)];
        let err = build_generation_request(
            &photos,
            &wedding(),
            Orientation::Landscape,
            &StyleSettings::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            SceneError::PreconditionFailed {
                role: PhotoRole::Historical
            }
        );
    }

    #[test]
    fn parts_are_ordered_base_then_historical_then_background_then_text() {
        let photos = vec![
            photo("h1.png", PhotoRole::Historical),
            photo("c1.png", PhotoRole::Current),
            photo("b1.png", PhotoRole::Background),
            photo("h2.png", PhotoRole::Historical),
        ];
        let request = build_generation_request(
            &photos,
            &wedding(),
            Orientation::Landscape,
            &StyleSettings::default(),
        )
        .unwrap();

        // base image + 2 historical + 1 background + instruction text
        assert_eq!(request.parts.len(), 5);
        assert!(matches!(request.parts[0], RequestPart::Image { .. }));
        assert!(matches!(request.parts[4], RequestPart::Text(_)));
        let image_count = request
            .parts
            .iter()
            .filter(|part| matches!(part, RequestPart::Image { .. }))
            .count();
        assert_eq!(image_count, 4);
    }

    #[test]
    fn head_count_is_historical_plus_current() {
        let photos = vec![
            photo("h1.png", PhotoRole::Historical),
            photo("h2.png", PhotoRole::Historical),
            photo("c1.png", PhotoRole::Current),
        ];
        let request = build_generation_request(
            &photos,
            &wedding(),
            Orientation::Portrait,
            &StyleSettings::default(),
        )
        .unwrap();
        assert_eq!(request.expected_people, 3);
        assert!(request.instruction.contains("these 3 people"));
        assert!(request.instruction.contains("exactly 3 people"));
    }

    #[test]
    fn head_count_covers_the_union_when_backgrounds_are_present() {
        let photos = vec![
            photo("h1.png", PhotoRole::Historical),
            photo("c1.png", PhotoRole::Current),
            photo("b1.png", PhotoRole::Background),
        ];
        let request = build_generation_request(
            &photos,
            &wedding(),
            Orientation::Landscape,
            &StyleSettings::default(),
        )
        .unwrap();
        assert_eq!(request.expected_people, 3);
        assert!(request
            .instruction
            .contains("Relocate every person into the setting"));
    }

    #[test]
    fn wedding_landscape_instruction_mentions_count_framing_and_no_other_scenario() {
        let photos = vec![
            photo("h1.png", PhotoRole::Historical),
            photo("c1.png", PhotoRole::Current),
        ];
        let request = build_generation_request(
            &photos,
            &wedding(),
            Orientation::Landscape,
            &StyleSettings::default(),
        )
        .unwrap();

        assert!(request.instruction.contains("these 2 people"));
        assert!(request.instruction.contains("16:9"));
        assert!(request.instruction.contains("wide landscape"));
        for other in ["Graduation Day", "Holiday Gathering", "Birthday Party", "Meeting New Baby", "Family Vacation"] {
            assert!(
                !request.instruction.contains(other),
                "instruction leaked scenario title {other}"
            );
        }
        assert!(request.instruction.contains("Do not introduce any additional"));
    }

    #[test]
    fn style_settings_appear_as_clauses() {
        let photos = vec![
            photo("h1.png", PhotoRole::Historical),
            photo("c1.png", PhotoRole::Current),
        ];
        let style = StyleSettings {
            cultural_style: "vintage".to_string(),
            time_period: "classic".to_string(),
            clothing_style: "elegant".to_string(),
            location_style: "outdoor".to_string(),
        };
        let request =
            build_generation_request(&photos, &wedding(), Orientation::Square, &style).unwrap();
        assert!(request.instruction.contains("Cultural style: vintage."));
        assert!(request.instruction.contains("Time period: classic."));
        assert!(request.instruction.contains("Clothing: elegant."));
        assert!(request.instruction.contains("Setting: outdoor."));
    }

    // -- resolver ----------------------------------------------------------

    #[test]
    fn first_image_block_wins() {
        let blocks = vec![
            ResponseBlock::Text("preamble".to_string()),
            ResponseBlock::Inline {
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            },
            ResponseBlock::Inline {
                mime_type: "image/jpeg".to_string(),
                data: vec![9, 9],
            },
        ];
        let image = resolve_response(&blocks, &resolve_ctx()).unwrap();
        assert_eq!(image.payload.mime_type, "image/png");
        assert_eq!(image.payload.decode().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn resolving_twice_yields_identical_payloads() {
        let blocks = vec![ResponseBlock::Inline {
            mime_type: "image/png".to_string(),
            data: vec![5, 6, 7, 8],
        }];
        let ctx = resolve_ctx();
        let first = resolve_response(&blocks, &ctx).unwrap();
        let second = resolve_response(&blocks, &ctx).unwrap();
        assert_eq!(first.payload, second.payload);
    }

    #[test]
    fn text_only_response_falls_back_to_a_placeholder_svg() {
        let blocks = vec![ResponseBlock::Text(
            "A warm scene of two people at a ceremony".to_string(),
        )];
        let image = resolve_response(&blocks, &resolve_ctx()).unwrap();
        assert!(image.payload.is_svg());
        assert_eq!(image.description, "A warm scene of two people at a ceremony");

        let markup = String::from_utf8(image.payload.decode().unwrap()).unwrap();
        assert!(markup.starts_with("<svg"));
        assert!(markup.contains("Wedding Celebration"));
        assert!(markup.contains("1 Historical + 1 Current Photos"));
    }

    #[test]
    fn placeholder_payloads_are_deterministic() {
        let blocks = vec![ResponseBlock::Text("description".to_string())];
        let ctx = resolve_ctx();
        let first = resolve_response(&blocks, &ctx).unwrap();
        let second = resolve_response(&blocks, &ctx).unwrap();
        assert_eq!(first.payload, second.payload);
    }

    #[test]
    fn empty_response_fails_with_no_content() {
        let blocks = vec![ResponseBlock::Text("   ".to_string())];
        assert_eq!(
            resolve_response(&blocks, &resolve_ctx()).unwrap_err(),
            SceneError::NoContentInResponse
        );
        assert_eq!(
            resolve_response(&[], &resolve_ctx()).unwrap_err(),
            SceneError::NoContentInResponse
        );
    }

    // -- edit orchestrator -------------------------------------------------

    #[test]
    fn edit_intent_examples_from_the_ui() {
        assert_eq!(
            classify_edit_intent("fix the lighting and shadows"),
            EditIntent::BlendRepair
        );
        assert_eq!(
            classify_edit_intent("add the missing historical person"),
            EditIntent::RestorePerson
        );
        assert_eq!(classify_edit_intent("make the sky pink"), EditIntent::General);
    }

    #[test]
    fn blend_triggers_take_priority_over_add() {
        // "natural" is a blend trigger even though "add" and "person" occur.
        assert_eq!(
            classify_edit_intent("add a natural person"),
            EditIntent::BlendRepair
        );
    }

    fn prior_image() -> GeneratedImage {
        let ctx = resolve_ctx();
        resolve_response(
            &[ResponseBlock::Inline {
                mime_type: "image/png".to_string(),
                data: vec![1, 2, 3],
            }],
            &ctx,
        )
        .unwrap()
    }

    #[test]
    fn edit_request_attaches_only_the_prior_image() {
        let ledger = ConversationLedger::new();
        let request = build_edit_request(
            &prior_image(),
            "make the sky pink",
            &ledger,
            Orientation::Portrait,
        )
        .unwrap();

        assert_eq!(request.parts.len(), 2);
        assert!(matches!(request.parts[0], RequestPart::Image { .. }));
        assert!(matches!(request.parts[1], RequestPart::Text(_)));
        assert_eq!(request.orientation, Orientation::Portrait);
        assert!(request.instruction.contains("make the sky pink"));
        assert!(request.instruction.contains("no additions, no removals"));
    }

    #[test]
    fn edit_request_summarizes_the_last_three_edits() {
        let mut ledger = ConversationLedger::new();
        for text in ["one", "two", "three", "four"] {
            ledger.append(EntryKind::Edit, text);
        }
        let request = build_edit_request(
            &prior_image(),
            "make the sky pink",
            &ledger,
            Orientation::Landscape,
        )
        .unwrap();
        assert!(request
            .instruction
            .starts_with("Following previous edits (two, three, four), now:"));
    }

    #[test]
    fn unusable_prior_payloads_block_editing() {
        let ledger = ConversationLedger::new();

        let mut empty = prior_image();
        empty.payload = ImagePayload {
            data: String::new(),
            mime_type: "image/png".to_string(),
        };
        assert_eq!(
            build_edit_request(&empty, "warmer", &ledger, Orientation::Square).unwrap_err(),
            SceneError::InvalidImageData
        );

        let mut corrupted = prior_image();
        corrupted.payload = ImagePayload {
            data: "???###".to_string(),
            mime_type: "image/png".to_string(),
        };
        assert_eq!(
            build_edit_request(&corrupted, "warmer", &ledger, Orientation::Square).unwrap_err(),
            SceneError::CorruptedImageData
        );
    }

    // -- simulated backend and engine --------------------------------------

    #[test]
    fn no_credential_selects_the_simulated_backend() {
        let temp = tempfile::tempdir().unwrap();
        let engine = SceneEngine::new(temp.path().join("events.jsonl"), None).unwrap();
        assert!(engine.is_simulated());
        assert_eq!(engine.backend_name(), "simulated");

        let keyed = SceneEngine::new(temp.path().join("events2.jsonl"), Some("k".to_string()))
            .unwrap();
        assert!(!keyed.is_simulated());
        assert_eq!(keyed.backend_name(), "live");
    }

    #[test]
    fn demo_generation_returns_high_quality_after_the_fixed_delay() {
        let temp = tempfile::tempdir().unwrap();
        let delay = Duration::from_millis(50);
        let mut engine = SceneEngine::with_backend(
            temp.path().join("events.jsonl"),
            Box::new(SimulatedBackend::with_delays(delay, Duration::ZERO)),
        )
        .unwrap();
        engine
            .add_photo("h.png", png_of_color(120, 90, 60), "image/png")
            .unwrap();
        engine
            .add_photo("c.png", png_of_color(80, 180, 220), "image/png")
            .unwrap();

        let started = Instant::now();
        let image = engine
            .generate("birthday", Orientation::Landscape, &StyleSettings::default())
            .unwrap();
        assert!(started.elapsed() >= delay);
        assert_eq!(image.quality, "High");
        assert!(!image.payload.data.is_empty());
        assert_eq!(image.scenario_id, "birthday");
        assert_eq!(image.expected_people, Some(2));
    }

    #[test]
    fn demo_photos_classify_into_all_three_roles() {
        let (mut engine, _temp) = demo_engine();
        engine.load_demo_photos().unwrap();
        let photos = engine.session().photos();
        assert_eq!(photos.len(), 3);
        let roles: Vec<PhotoRole> = photos.iter().map(|p| p.role).collect();
        assert!(roles.contains(&PhotoRole::Historical));
        assert!(roles.contains(&PhotoRole::Current));
        assert!(roles.contains(&PhotoRole::Background));
    }

    #[test]
    fn every_sample_set_produces_three_decodable_photos() {
        for selector in 0..3 {
            let set = demo_sample_set(selector).unwrap();
            assert_eq!(set.len(), 3);
            for sample in set {
                classify_photo(&sample.bytes).unwrap();
            }
        }
    }

    #[test]
    fn edit_supersedes_the_prior_record_and_extends_history() {
        let (mut engine, _temp) = demo_engine();
        engine.load_demo_photos().unwrap();
        let generated = engine
            .generate("wedding", Orientation::Landscape, &StyleSettings::default())
            .unwrap();

        let edited = engine
            .edit(None, "make the sky pink", Orientation::Landscape)
            .unwrap();
        assert_eq!(edited.edit_history, vec!["make the sky pink".to_string()]);

        let current: Vec<&str> = engine
            .session()
            .current_images()
            .iter()
            .map(|row| row.id.as_str())
            .collect();
        assert_eq!(current, vec![edited.id.as_str()]);
        assert!(engine.session().image(&generated.id).is_some());

        let edits = engine.session().ledger().recent(5, EntryKind::Edit);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].content, "make the sky pink");
    }

    #[test]
    fn variation_records_a_second_image_without_superseding() {
        let (mut engine, _temp) = demo_engine();
        engine.load_demo_photos().unwrap();
        let first = engine
            .generate("vacation", Orientation::Square, &StyleSettings::default())
            .unwrap();
        let variation = engine
            .variation(&first.id, Orientation::Square, &StyleSettings::default())
            .unwrap();

        assert!(variation.description.ends_with("(Variation)"));
        assert_eq!(engine.session().current_images().len(), 2);
        let stored = engine.session().image(&variation.id).unwrap();
        assert!(stored.description.ends_with("(Variation)"));

        // One ledger entry per user action.
        let kinds: Vec<EntryKind> = engine
            .session()
            .ledger()
            .entries()
            .iter()
            .map(|entry| entry.kind)
            .collect();
        let generations = kinds.iter().filter(|k| **k == EntryKind::Generation).count();
        let variations = kinds.iter().filter(|k| **k == EntryKind::Variation).count();
        assert_eq!(generations, 1);
        assert_eq!(variations, 1);
    }

    #[test]
    fn enhancement_marks_the_photo_and_replaces_bytes() {
        let (mut engine, _temp) = demo_engine();
        let id = engine
            .add_photo("h.png", png_of_color(120, 90, 60), "image/png")
            .unwrap();
        engine.enhance_photo(&id, None).unwrap();

        let photo = engine.session().photo(&id).unwrap();
        assert!(photo.enhanced);
        assert_eq!(photo.mime_type, "image/svg+xml");
    }

    #[test]
    fn generation_never_calls_the_backend_when_preconditions_fail() {
        struct PanickingBackend;
        impl SceneBackend for PanickingBackend {
            fn name(&self) -> &str {
                "panicking"
            }
            fn quality_label(&self) -> &str {
                "High"
            }
            fn feature_tags(&self) -> Vec<String> {
                Vec::new()
            }
            fn generate(&self, _request: &super::SceneRequest) -> anyhow::Result<Vec<ResponseBlock>> {
                panic!("backend must not be called");
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let mut engine = SceneEngine::with_backend(
            temp.path().join("events.jsonl"),
            Box::new(PanickingBackend),
        )
        .unwrap();
        // Only a historical photo: the current role is missing.
        engine
            .add_photo("h.png", png_of_color(120, 90, 60), "image/png")
            .unwrap();

        let err = engine
            .generate("wedding", Orientation::Landscape, &StyleSettings::default())
            .unwrap_err();
        assert_eq!(rekindle_contracts::errors::error_code(&err), "PRECONDITION_FAILED");
    }

    // -- batch -------------------------------------------------------------

    #[test]
    fn batch_isolates_failures_and_preserves_length() {
        let (mut engine, _temp) = demo_engine();
        engine.load_demo_photos().unwrap();

        let ids = vec![
            "wedding".to_string(),
            "no-such-scenario".to_string(),
            "holiday".to_string(),
        ];
        let outcomes = engine
            .run_batch(&ids, Orientation::Landscape, &StyleSettings::default())
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
        assert!(outcomes[2].is_success());
    }

    #[test]
    fn batch_failures_carry_the_precondition_code() {
        let (mut engine, _temp) = demo_engine();
        // Historical only: every generation fails its precondition.
        engine
            .add_photo("h.png", png_of_color(120, 90, 60), "image/png")
            .unwrap();

        let ids = vec!["wedding".to_string(), "holiday".to_string()];
        let outcomes = engine
            .run_batch(&ids, Orientation::Landscape, &StyleSettings::default())
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes {
            match outcome {
                super::BatchOutcome::Failure { code, .. } => {
                    assert_eq!(code, "PRECONDITION_FAILED")
                }
                super::BatchOutcome::Success { .. } => panic!("expected failure"),
            }
        }
    }
}
