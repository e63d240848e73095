use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errors::SceneError;

/// Image payload as base64 text plus a declared media type. Real generated
/// pixels and synthesized placeholder SVGs share this shape so downstream
/// code never branches on how the image was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub data: String,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn from_bytes(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            data: BASE64.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    pub fn from_svg(svg: &str) -> Self {
        Self::from_bytes(svg.as_bytes(), "image/svg+xml")
    }

    pub fn is_svg(&self) -> bool {
        self.mime_type == "image/svg+xml"
    }

    /// Decodes the payload for reuse as an edit attachment. Empty payloads and
    /// payloads outside the base64 alphabet are unrecoverable for editing; the
    /// caller is expected to fall back to a variation.
    pub fn decode(&self) -> Result<Vec<u8>, SceneError> {
        let trimmed = self.data.trim();
        if trimmed.is_empty() {
            return Err(SceneError::InvalidImageData);
        }
        if !trimmed
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'='))
        {
            return Err(SceneError::CorruptedImageData);
        }
        BASE64
            .decode(trimmed.as_bytes())
            .map_err(|_| SceneError::CorruptedImageData)
    }
}

/// The result shown to the user after each generation, variation or edit.
/// Records are never mutated in place; an edit produces a new record that
/// supersedes the prior one in the current view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub scenario_id: String,
    pub scenario_title: String,
    pub description: String,
    pub payload: ImagePayload,
    pub created_at: String,
    pub historical_photos_used: usize,
    pub current_photos_used: usize,
    pub quality: String,
    pub processing_time: String,
    pub features: Vec<String>,
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub edit_history: Vec<String>,
    pub expected_people: Option<usize>,
}
