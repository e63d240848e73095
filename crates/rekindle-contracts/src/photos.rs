use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role a photo plays in the composite scene. Assigned by the classifier on
/// upload; the user may override by cycling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoRole {
    Historical,
    Current,
    Background,
}

impl PhotoRole {
    /// Manual override order: current -> historical -> background -> current.
    pub fn cycle(self) -> Self {
        match self {
            PhotoRole::Current => PhotoRole::Historical,
            PhotoRole::Historical => PhotoRole::Background,
            PhotoRole::Background => PhotoRole::Current,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhotoRole::Historical => "historical",
            PhotoRole::Current => "current",
            PhotoRole::Background => "background",
        }
    }
}

impl fmt::Display for PhotoRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One uploaded image. Owned exclusively by the session photo set.
#[derive(Debug, Clone)]
pub struct Photo {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub role: PhotoRole,
    pub auto_detected: bool,
    pub enhanced: bool,
}

impl Photo {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>, mime_type: impl Into<String>, role: PhotoRole) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            bytes,
            mime_type: mime_type.into(),
            role,
            auto_detected: true,
            enhanced: false,
        }
    }
}

/// Requested output framing, rendered into the instruction text as an explicit
/// aspect-ratio clause because the backend has no hard constraint mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

impl Orientation {
    pub fn aspect_ratio(&self) -> &'static str {
        match self {
            Orientation::Landscape => "16:9",
            Orientation::Portrait => "9:16",
            Orientation::Square => "1:1",
        }
    }

    pub fn framing(&self) -> &'static str {
        match self {
            Orientation::Landscape => "wide landscape",
            Orientation::Portrait => "tall portrait",
            Orientation::Square => "square",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Square => "square",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advanced scene controls, carried into the instruction text as separate
/// descriptive clauses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleSettings {
    pub cultural_style: String,
    pub time_period: String,
    pub clothing_style: String,
    pub location_style: String,
}

impl Default for StyleSettings {
    fn default() -> Self {
        Self {
            cultural_style: "western".to_string(),
            time_period: "modern".to_string(),
            clothing_style: "formal".to_string(),
            location_style: "indoor".to_string(),
        }
    }
}
