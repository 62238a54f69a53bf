//! Canonical generation request and its admission-time validation.
//!
//! The command layer builds a [`GenerationRequest`] after it has parsed the
//! user's text and resolved any image attachments. Everything here is
//! provider-independent; capability checks against a concrete model live in
//! [`crate::capabilities`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::RequesterId;

/// Maximum prompt length accepted at admission, in characters.
pub const MAX_PROMPT_CHARS: usize = 2000;

/// Upper bound of the music volume scale.
pub const MAX_MUSIC_VOLUME: u8 = 100;

/// Default music volume when the caller enables music without a level.
pub const DEFAULT_MUSIC_VOLUME: u8 = 50;

/// Fallbacks used when neither the request nor the model config sets a value.
pub const DEFAULT_RESOLUTION: Resolution = Resolution::P720;
pub const DEFAULT_FPS: u32 = 24;
pub const DEFAULT_DURATION_SECS: u32 = 5;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Generation mode. Determines how many image references are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "text2video")]
    TextToVideo,
    #[serde(rename = "img2video-first")]
    FirstFrame,
    #[serde(rename = "img2video-last")]
    LastFrame,
    #[serde(rename = "img2video-firstlast")]
    FirstLastFrame,
}

impl Mode {
    /// Exact number of image references this mode requires.
    pub fn required_images(self) -> usize {
        match self {
            Mode::TextToVideo => 0,
            Mode::FirstFrame | Mode::LastFrame => 1,
            Mode::FirstLastFrame => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::TextToVideo => "text2video",
            Mode::FirstFrame => "img2video-first",
            Mode::LastFrame => "img2video-last",
            Mode::FirstLastFrame => "img2video-firstlast",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Output resolution preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "4k")]
    K4,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::P480,
        Resolution::P720,
        Resolution::P1080,
        Resolution::K4,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::K4 => "4k",
        }
    }

    /// Pixel dimensions (width, height) for a landscape frame.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P480 => (854, 480),
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::K4 => (3840, 2160),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == lower)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Unknown resolution: '{s}'. Valid resolutions: 480p, 720p, 1080p, 4k"
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// Music
// ---------------------------------------------------------------------------

/// Background music style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MusicStyle {
    Cinematic,
    Upbeat,
    Calm,
    Dramatic,
    Romantic,
    Sad,
    Mysterious,
    Energetic,
    Peaceful,
    Epic,
}

impl MusicStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            MusicStyle::Cinematic => "cinematic",
            MusicStyle::Upbeat => "upbeat",
            MusicStyle::Calm => "calm",
            MusicStyle::Dramatic => "dramatic",
            MusicStyle::Romantic => "romantic",
            MusicStyle::Sad => "sad",
            MusicStyle::Mysterious => "mysterious",
            MusicStyle::Energetic => "energetic",
            MusicStyle::Peaceful => "peaceful",
            MusicStyle::Epic => "epic",
        }
    }
}

impl fmt::Display for MusicStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional background-music request attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicRequest {
    pub enabled: bool,
    #[serde(default)]
    pub style: Option<MusicStyle>,
    #[serde(default = "default_music_volume")]
    pub volume: u8,
}

fn default_music_volume() -> u8 {
    DEFAULT_MUSIC_VOLUME
}

impl MusicRequest {
    /// Music on, with an optional style, at the default volume.
    pub fn enabled(style: Option<MusicStyle>) -> Self {
        Self {
            enabled: true,
            style,
            volume: DEFAULT_MUSIC_VOLUME,
        }
    }

    /// Prompt suffix describing the requested soundtrack.
    pub fn prompt_hint(&self) -> String {
        match self.style {
            Some(style) => format!("background music: {style}, volume {}%", self.volume),
            None => format!("background music, volume {}%", self.volume),
        }
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Read-only reference to an input image (URL or data URI). The job never
/// owns image bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(pub String);

impl ImageRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// GenerationRequest
// ---------------------------------------------------------------------------

/// A structured request produced by the command layer.
///
/// `resolution`, `fps` and `duration_secs` are overrides; unset values fall
/// back to the bound model's defaults and then to the crate defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub requester: RequesterId,
    pub prompt: String,
    pub mode: Mode,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub fps: Option<u32>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
    #[serde(default)]
    pub music: Option<MusicRequest>,
    /// Target model id; `None` or `"default"` selects the registry default.
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerationRequest {
    /// Plain text-to-video request with every override left unset.
    pub fn text(requester: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            requester: RequesterId(requester.into()),
            prompt: prompt.into(),
            mode: Mode::TextToVideo,
            images: Vec::new(),
            resolution: None,
            fps: None,
            duration_secs: None,
            music: None,
            model: None,
        }
    }

    /// True when music was requested and switched on.
    pub fn wants_music(&self) -> bool {
        self.music.as_ref().is_some_and(|m| m.enabled)
    }

    /// Validate the request shape, independent of any model.
    ///
    /// Rules:
    /// - The prompt must not be blank and must not exceed [`MAX_PROMPT_CHARS`].
    /// - The image count must match [`Mode::required_images`].
    /// - Image references must not be blank.
    /// - `fps` and `duration_secs`, when set, must be positive.
    /// - Music volume must be within `0..=100`.
    pub fn validate(&self) -> Result<(), CoreError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(CoreError::Validation(
                "Prompt must not be empty".to_string(),
            ));
        }
        let chars = prompt.chars().count();
        if chars > MAX_PROMPT_CHARS {
            return Err(CoreError::Validation(format!(
                "Prompt must not exceed {MAX_PROMPT_CHARS} characters (got {chars})"
            )));
        }

        let required = self.mode.required_images();
        if self.images.len() != required {
            return Err(CoreError::Validation(format!(
                "Mode {} requires exactly {required} image reference(s), got {}",
                self.mode,
                self.images.len()
            )));
        }
        if let Some(i) = self.images.iter().position(|img| img.0.trim().is_empty()) {
            return Err(CoreError::Validation(format!(
                "Image reference at index {i} must not be empty"
            )));
        }

        if self.fps == Some(0) {
            return Err(CoreError::Validation(
                "Frame rate must be a positive integer".to_string(),
            ));
        }
        if self.duration_secs == Some(0) {
            return Err(CoreError::Validation(
                "Duration must be a positive number of seconds".to_string(),
            ));
        }

        if let Some(music) = &self.music {
            if music.volume > MAX_MUSIC_VOLUME {
                return Err(CoreError::Validation(format!(
                    "Music volume must be between 0 and {MAX_MUSIC_VOLUME}, got {}",
                    music.volume
                )));
            }
        }

        Ok(())
    }

    /// First-frame image, if the mode carries one.
    pub fn first_frame(&self) -> Option<&ImageRef> {
        match self.mode {
            Mode::FirstFrame | Mode::FirstLastFrame => self.images.first(),
            _ => None,
        }
    }

    /// Last-frame image, if the mode carries one.
    pub fn last_frame(&self) -> Option<&ImageRef> {
        match self.mode {
            Mode::LastFrame => self.images.first(),
            Mode::FirstLastFrame => self.images.get(1),
            _ => None,
        }
    }
}

/// Fully resolved output parameters bound to a job at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputParams {
    pub resolution: Resolution,
    pub fps: u32,
    pub duration_secs: u32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
