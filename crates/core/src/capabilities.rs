//! Capability sets and output-parameter limits per model.
//!
//! A model's capabilities start from its provider format's ceiling, are
//! narrowed by the built-in catalog when the provider model id is known,
//! and are finally narrowed by the explicit flags in its [`ModelConfig`].
//! Capabilities never exceed the format ceiling.

use serde::Serialize;

use crate::config::{ModelConfig, ProviderFormat};
use crate::error::CoreError;
use crate::request::{
    GenerationRequest, Mode, OutputParams, Resolution, DEFAULT_DURATION_SECS, DEFAULT_FPS,
    DEFAULT_RESOLUTION,
};

/// Features a bound model supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub img2video: bool,
    pub first_last_frame: bool,
    /// A last frame may be sent without a first frame.
    pub last_frame_only: bool,
    pub music: bool,
    /// Provider exposes a cancel endpoint.
    pub remote_cancel: bool,
}

impl Capabilities {
    /// Everything the wire format can express.
    pub fn ceiling(format: ProviderFormat) -> Self {
        match format {
            ProviderFormat::Volcengine => Self {
                img2video: true,
                first_last_frame: true,
                last_frame_only: true,
                music: true,
                remote_cancel: true,
            },
            ProviderFormat::Aliyun => Self {
                img2video: true,
                first_last_frame: false,
                last_frame_only: false,
                music: true,
                remote_cancel: false,
            },
            ProviderFormat::Zhipu => Self {
                img2video: true,
                first_last_frame: true,
                last_frame_only: false,
                music: true,
                remote_cancel: false,
            },
            ProviderFormat::OpenAiCompatible => Self {
                img2video: true,
                first_last_frame: false,
                last_frame_only: false,
                music: false,
                remote_cancel: false,
            },
        }
    }

    /// Reject a request that needs a feature this model lacks.
    ///
    /// Last-frame-only requests need first/last-frame control and a wire
    /// format that accepts a last frame without a first one; plain
    /// image-to-video only anchors the opening frame.
    pub fn check(&self, model_id: &str, request: &GenerationRequest) -> Result<(), CoreError> {
        match request.mode {
            Mode::TextToVideo => {}
            Mode::FirstFrame if !self.img2video => {
                return Err(CoreError::Validation(format!(
                    "Model {model_id} does not support image-to-video"
                )));
            }
            Mode::LastFrame | Mode::FirstLastFrame if !self.first_last_frame => {
                return Err(CoreError::Validation(format!(
                    "Model {model_id} does not support first/last-frame control"
                )));
            }
            Mode::LastFrame if !self.last_frame_only => {
                return Err(CoreError::Validation(format!(
                    "Model {model_id} cannot generate from a last frame alone"
                )));
            }
            _ => {}
        }
        if request.wants_music() && !self.music {
            return Err(CoreError::Validation(format!(
                "Model {model_id} does not support background music"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parameter limits
// ---------------------------------------------------------------------------

/// Allowed clip lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationRule {
    /// Only these values; others snap to the closest.
    Choices(&'static [u32]),
    /// Any value in `min..=max`; others clamp.
    Range { min: u32, max: u32 },
}

impl DurationRule {
    pub fn normalize(self, secs: u32) -> u32 {
        match self {
            DurationRule::Choices(values) => closest(values, secs).unwrap_or(secs),
            DurationRule::Range { min, max } => secs.clamp(min, max),
        }
    }
}

/// Output parameters a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ParamLimits {
    pub resolutions: &'static [Resolution],
    pub durations: DurationRule,
    pub fps: &'static [u32],
}

impl ParamLimits {
    /// Limits for provider models the catalog does not know.
    pub const GENERIC: ParamLimits = ParamLimits {
        resolutions: &Resolution::ALL,
        durations: DurationRule::Range { min: 1, max: 30 },
        fps: &[15, 24, 30],
    };
}

fn closest(values: &[u32], target: u32) -> Option<u32> {
    values
        .iter()
        .copied()
        .min_by_key(|v| (i64::from(*v) - i64::from(target)).abs())
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Declared features and limits of a known provider model.
#[derive(Debug)]
pub struct CatalogEntry {
    pub format: ProviderFormat,
    pub model: &'static str,
    pub img2video: bool,
    pub first_last_frame: bool,
    pub music: bool,
    pub limits: ParamLimits,
}

const HD: &[Resolution] = &[Resolution::P720, Resolution::P1080];
const SD_HD: &[Resolution] = &[Resolution::P480, Resolution::P720, Resolution::P1080];

pub static CATALOG: &[CatalogEntry] = &[
    CatalogEntry {
        format: ProviderFormat::Volcengine,
        model: "doubao-seedance-1-5-pro-251215",
        img2video: true,
        first_last_frame: true,
        music: true,
        limits: ParamLimits {
            resolutions: HD,
            durations: DurationRule::Choices(&[5, 10]),
            fps: &[24],
        },
    },
    CatalogEntry {
        format: ProviderFormat::Volcengine,
        model: "doubao-seedance-1-0-pro-250528",
        img2video: true,
        first_last_frame: true,
        music: false,
        limits: ParamLimits {
            resolutions: HD,
            durations: DurationRule::Choices(&[5]),
            fps: &[24],
        },
    },
    CatalogEntry {
        format: ProviderFormat::Aliyun,
        model: "wan2.6-i2v-flash",
        img2video: true,
        first_last_frame: false,
        music: true,
        limits: ParamLimits {
            resolutions: HD,
            durations: DurationRule::Range { min: 2, max: 15 },
            fps: &[30],
        },
    },
    CatalogEntry {
        format: ProviderFormat::Aliyun,
        model: "wan2.5-i2v-plus",
        img2video: true,
        first_last_frame: false,
        music: true,
        limits: ParamLimits {
            resolutions: SD_HD,
            durations: DurationRule::Choices(&[5, 10]),
            fps: &[30],
        },
    },
    CatalogEntry {
        format: ProviderFormat::Aliyun,
        model: "wan2.5-t2v-turbo",
        img2video: false,
        first_last_frame: false,
        music: false,
        limits: ParamLimits {
            resolutions: SD_HD,
            durations: DurationRule::Choices(&[5]),
            fps: &[30],
        },
    },
    CatalogEntry {
        format: ProviderFormat::Zhipu,
        model: "cogvideox-3",
        img2video: true,
        first_last_frame: true,
        music: true,
        limits: ParamLimits {
            resolutions: &[Resolution::P720, Resolution::P1080, Resolution::K4],
            durations: DurationRule::Choices(&[5, 10]),
            fps: &[30, 60],
        },
    },
    CatalogEntry {
        format: ProviderFormat::Zhipu,
        model: "cogvideox-2",
        img2video: true,
        first_last_frame: false,
        music: false,
        limits: ParamLimits {
            resolutions: HD,
            durations: DurationRule::Choices(&[5]),
            fps: &[30, 60],
        },
    },
];

/// Look up a provider model id in the catalog (case-insensitive).
pub fn catalog_entry(format: ProviderFormat, model: &str) -> Option<&'static CatalogEntry> {
    let model = model.trim();
    CATALOG
        .iter()
        .find(|e| e.format == format && e.model.eq_ignore_ascii_case(model))
}

// ---------------------------------------------------------------------------
// Model profile
// ---------------------------------------------------------------------------

/// Capabilities, limits and defaults derived for one registered model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelProfile {
    pub capabilities: Capabilities,
    pub limits: ParamLimits,
    pub default_resolution: Resolution,
    pub default_duration: u32,
    pub default_fps: u32,
}

impl ModelProfile {
    pub fn derive(format: ProviderFormat, config: &ModelConfig) -> Self {
        let ceiling = Capabilities::ceiling(format);
        let entry = catalog_entry(format, &config.model);

        let (cat_i2v, cat_fl, cat_music) = entry
            .map(|e| (e.img2video, e.first_last_frame, e.music))
            .unwrap_or((ceiling.img2video, ceiling.first_last_frame, ceiling.music));

        let img2video = ceiling.img2video && cat_i2v && config.support_img2video;
        let first_last_frame = ceiling.first_last_frame
            && config.support_img2video
            && config.support_first_last.unwrap_or(cat_fl);
        let music = ceiling.music && config.support_music.unwrap_or(cat_music);

        let limits = entry.map(|e| e.limits).unwrap_or(ParamLimits::GENERIC);

        let default_fps = config
            .default_fps
            .or_else(|| closest(limits.fps, DEFAULT_FPS))
            .unwrap_or(DEFAULT_FPS);

        Self {
            capabilities: Capabilities {
                img2video,
                first_last_frame,
                last_frame_only: first_last_frame && ceiling.last_frame_only,
                music,
                remote_cancel: ceiling.remote_cancel,
            },
            limits,
            default_resolution: config.default_resolution.unwrap_or(DEFAULT_RESOLUTION),
            default_duration: config.default_duration.unwrap_or(DEFAULT_DURATION_SECS),
            default_fps,
        }
    }

    /// Resolve the request's output parameters against the model defaults
    /// and limits. Unsupported values are adjusted, not rejected; each
    /// adjustment of a caller-supplied value yields a warning.
    pub fn normalize(&self, request: &GenerationRequest) -> (OutputParams, Vec<String>) {
        let mut warnings = Vec::new();

        let wanted_res = request.resolution.unwrap_or(self.default_resolution);
        let resolution = if self.limits.resolutions.contains(&wanted_res) {
            wanted_res
        } else {
            let fallback = if self.limits.resolutions.contains(&DEFAULT_RESOLUTION) {
                DEFAULT_RESOLUTION
            } else {
                self.limits
                    .resolutions
                    .first()
                    .copied()
                    .unwrap_or(DEFAULT_RESOLUTION)
            };
            if request.resolution.is_some() {
                warnings.push(format!(
                    "resolution {wanted_res} not supported, using {fallback}"
                ));
            }
            fallback
        };

        let wanted_dur = request.duration_secs.unwrap_or(self.default_duration);
        let duration_secs = self.limits.durations.normalize(wanted_dur);
        if duration_secs != wanted_dur && request.duration_secs.is_some() {
            warnings.push(format!(
                "duration {wanted_dur}s not supported, using {duration_secs}s"
            ));
        }

        let wanted_fps = request.fps.unwrap_or(self.default_fps);
        let fps = if self.limits.fps.contains(&wanted_fps) {
            wanted_fps
        } else {
            closest(self.limits.fps, wanted_fps).unwrap_or(wanted_fps)
        };
        if fps != wanted_fps && request.fps.is_some() {
            warnings.push(format!("fps {wanted_fps} not supported, using {fps}"));
        }

        (
            OutputParams {
                resolution,
                fps,
                duration_secs,
            },
            warnings,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
