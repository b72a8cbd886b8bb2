//! Render parameters: request shape, defaults, and clamping.
//!
//! A caller submits a [`RenderRequest`] where every field is optional.
//! [`RenderParameters::resolve`] fills in defaults and clamps the image
//! size to the configured [`RenderLimits`], producing the fully specified
//! parameters a job carries for its whole life.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest caption accepted before truncation.
pub const MAX_CAPTION_CHARS: usize = 200;

/// Smallest width or height a render may request.
pub const MIN_DIMENSION: u32 = 16;

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Configured default and maximum image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderLimits {
    pub default_width: u32,
    pub default_height: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            default_width: 800,
            default_height: 600,
            max_width: 2000,
            max_height: 2000,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameter sub-objects
// ---------------------------------------------------------------------------

/// Output image encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
}

impl ImageFormat {
    /// File extension without the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
        }
    }
}

/// Camera placement before the image is captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Re-fit the view to all displayed models.
    pub fit: bool,
    /// Restore a previously saved named view instead of fitting.
    pub named_view: Option<String>,
    /// Extra zoom factor applied after positioning (1.0 = none).
    pub zoom: Option<f64>,
    /// Rotation in degrees around the screen Y axis.
    pub turn_y: Option<f64>,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            fit: true,
            named_view: None,
            zoom: None,
            turn_y: None,
        }
    }
}

/// Lighting presets understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightingPreset {
    #[default]
    Default,
    Simple,
    Soft,
    Full,
    Flat,
}

impl LightingPreset {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Simple => "simple",
            Self::Soft => "soft",
            Self::Full => "full",
            Self::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LightingSettings {
    pub preset: LightingPreset,
    pub shadows: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSettings {
    /// Named color or `#rrggbb`.
    pub color: String,
    /// Save with an alpha channel (PNG only).
    pub transparent: bool,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            color: "white".to_string(),
            transparent: false,
        }
    }
}

/// Molecular representation, ordered from most to least expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    Surface,
    Sphere,
    BallAndStick,
    #[default]
    Cartoon,
    Stick,
}

impl Representation {
    /// The next cheaper representation; [`Representation::Stick`] is the floor.
    pub fn simpler(self) -> Self {
        match self {
            Self::Surface => Self::Sphere,
            Self::Sphere => Self::BallAndStick,
            Self::BallAndStick => Self::Cartoon,
            Self::Cartoon | Self::Stick => Self::Stick,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Surface => "surface",
            Self::Sphere => "sphere",
            Self::BallAndStick => "ball_and_stick",
            Self::Cartoon => "cartoon",
            Self::Stick => "stick",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleSettings {
    pub representation: Representation,
    /// Coloring scheme keyword, e.g. `bychain` or `byelement`.
    pub color_scheme: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleBarSettings {
    pub enabled: bool,
    /// Bar length in angstroms.
    pub length: f64,
}

impl Default for ScaleBarSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            length: 10.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / resolved parameters
// ---------------------------------------------------------------------------

/// Caller-facing render request; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub format: Option<ImageFormat>,
    pub camera: Option<CameraSettings>,
    pub lighting: Option<LightingSettings>,
    pub background: Option<BackgroundSettings>,
    pub style: Option<StyleSettings>,
    pub scale_bar: Option<ScaleBarSettings>,
    pub caption: Option<String>,
}

/// Fully resolved parameters attached to a render job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParameters {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub camera: CameraSettings,
    pub lighting: LightingSettings,
    pub background: BackgroundSettings,
    pub style: StyleSettings,
    pub scale_bar: ScaleBarSettings,
    pub caption: Option<String>,
}

impl RenderParameters {
    /// Apply defaults and clamp the request to `limits`.
    ///
    /// Width and height are clamped into `MIN_DIMENSION..=max`; the caption
    /// is trimmed, dropped when empty, and truncated to
    /// [`MAX_CAPTION_CHARS`]. Fails only on values that cannot be clamped
    /// into something meaningful (non-finite zoom or scale bar length).
    pub fn resolve(request: RenderRequest, limits: &RenderLimits) -> Result<Self, CoreError> {
        let width = clamp_dimension(request.width.unwrap_or(limits.default_width), limits.max_width);
        let height =
            clamp_dimension(request.height.unwrap_or(limits.default_height), limits.max_height);

        let camera = request.camera.unwrap_or_default();
        if let Some(zoom) = camera.zoom {
            if !zoom.is_finite() || zoom <= 0.0 {
                return Err(CoreError::Validation(format!(
                    "Camera zoom must be a positive number, got {zoom}"
                )));
            }
        }
        if let Some(turn) = camera.turn_y {
            if !turn.is_finite() {
                return Err(CoreError::Validation("Camera turn must be finite".to_string()));
            }
        }

        let scale_bar = request.scale_bar.unwrap_or_default();
        if scale_bar.enabled && (!scale_bar.length.is_finite() || scale_bar.length <= 0.0) {
            return Err(CoreError::Validation(format!(
                "Scale bar length must be positive, got {}",
                scale_bar.length
            )));
        }

        let caption = request
            .caption
            .map(|c| c.trim().chars().take(MAX_CAPTION_CHARS).collect::<String>())
            .filter(|c| !c.is_empty());

        Ok(Self {
            width,
            height,
            format: request.format.unwrap_or_default(),
            camera,
            lighting: request.lighting.unwrap_or_default(),
            background: request.background.unwrap_or_default(),
            style: request.style.unwrap_or_default(),
            scale_bar,
            caption,
        })
    }
}

fn clamp_dimension(value: u32, max: u32) -> u32 {
    value.clamp(MIN_DIMENSION, max.max(MIN_DIMENSION))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RenderLimits {
        RenderLimits {
            default_width: 800,
            default_height: 600,
            max_width: 1920,
            max_height: 1080,
        }
    }

    #[test]
    fn empty_request_uses_defaults() {
        let params = RenderParameters::resolve(RenderRequest::default(), &limits()).unwrap();
        assert_eq!((params.width, params.height), (800, 600));
        assert_eq!(params.format, ImageFormat::Png);
        assert_eq!(params.style.representation, Representation::Cartoon);
        assert!(params.camera.fit);
        assert_eq!(params.background.color, "white");
        assert!(params.caption.is_none());
    }

    #[test]
    fn oversized_request_is_clamped() {
        let request = RenderRequest {
            width: Some(10_000),
            height: Some(5_000),
            ..Default::default()
        };
        let params = RenderParameters::resolve(request, &limits()).unwrap();
        assert_eq!((params.width, params.height), (1920, 1080));
    }

    #[test]
    fn tiny_request_is_raised_to_minimum() {
        let request = RenderRequest {
            width: Some(0),
            height: Some(1),
            ..Default::default()
        };
        let params = RenderParameters::resolve(request, &limits()).unwrap();
        assert_eq!((params.width, params.height), (MIN_DIMENSION, MIN_DIMENSION));
    }

    #[test]
    fn caption_is_trimmed_and_truncated() {
        let request = RenderRequest {
            caption: Some(format!("  {}  ", "x".repeat(MAX_CAPTION_CHARS + 50))),
            ..Default::default()
        };
        let params = RenderParameters::resolve(request, &limits()).unwrap();
        assert_eq!(params.caption.unwrap().len(), MAX_CAPTION_CHARS);
    }

    #[test]
    fn blank_caption_is_dropped() {
        let request = RenderRequest {
            caption: Some("   ".into()),
            ..Default::default()
        };
        let params = RenderParameters::resolve(request, &limits()).unwrap();
        assert!(params.caption.is_none());
    }

    #[test]
    fn non_positive_zoom_rejected() {
        let request = RenderRequest {
            camera: Some(CameraSettings {
                zoom: Some(0.0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(RenderParameters::resolve(request, &limits()).is_err());
    }

    #[test]
    fn representation_simplifies_down_to_stick() {
        let mut rep = Representation::Surface;
        let mut seen = vec![rep];
        for _ in 0..6 {
            rep = rep.simpler();
            seen.push(rep);
        }
        assert_eq!(
            seen,
            vec![
                Representation::Surface,
                Representation::Sphere,
                Representation::BallAndStick,
                Representation::Cartoon,
                Representation::Stick,
                Representation::Stick,
                Representation::Stick,
            ]
        );
    }

    #[test]
    fn request_deserializes_partial_json() {
        let request: RenderRequest = serde_json::from_value(serde_json::json!({
            "width": 640,
            "format": "jpg",
            "style": { "representation": "ball_and_stick" }
        }))
        .unwrap();
        assert_eq!(request.width, Some(640));
        assert_eq!(request.format, Some(ImageFormat::Jpeg));
        assert_eq!(
            request.style.unwrap().representation,
            Representation::BallAndStick
        );
    }
}
