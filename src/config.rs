//! Application configuration, loaded from TOML with `CAMSTREAM_` env overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::capture::BackendKind;
use crate::error::ConfigError;
use crate::platform::PlatformOverride;
use crate::process::ProcessingType;

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sources: Vec<SourceConfig>,
    pub composite: CompositeConfig,
    pub video: VideoConfig,
    pub platform: PlatformOverride,
    pub ui: UiConfig,
}

/// One camera feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub default_poll: BackendKind,
    pub linux_poll: Option<BackendKind>,
    pub windows_poll: Option<BackendKind>,

    /// USB capture index
    pub index: u32,
    /// CSI sensor index
    #[serde(alias = "mmal_index")]
    pub csi_index: u32,
    pub dev_path: String,
    pub uri: String,
    pub static_img: String,

    /// Preferred capture size, 0 leaves it to the backend.
    pub stream_width: u32,
    pub stream_height: u32,

    pub flip_horiz: bool,
    pub flip_vert: bool,

    /// Exposure in microseconds, 0 for automatic.
    pub video_exposure_micro: u32,
    pub analog_gain: f32,
    pub digital_gain: f32,
    pub awb_red_gain: f32,
    pub awb_blue_gain: f32,

    pub processing: ProcessingSetting,
    /// Level for static thresholding, 0-255.
    pub threshold: u8,
    /// Blend amount when composited.
    pub alpha: f32,
}

/// `processing` accepts a named type, or a bare number meaning static
/// thresholding at that level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessingSetting {
    Named(ProcessingType),
    Level(u8),
}

impl Default for ProcessingSetting {
    fn default() -> Self {
        ProcessingSetting::Named(ProcessingType::None)
    }
}

impl SourceConfig {
    pub fn processing_type(&self) -> ProcessingType {
        match self.processing {
            ProcessingSetting::Named(ty) => ty,
            ProcessingSetting::Level(_) => ProcessingType::StaticThreshold,
        }
    }

    pub fn threshold_level(&self) -> u8 {
        match self.processing {
            ProcessingSetting::Level(level) => level,
            ProcessingSetting::Named(_) => self.threshold,
        }
    }

    /// A source that shows a still image from disk.
    pub fn static_image(path: impl Into<String>) -> Self {
        Self {
            default_poll: BackendKind::StaticImage,
            static_img: path.into(),
            ..Self::default()
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            default_poll: BackendKind::UsbIndex,
            linux_poll: None,
            windows_poll: None,
            index: 0,
            csi_index: 0,
            dev_path: "/dev/video0".into(),
            uri: "rtsp://localhost:554/unicast".into(),
            static_img: "testimage.png".into(),
            stream_width: 640,
            stream_height: 480,
            flip_horiz: false,
            flip_vert: false,
            video_exposure_micro: 0,
            analog_gain: 1.0,
            digital_gain: 1.0,
            awb_red_gain: 1.0,
            awb_blue_gain: 1.0,
            processing: ProcessingSetting::default(),
            threshold: 128,
            alpha: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    #[default]
    Y4m,
    Gstreamer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub encoder: EncoderKind,
    pub fourcc: String,
    pub fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            encoder: EncoderKind::Y4m,
            fourcc: "avc1".into(),
            fps: 30,
        }
    }
}

impl VideoConfig {
    /// The fourcc as four bytes, space padded.
    pub fn fourcc_bytes(&self) -> [u8; 4] {
        let mut out = *b"    ";
        for (dst, src) in out.iter_mut().zip(self.fourcc.bytes()) {
            *dst = src;
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub tick_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self { tick_ms: 1000 }
    }
}

impl UiConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceConfig::static_image("testimage.png")],
            composite: CompositeConfig::default(),
            video: VideoConfig::default(),
            platform: PlatformOverride::Auto,
            ui: UiConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from an optional TOML file, then apply `CAMSTREAM_*` environment
    /// overrides (`__` separates nested keys, e.g. `CAMSTREAM_COMPOSITE__WIDTH`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("CAMSTREAM").separator("__"))
            .build()?;
        Self::finish(cfg.try_deserialize()?)
    }

    /// Parse a TOML document, without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?;
        Self::finish(cfg.try_deserialize()?)
    }

    fn finish(cfg: AppConfig) -> Result<Self, ConfigError> {
        if cfg.composite.width == 0 || cfg.composite.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "composite size {}x{} must be non-zero",
                cfg.composite.width, cfg.composite.height
            )));
        }
        if cfg.video.fps == 0 {
            return Err(ConfigError::Invalid("video fps must be non-zero".into()));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sources_and_overrides() {
        let cfg = AppConfig::from_toml_str(
            r#"
            platform = "desktop"

            [[sources]]
            default_poll = "cvusb"
            linux_poll = "mmal"
            index = 2
            processing = "yen_threshold"

            [[sources]]
            default_poll = "static"
            static_img = "a.png"
            processing = 90

            [composite]
            width = 1280
            height = 720
            "#,
        )
        .unwrap();

        assert_eq!(cfg.platform, PlatformOverride::Desktop);
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].default_poll, BackendKind::UsbIndex);
        assert_eq!(cfg.sources[0].linux_poll, Some(BackendKind::CsiSensor));
        assert_eq!(cfg.sources[0].index, 2);
        assert_eq!(cfg.sources[0].processing_type(), ProcessingType::YenThreshold);
        assert_eq!(cfg.sources[1].processing_type(), ProcessingType::StaticThreshold);
        assert_eq!(cfg.sources[1].threshold_level(), 90);
        assert_eq!(cfg.composite.width, 1280);
        assert_eq!(cfg.video.fps, 30);
    }

    #[test]
    fn zero_composite_is_rejected() {
        let err = AppConfig::from_toml_str("[composite]\nwidth = 0\n");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn fourcc_is_padded() {
        let video = VideoConfig {
            fourcc: "Y8".into(),
            ..VideoConfig::default()
        };
        assert_eq!(&video.fourcc_bytes(), b"Y8  ");
    }
}
