//! Application Configuration
//!
//! User settings and preferences stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::export::BoxFormat;
use crate::mode::Mode;
use crate::vision::{DetectorConfig, RecognitionConfig};

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// General settings
    pub general: GeneralConfig,
    /// Object detector settings
    pub detector: DetectorConfig,
    /// Text recognizer settings
    pub recognition: RecognitionConfig,
    /// Spoken announcements
    pub speech: SpeechSettings,
    /// Exported record format
    pub export: ExportSettings,
    /// Display surfaces boxes are mapped onto
    pub view: ViewConfig,
}

impl AppConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.detector.input_size == 0 {
            anyhow::bail!("detector.input_size must be at least 1");
        }
        if self.recognition.target_height == 0 || self.recognition.max_width == 0 {
            anyhow::bail!("recognition.target_height and recognition.max_width must be at least 1");
        }
        for (name, value) in [
            ("detector.confidence_threshold", self.detector.confidence_threshold),
            ("detector.iou_threshold", self.detector.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0 and 1, got {}", name, value);
            }
        }
        Ok(())
    }
}

/// General application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Mode active at startup
    pub default_mode: Mode,
}

/// Speech settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
    /// Speak announcements at all
    pub enabled: bool,
    /// External program to speak with (e.g. `espeak`); logged only when unset
    pub command: Option<String>,
    /// Announce each detection with its direction
    pub announce_direction: bool,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            command: None,
            announce_direction: true,
        }
    }
}

/// Export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Bounding box representation
    pub box_format: BoxFormat,
    /// Decimal digits kept in box coordinates
    pub decimals: u32,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            box_format: BoxFormat::Corners,
            decimals: 4,
        }
    }
}

/// View surface sizes in display pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewConfig {
    /// Live camera overlay, stretched over the whole frame
    pub live_width: f32,
    pub live_height: f32,
    /// Uploaded-image view, image aspect-fit inside it
    pub uploaded_width: f32,
    pub uploaded_height: f32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            live_width: 1080.0,
            live_height: 1440.0,
            uploaded_width: 1080.0,
            uploaded_height: 1440.0,
        }
    }
}

/// Default location of the config file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Invalid config {:?}", path))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {:?}", path))?;
    Ok(config)
}

/// Load configuration, falling back to defaults when missing or invalid
pub fn load_or_default(path: &Path) -> AppConfig {
    match load_config(path) {
        Ok(config) => {
            info!("Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            info!("Using default config ({:#})", e);
            AppConfig::default()
        }
    }
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}
