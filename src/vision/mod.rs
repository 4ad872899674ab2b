//! Vision Layer
//!
//! Object detection over a frozen image and text recognition over the
//! cropped regions. Both engines sit behind traits so the pipeline only
//! depends on what they return:
//! - [`Analyzer`]: image in, [`DetectionResult`] out (YOLO via ONNX Runtime,
//!   or replayed from a JSON file)
//! - [`Recognizer`]: crop in, text out, asynchronously (PaddleOCR via ONNX
//!   Runtime)

pub mod detection;
pub mod models;
pub mod ocr;
pub mod preprocess;
pub mod replay;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::geometry::NormalizedBox;
use crate::mode::Mode;

pub use detection::{DetectorConfig, OnnxAnalyzer};
pub use models::{ModelManager, ModelType};
pub use ocr::{OnnxRecognizer, RecognitionConfig};
pub use replay::ReplayAnalyzer;

/// One detector output: a label and a box normalized to the analyzed image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    #[serde(flatten)]
    pub bbox: NormalizedBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            label: label.into(),
            bbox: NormalizedBox::new(x1, y1, x2, y2),
        }
    }
}

/// Everything the detector found in one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
    #[serde(default)]
    pub inference_time_ms: u64,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }
}

/// Model and label data for one detection mode
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorProfile {
    pub mode: Mode,
    pub model_path: PathBuf,
    pub labels_path: PathBuf,
}

/// Object detector.
///
/// `restart` drops accumulated state, `create` allocates resources for a
/// profile; a mode switch calls them in that order.
pub trait Analyzer: Send {
    /// Drop the loaded model and any accumulated state
    fn restart(&mut self);
    /// Load the model and labels for `profile`
    fn create(&mut self, profile: &DetectorProfile) -> Result<()>;
    /// Run detection on a full image
    fn detect(&mut self, image: &RgbaImage) -> Result<DetectionResult>;
}

impl<A: Analyzer + ?Sized> Analyzer for Box<A> {
    fn restart(&mut self) {
        (**self).restart()
    }

    fn create(&mut self, profile: &DetectorProfile) -> Result<()> {
        (**self).create(profile)
    }

    fn detect(&mut self, image: &RgbaImage) -> Result<DetectionResult> {
        (**self).detect(image)
    }
}

/// Why a region produced no text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecognitionError {
    #[error("recognition engine failed: {0}")]
    Engine(String),
    #[error("crop has no pixels")]
    EmptyCrop,
    #[error("recognizer is not available")]
    Unavailable,
}

/// Text recognizer for one cropped region
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Recognize the text in `crop`. Empty text is a success.
    async fn recognize(&self, crop: RgbaImage) -> Result<String, RecognitionError>;
}

/// Stand-in when no recognition model could be loaded; every region is "N/A"
pub struct UnavailableRecognizer;

#[async_trait]
impl Recognizer for UnavailableRecognizer {
    async fn recognize(&self, _crop: RgbaImage) -> Result<String, RecognitionError> {
        Err(RecognitionError::Unavailable)
    }
}

/// Parse a labels file: one label per line, blank lines ignored
pub fn parse_labels(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load a labels file from disk
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read labels file {:?}", path))?;
    Ok(parse_labels(&content))
}
