//! Detector that replays results recorded as JSON.
//!
//! The file holds a [`DetectionResult`]. Useful without a detector model and
//! for reproducing a session offline.

use anyhow::{Context, Result};
use image::RgbaImage;
use std::path::PathBuf;
use tracing::info;

use crate::vision::{Analyzer, DetectionResult, DetectorProfile};

pub struct ReplayAnalyzer {
    path: PathBuf,
    loaded: Option<DetectionResult>,
}

impl ReplayAnalyzer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded: None,
        }
    }

}

/// Parse recorded detections, ordering and clamping every box
pub fn parse_recorded(json: &str) -> Result<DetectionResult> {
    let mut result: DetectionResult = serde_json::from_str(json).context("Invalid detections JSON")?;
    for detection in &mut result.detections {
        detection.bbox = detection.bbox.clamped();
    }
    Ok(result)
}

impl Analyzer for ReplayAnalyzer {
    fn restart(&mut self) {
        self.loaded = None;
    }

    fn create(&mut self, profile: &DetectorProfile) -> Result<()> {
        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read detections file {:?}", self.path))?;
        let result = parse_recorded(&json)?;
        info!(
            "Replaying {} detections for {} mode from {:?}",
            result.len(),
            profile.mode.display_name(),
            self.path
        );
        self.loaded = Some(result);
        Ok(())
    }

    fn detect(&mut self, _image: &RgbaImage) -> Result<DetectionResult> {
        self.loaded
            .clone()
            .context("Replay analyzer used before create")
    }
}
