//! YOLOv8 object detection via ONNX Runtime
//!
//! The model takes a letterboxed `[1, 3, S, S]` image and returns
//! `[1, 4 + C, N]`: for each of N proposals the box center/size in input
//! pixels followed by C class scores.

use anyhow::{Context, Result};
use image::RgbaImage;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;
use tracing::{debug, info};

use crate::geometry::NormalizedBox;
use crate::vision::models::OnnxSession;
use crate::vision::preprocess::{preprocess_for_detection, Letterbox};
use crate::vision::{load_labels, Analyzer, Detection, DetectionResult, DetectorProfile};

/// Detector thresholds and input size
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Square model input size in pixels
    pub input_size: u32,
    /// Minimum class score to keep a proposal (0.0 - 1.0)
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes of one class are suppressed
    pub iou_threshold: f32,
    /// Maximum detections returned per image
    pub max_detections: usize,
    /// Try CUDA before falling back to CPU
    pub use_gpu: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 100,
            use_gpu: false,
        }
    }
}

/// A decoded proposal in source-image pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Intersection over union with another candidate
    pub fn iou(&self, other: &Candidate) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Decode a `[4 + C, N]` (channel-major) output into candidates above the
/// confidence threshold, mapped back to source pixels.
pub fn decode_output(
    data: &[f32],
    channels: usize,
    proposals: usize,
    placement: &Letterbox,
    confidence: f32,
) -> Vec<Candidate> {
    if channels <= 4 || data.len() < channels * proposals {
        return Vec::new();
    }

    let classes = channels - 4;
    let at = |row: usize, i: usize| data[row * proposals + i];

    (0..proposals)
        .filter_map(|i| {
            let (class_id, score) = (0..classes)
                .map(|c| (c, at(4 + c, i)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))?;

            if score < confidence {
                return None;
            }

            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            Some(Candidate {
                class_id,
                score,
                x1: placement.source_x(cx - w / 2.0),
                y1: placement.source_y(cy - h / 2.0),
                x2: placement.source_x(cx + w / 2.0),
                y2: placement.source_y(cy + h / 2.0),
            })
        })
        .collect()
}

/// Class-wise non-maximum suppression, highest score first
pub fn non_maximum_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= limit {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

/// Turn source-pixel candidates into normalized, labelled detections
pub fn to_detections(candidates: &[Candidate], labels: &[String], width: u32, height: u32) -> Vec<Detection> {
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    candidates
        .iter()
        .map(|c| Detection {
            label: labels
                .get(c.class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", c.class_id)),
            bbox: NormalizedBox::new(c.x1 / w, c.y1 / h, c.x2 / w, c.y2 / h).clamped(),
        })
        .collect()
}

/// YOLOv8 detector backed by ONNX Runtime
pub struct OnnxAnalyzer {
    config: DetectorConfig,
    session: Option<OnnxSession>,
    labels: Vec<String>,
}

impl OnnxAnalyzer {
    /// Create an analyzer; no model is loaded until `create`
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            session: None,
            labels: Vec::new(),
        }
    }
}

impl Analyzer for OnnxAnalyzer {
    fn restart(&mut self) {
        if self.session.take().is_some() {
            debug!("Detector session released");
        }
        self.labels.clear();
    }

    fn create(&mut self, profile: &DetectorProfile) -> Result<()> {
        let labels = load_labels(&profile.labels_path)?;
        let session = if self.config.use_gpu {
            OnnxSession::new_with_gpu(&profile.model_path)?
        } else {
            OnnxSession::new(&profile.model_path)?
        };

        info!(
            "{} detector ready with {} labels",
            profile.mode.display_name(),
            labels.len()
        );
        self.labels = labels;
        self.session = Some(session);
        Ok(())
    }

    fn detect(&mut self, image: &RgbaImage) -> Result<DetectionResult> {
        let Some(session) = self.session.as_mut() else {
            anyhow::bail!("Detector has no model loaded");
        };

        let start = Instant::now();
        let size = self.config.input_size as usize;
        let (tensor, placement) = preprocess_for_detection(image, self.config.input_size);
        let (data, _offset) = tensor.into_raw_vec_and_offset();
        let input = Tensor::from_array(([1usize, 3, size, size], data.into_boxed_slice()))
            .context("Failed to create detector input tensor")?;

        let outputs = session
            .session_mut()
            .run(ort::inputs![input])
            .context("Detector inference failed")?;
        let (shape, output) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to extract detector output")?;

        // [1, 4 + C, N]
        let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        let (channels, proposals) = match dims.as_slice() {
            [_, c, n] => (*c, *n),
            other => anyhow::bail!("Unexpected detector output shape {:?}", other),
        };

        let candidates = decode_output(output, channels, proposals, &placement, self.config.confidence_threshold);
        let kept = non_maximum_suppression(candidates, self.config.iou_threshold, self.config.max_detections);
        let detections = to_detections(&kept, &self.labels, image.width(), image.height());
        let inference_time_ms = start.elapsed().as_millis() as u64;

        debug!("Detection complete in {}ms: {} regions", inference_time_ms, detections.len());

        Ok(DetectionResult {
            detections,
            inference_time_ms,
        })
    }
}
