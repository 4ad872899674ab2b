//! Text recognition over cropped regions
//!
//! Uses the PaddleOCR CRNN recognition model via ONNX Runtime. Output is
//! `[1, T, C]` per-timestep class scores decoded with greedy CTC: class 0 is
//! the blank, classes `1..=D` index the dictionary, and the last class is a
//! space.

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use ort::value::Tensor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::vision::models::OnnxSession;
use crate::vision::preprocess::{preprocess_for_recognition, upscale_small_crop};
use crate::vision::{RecognitionError, Recognizer};

/// Recognizer input sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Model input height
    pub target_height: u32,
    /// Widest input passed to the model
    pub max_width: u32,
    /// Crops with a smaller side below this are upscaled first
    pub min_crop_dimension: u32,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            target_height: 48,
            max_width: 640,
            min_crop_dimension: 32,
        }
    }
}

/// Read a PaddleOCR character dictionary: one entry per line, kept verbatim
pub fn load_dictionary(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dictionary {:?}", path))?;
    Ok(parse_dictionary(&content))
}

pub fn parse_dictionary(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Greedy CTC decode of a `[T, C]` score matrix.
///
/// Takes the best class per step, merges repeats, drops blanks (class 0).
/// Class `C - 1` is a space when the dictionary does not cover it.
pub fn ctc_greedy_decode(data: &[f32], steps: usize, classes: usize, dictionary: &[String]) -> String {
    if classes == 0 || data.len() < steps * classes {
        return String::new();
    }

    let mut text = String::new();
    let mut previous = 0usize;

    for row in data.chunks_exact(classes).take(steps) {
        let best = row
            .iter()
            .enumerate()
            .fold((0usize, f32::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
        let class = best.0;

        if class != 0 && class != previous {
            match dictionary.get(class - 1) {
                Some(ch) => text.push_str(ch),
                None if class == classes - 1 => text.push(' '),
                None => {}
            }
        }
        previous = class;
    }

    text
}

/// PaddleOCR recognizer backed by ONNX Runtime.
///
/// The session sits behind a mutex; concurrent regions are recognized one
/// inference at a time on the blocking pool.
#[derive(Clone)]
pub struct OnnxRecognizer {
    session: Arc<Mutex<OnnxSession>>,
    dictionary: Arc<Vec<String>>,
    config: RecognitionConfig,
}

impl OnnxRecognizer {
    pub fn new(model_path: &Path, dictionary_path: &Path, config: RecognitionConfig) -> Result<Self> {
        let dictionary = load_dictionary(dictionary_path)?;
        let session = OnnxSession::new(model_path)?;
        debug!("Recognizer loaded with {} dictionary entries", dictionary.len());

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            dictionary: Arc::new(dictionary),
            config,
        })
    }

    fn recognize_blocking(&self, crop: &RgbaImage) -> Result<String> {
        let crop = upscale_small_crop(crop, self.config.min_crop_dimension);
        let tensor = preprocess_for_recognition(&crop, self.config.target_height, self.config.max_width);
        let (n, c, h, w) = tensor.dim();
        let (data, _offset) = tensor.into_raw_vec_and_offset();
        let input = Tensor::from_array(([n, c, h, w], data.into_boxed_slice()))
            .context("Failed to create recognizer input tensor")?;

        let mut session = self.session.lock();
        let outputs = session
            .session_mut()
            .run(ort::inputs![input])
            .context("Recognizer inference failed")?;
        let (out_shape, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to extract recognizer output")?;

        // [1, T, C]
        let dims: Vec<usize> = out_shape.iter().map(|&d| d.max(0) as usize).collect();
        let (steps, classes) = match dims.as_slice() {
            [_, t, c] => (*t, *c),
            other => anyhow::bail!("Unexpected recognizer output shape {:?}", other),
        };

        Ok(ctc_greedy_decode(scores, steps, classes, &self.dictionary))
    }
}

#[async_trait]
impl Recognizer for OnnxRecognizer {
    async fn recognize(&self, crop: RgbaImage) -> Result<String, RecognitionError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(RecognitionError::EmptyCrop);
        }

        let this = self.clone();
        let result = tokio::task::spawn_blocking(move || this.recognize_blocking(&crop))
            .await
            .map_err(|e| RecognitionError::Engine(e.to_string()))?;

        result.map_err(|e| {
            warn!("Recognition failed: {:#}", e);
            RecognitionError::Engine(e.to_string())
        })
    }
}
