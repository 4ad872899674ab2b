//! Model management for ONNX Runtime
//!
//! Handles locating, downloading, and loading of the detector and
//! recognizer models.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::mode::Mode;
use crate::vision::DetectorProfile;

/// Environment variable that disables all downloads
pub const OFFLINE_ENV: &str = "SIGHT_ASSIST_OFFLINE";

/// Files the pipeline needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// YOLOv8 sign detector
    SignDetector,
    /// Class names for the sign detector
    SignLabels,
    /// YOLOv8 walkway damage detector
    DamageDetector,
    /// Class names for the damage detector
    DamageLabels,
    /// Text recognition model (CRNN)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelType {
    pub const ALL: [ModelType; 6] = [
        ModelType::SignDetector,
        ModelType::SignLabels,
        ModelType::DamageDetector,
        ModelType::DamageLabels,
        ModelType::Recognition,
        ModelType::Dictionary,
    ];

    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::SignDetector => "sign_detector.onnx",
            ModelType::SignLabels => "sign_labels.txt",
            ModelType::DamageDetector => "damage_detector.onnx",
            ModelType::DamageLabels => "damage_labels.txt",
            ModelType::Recognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
        }
    }

    /// Public download location, if there is one.
    /// Detector models are trained per deployment and must be placed manually.
    pub fn download_url(&self) -> Option<&'static str> {
        match self {
            ModelType::Recognition => Some(
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx",
            ),
            ModelType::Dictionary => Some(
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt",
            ),
            _ => None,
        }
    }

    /// Plausible file size range for an integrity check (bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::SignDetector | ModelType::DamageDetector => (1_000_000, 400_000_000),
            ModelType::SignLabels | ModelType::DamageLabels => (1, 100_000),
            ModelType::Recognition => (7_000_000, 10_000_000), // ~7.83 MB
            ModelType::Dictionary => (500, 10_000),            // ~1.42 KB
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::SignDetector => "Sign Detector",
            ModelType::SignLabels => "Sign Labels",
            ModelType::DamageDetector => "Damage Detector",
            ModelType::DamageLabels => "Damage Labels",
            ModelType::Recognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
        }
    }

    /// Detector model and labels used by a mode
    pub fn for_mode(mode: Mode) -> (ModelType, ModelType) {
        match mode {
            Mode::SignReading => (ModelType::SignDetector, ModelType::SignLabels),
            Mode::SurfaceDamage => (ModelType::DamageDetector, ModelType::DamageLabels),
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub downloaded_at: String,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Status line for one model file
#[derive(Debug, Clone)]
pub struct ModelStatus {
    pub model_type: ModelType,
    pub available: bool,
    pub size_bytes: Option<u64>,
}

/// Model manager for locating and caching model files
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Create a model manager in the application data directory
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self { models_dir })
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Detector profile for a mode, pointing into this directory
    pub fn profile_for(&self, mode: Mode) -> DetectorProfile {
        let (model, labels) = ModelType::for_mode(mode);
        DetectorProfile {
            mode,
            model_path: self.model_path(model),
            labels_path: self.model_path(labels),
        }
    }

    /// Check if a model is present with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Check that everything a mode needs is present
    pub fn is_mode_ready(&self, mode: Mode) -> bool {
        let (model, labels) = ModelType::for_mode(mode);
        self.is_model_available(model)
            && self.is_model_available(labels)
            && self.is_model_available(ModelType::Recognition)
            && self.is_model_available(ModelType::Dictionary)
    }

    /// Get status of all models
    pub fn get_model_status(&self) -> Vec<ModelStatus> {
        ModelType::ALL
            .iter()
            .map(|&model_type| {
                let size_bytes = std::fs::metadata(self.model_path(model_type)).ok().map(|m| m.len());
                ModelStatus {
                    model_type,
                    available: self.is_model_available(model_type),
                    size_bytes,
                }
            })
            .collect()
    }

    /// Download a model if not already available.
    /// Returns the path to the model file.
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        let Some(url) = model_type.download_url() else {
            anyhow::bail!(
                "{} is not downloadable; place it at {:?}",
                model_type.display_name(),
                path
            );
        };

        info!("Downloading model {:?}...", model_type);
        self.download_model(model_type, url)?;

        Ok(path)
    }

    /// Download every model that has a public URL
    pub fn ensure_downloadable_models(&self) -> Result<()> {
        for model_type in ModelType::ALL {
            if model_type.download_url().is_some() {
                self.ensure_model(model_type)?;
            } else if !self.is_model_available(model_type) {
                warn!(
                    "{} missing; place it manually at {:?}",
                    model_type.display_name(),
                    self.model_path(model_type)
                );
            }
        }
        Ok(())
    }

    /// Download a specific model (blocking)
    fn download_model(&self, model_type: ModelType, url: &str) -> Result<()> {
        let path = self.model_path(model_type);

        info!("Downloading {} from {}", model_type.display_name(), url);

        if std::env::var(OFFLINE_ENV).is_ok() {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                path
            );
        }

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let sha256 = rt.block_on(download_file(url, &path))?;

        if !self.is_model_available(model_type) {
            anyhow::bail!("Download completed but model verification failed");
        }

        self.update_manifest_for_model(model_type, sha256)?;

        info!("Successfully downloaded {}", model_type.display_name());
        Ok(())
    }

    /// Record a downloaded model in the manifest
    fn update_manifest_for_model(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256: Some(sha256),
            downloaded_at: unix_timestamp_now(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream `url` into `path` via a temp file. Returns the SHA256 of the body.
async fn download_file(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    debug!("Download size: {:?} bytes", response.content_length());

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        Ok(Self::wrap(session))
    }

    /// Create session with GPU acceleration if available
    pub fn new_with_gpu(model_path: &Path) -> Result<Self> {
        use ort::execution_providers::CUDAExecutionProvider;

        info!("Loading ONNX model with GPU acceleration from {:?}", model_path);

        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?;

        let builder = match builder.with_execution_providers([CUDAExecutionProvider::default().build()]) {
            Ok(builder) => builder,
            Err(e) => {
                warn!("CUDA not available, using CPU: {}", e);
                return Self::new(model_path);
            }
        };

        let session = builder
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        Ok(Self::wrap(session))
    }

    fn wrap(session: Session) -> Self {
        let inputs: Vec<&str> = session.inputs.iter().map(|input| input.name.as_str()).collect();
        let outputs: Vec<&str> = session.outputs.iter().map(|output| output.name.as_str()).collect();
        info!("Model loaded. Inputs: {:?}, Outputs: {:?}", inputs, outputs);

        Self { session }
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

/// Seconds since the Unix epoch, as a string
fn unix_timestamp_now() -> String {
    use std::time::SystemTime;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    format!("{}", now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::SignDetector.filename(), "sign_detector.onnx");
        assert_eq!(ModelType::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelType::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_only_recognizer_files_are_downloadable() {
        assert!(ModelType::Recognition.download_url().is_some());
        assert!(ModelType::Dictionary.download_url().is_some());
        assert!(ModelType::SignDetector.download_url().is_none());
        assert!(ModelType::DamageLabels.download_url().is_none());
    }

    #[test]
    fn test_profile_points_into_models_dir() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().join("models")).unwrap();

        let profile = manager.profile_for(Mode::SurfaceDamage);
        assert_eq!(profile.mode, Mode::SurfaceDamage);
        assert!(profile.model_path.ends_with("damage_detector.onnx"));
        assert!(profile.labels_path.starts_with(manager.models_dir()));
    }

    #[test]
    fn test_model_status_and_availability() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();

        let status = manager.get_model_status();
        assert_eq!(status.len(), ModelType::ALL.len());
        assert!(status.iter().all(|s| !s.available));

        std::fs::write(manager.model_path(ModelType::SignLabels), "stop\nyield\n").unwrap();
        assert!(manager.is_model_available(ModelType::SignLabels));

        // too small to be a real dictionary
        std::fs::write(manager.model_path(ModelType::Dictionary), "a").unwrap();
        assert!(!manager.is_model_available(ModelType::Dictionary));
        assert!(!manager.is_mode_ready(Mode::SignReading));
    }

    #[test]
    fn test_ensure_model_without_url_fails() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        let err = manager.ensure_model(ModelType::SignDetector).unwrap_err();
        assert!(err.to_string().contains("not downloadable"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        assert!(manager.load_manifest().unwrap().models.is_empty());

        let mut manifest = ModelManifest::default();
        manifest.models.push(ModelInfo {
            model_type: "Recognition".into(),
            filename: "rec.onnx".into(),
            size_bytes: 42,
            sha256: None,
            downloaded_at: unix_timestamp_now(),
        });
        manager.save_manifest(&manifest).unwrap();

        let loaded = manager.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].filename, "rec.onnx");
    }
}
