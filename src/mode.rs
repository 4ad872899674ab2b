//! Detection mode switch (sign reading vs surface damage)

use anyhow::Result;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::vision::{Analyzer, DetectionResult, DetectorProfile};

/// Which analyzer receives frozen images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Read traffic and street signs
    #[default]
    SignReading,
    /// Find damage on sidewalks and walkways
    SurfaceDamage,
}

impl Mode {
    pub fn toggled(self) -> Self {
        match self {
            Mode::SignReading => Mode::SurfaceDamage,
            Mode::SurfaceDamage => Mode::SignReading,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Mode::SignReading => "Sign",
            Mode::SurfaceDamage => "Sidewalk",
        }
    }
}

/// Owns the analyzer and the mode it is currently loaded for
pub struct ModeSwitch<A: Analyzer> {
    active: Mode,
    /// `false` after a failed switch whose rollback also failed
    loaded: bool,
    analyzer: A,
    resolve: Box<dyn Fn(Mode) -> DetectorProfile + Send>,
}

impl<A: Analyzer> ModeSwitch<A> {
    /// Load `analyzer` for `mode`. `resolve` maps a mode to its profile.
    pub fn new(
        mode: Mode,
        mut analyzer: A,
        resolve: impl Fn(Mode) -> DetectorProfile + Send + 'static,
    ) -> Result<Self> {
        analyzer.create(&resolve(mode))?;
        Ok(Self {
            active: mode,
            loaded: true,
            analyzer,
            resolve: Box::new(resolve),
        })
    }

    pub fn active(&self) -> Mode {
        self.active
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Switch to `mode`: restart the analyzer, then create it for the new
    /// profile. Returns `false` if `mode` is already active and loaded.
    ///
    /// If the new profile fails to load, the previous mode is created again
    /// and the error is returned. If that fails too, the switch is left
    /// unloaded and the next request for either mode reloads it.
    pub fn switch_to(&mut self, mode: Mode) -> Result<bool> {
        if mode == self.active && self.loaded {
            return Ok(false);
        }

        info!("Switching mode: {} -> {}", self.active.display_name(), mode.display_name());
        self.analyzer.restart();
        match self.analyzer.create(&(self.resolve)(mode)) {
            Ok(()) => {
                self.active = mode;
                self.loaded = true;
                Ok(true)
            }
            Err(e) => {
                self.loaded = false;
                if mode != self.active {
                    self.analyzer.restart();
                    match self.analyzer.create(&(self.resolve)(self.active)) {
                        Ok(()) => self.loaded = true,
                        Err(restore) => warn!(
                            "Could not restore {} mode: {:#}",
                            self.active.display_name(),
                            restore
                        ),
                    }
                }
                Err(e)
            }
        }
    }

    /// Run the active analyzer
    pub fn detect(&mut self, image: &RgbaImage) -> Result<DetectionResult> {
        self.analyzer.detect(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct ScriptedAnalyzer {
        calls: Arc<Mutex<Vec<String>>>,
        /// Modes whose profile fails to load
        broken: Arc<Mutex<Vec<Mode>>>,
        loaded: Arc<Mutex<Option<Mode>>>,
    }

    impl Analyzer for ScriptedAnalyzer {
        fn restart(&mut self) {
            self.calls.lock().push("restart".into());
            *self.loaded.lock() = None;
        }

        fn create(&mut self, profile: &DetectorProfile) -> Result<()> {
            self.calls.lock().push(format!("create:{:?}", profile.mode));
            if self.broken.lock().contains(&profile.mode) {
                anyhow::bail!("no model for {:?}", profile.mode);
            }
            *self.loaded.lock() = Some(profile.mode);
            Ok(())
        }

        fn detect(&mut self, _image: &RgbaImage) -> Result<DetectionResult> {
            if self.loaded.lock().is_none() {
                anyhow::bail!("Detector has no model loaded");
            }
            Ok(DetectionResult::default())
        }
    }

    fn profile(mode: Mode) -> DetectorProfile {
        DetectorProfile {
            mode,
            model_path: PathBuf::from("model.onnx"),
            labels_path: PathBuf::from("labels.txt"),
        }
    }

    #[test]
    fn test_new_creates_initial_mode() {
        let analyzer = ScriptedAnalyzer::default();
        let switch = ModeSwitch::new(Mode::SignReading, analyzer.clone(), profile).unwrap();
        assert_eq!(switch.active(), Mode::SignReading);
        assert_eq!(*analyzer.calls.lock(), vec!["create:SignReading"]);
    }

    #[test]
    fn test_switch_restarts_then_creates() {
        let analyzer = ScriptedAnalyzer::default();
        let mut switch = ModeSwitch::new(Mode::SignReading, analyzer.clone(), profile).unwrap();

        assert!(switch.switch_to(Mode::SurfaceDamage).unwrap());
        assert_eq!(switch.active(), Mode::SurfaceDamage);
        assert_eq!(
            *analyzer.calls.lock(),
            vec!["create:SignReading", "restart", "create:SurfaceDamage"]
        );
    }

    #[test]
    fn test_switch_to_active_mode_is_noop() {
        let analyzer = ScriptedAnalyzer::default();
        let mut switch = ModeSwitch::new(Mode::SurfaceDamage, analyzer.clone(), profile).unwrap();

        assert!(!switch.switch_to(Mode::SurfaceDamage).unwrap());
        assert_eq!(analyzer.calls.lock().len(), 1);
    }

    #[test]
    fn test_failed_switch_restores_previous_mode() {
        let analyzer = ScriptedAnalyzer::default();
        analyzer.broken.lock().push(Mode::SurfaceDamage);
        let mut switch = ModeSwitch::new(Mode::SignReading, analyzer.clone(), profile).unwrap();

        assert!(switch.switch_to(Mode::SurfaceDamage).is_err());
        assert_eq!(switch.active(), Mode::SignReading);
        assert!(switch.is_loaded());
        assert!(switch.detect(&RgbaImage::new(4, 4)).is_ok());
        assert_eq!(
            *analyzer.calls.lock(),
            vec![
                "create:SignReading",
                "restart",
                "create:SurfaceDamage",
                "restart",
                "create:SignReading"
            ]
        );
    }

    #[test]
    fn test_unloaded_switch_reloads_on_any_request() {
        let analyzer = ScriptedAnalyzer::default();
        let mut switch = ModeSwitch::new(Mode::SignReading, analyzer.clone(), profile).unwrap();
        analyzer.broken.lock().extend([Mode::SignReading, Mode::SurfaceDamage]);

        assert!(switch.switch_to(Mode::SurfaceDamage).is_err());
        assert!(!switch.is_loaded());
        assert!(switch.detect(&RgbaImage::new(4, 4)).is_err());

        // the previous mode is retried instead of treated as already active
        analyzer.broken.lock().clear();
        assert!(switch.switch_to(Mode::SignReading).unwrap());
        assert!(switch.is_loaded());
        assert!(switch.detect(&RgbaImage::new(4, 4)).is_ok());
    }
}
