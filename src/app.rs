//! Application Coordinator
//!
//! Wires the pipeline controller, detector worker, recognition runtime and
//! speech queue together and owns their threads.

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbaImage;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::capture::{CameraControl, CaptureStateMachine};
use crate::config::AppConfig;
use crate::export::ChannelSink;
use crate::mode::{Mode, ModeSwitch};
use crate::overlay::OverlayLayer;
use crate::pipeline::aggregator::AggregatedResult;
use crate::pipeline::{DetectorWorker, Outputs, Pipeline, PipelineSettings, TokioDispatcher};
use crate::shared::{PipelineEvent, RuntimeState, SharedRuntime};
use crate::speech::{SpeechEngine, SpeechQueue, SpeechSink, Silent};
use crate::vision::{Analyzer, DetectorProfile, Recognizer};

/// Engines the coordinator runs
pub struct Engines {
    pub analyzer: Box<dyn Analyzer>,
    /// Detector profile per mode
    pub profiles: Box<dyn Fn(Mode) -> DetectorProfile + Send>,
    pub recognizer: Arc<dyn Recognizer>,
    /// `None` disables speech
    pub speech: Option<Box<dyn SpeechEngine>>,
    pub camera: Box<dyn CameraControl>,
}

/// How a frozen image ended up
#[derive(Debug)]
pub enum CycleOutcome {
    /// Every region resolved
    Record(AggregatedResult),
    /// The detector found nothing
    NothingDetected,
}

/// Main application coordinator
pub struct AssistApp {
    events: Sender<PipelineEvent>,
    records: Receiver<AggregatedResult>,
    runtime_state: SharedRuntime,
    live_overlay: OverlayLayer,
    uploaded_view: OverlayLayer,
    controller: Option<JoinHandle<()>>,
    /// Capture and upload requests sent to the controller
    freezes_sent: AtomicU64,
    speech: Option<SpeechQueue>,
    tokio: Option<tokio::runtime::Runtime>,
}

impl AssistApp {
    /// Load the initial mode and start every worker
    pub fn start(config: &AppConfig, engines: Engines) -> Result<Self> {
        let Engines {
            analyzer,
            profiles,
            recognizer,
            speech,
            camera,
        } = engines;

        let mode = config.general.default_mode;
        let switch = ModeSwitch::new(mode, analyzer, profiles)
            .with_context(|| format!("Failed to load the {} detector", mode.display_name()))?;

        let tokio = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("recognition")
            .build()
            .context("Failed to create tokio runtime")?;

        let (events_tx, events_rx) = unbounded();
        let (record_sink, records) = ChannelSink::channel();
        let runtime_state: SharedRuntime = Arc::new(RwLock::new(RuntimeState::default()));
        let live_overlay = OverlayLayer::new("live");
        let uploaded_view = OverlayLayer::new("uploaded");

        let speech_queue = match speech {
            Some(engine) if config.speech.enabled => Some(SpeechQueue::start(engine)),
            _ => None,
        };
        let speech_sink: Box<dyn SpeechSink> = match &speech_queue {
            Some(queue) => Box::new(queue.handle()),
            None => Box::new(Silent),
        };

        let detector = DetectorWorker::spawn(switch, events_tx.clone())?;
        let recognition = TokioDispatcher::new(tokio.handle().clone(), recognizer, events_tx.clone());

        let pipeline = Pipeline::new(
            CaptureStateMachine::new(camera),
            Box::new(detector),
            Box::new(recognition),
            Outputs {
                live_overlay: Box::new(live_overlay.clone()),
                uploaded_view: Box::new(uploaded_view.clone()),
                speech: speech_sink,
                records: Box::new(record_sink),
            },
            PipelineSettings {
                views: config.view,
                announce_direction: config.speech.announce_direction,
                initial_mode: mode,
            },
            runtime_state.clone(),
        );

        let controller = std::thread::Builder::new()
            .name("pipeline".into())
            .spawn(move || pipeline.run(events_rx))
            .context("Failed to start pipeline thread")?;

        info!("Pipeline started in {} mode", mode.display_name());

        Ok(Self {
            events: events_tx,
            records,
            runtime_state,
            live_overlay,
            uploaded_view,
            controller: Some(controller),
            freezes_sent: AtomicU64::new(0),
            speech: speech_queue,
            tokio: Some(tokio),
        })
    }

    fn send(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            warn!("Pipeline controller is not running");
        }
    }

    /// Freeze a camera frame
    pub fn capture(&self, frame: RgbaImage) {
        self.freezes_sent.fetch_add(1, Ordering::SeqCst);
        self.send(PipelineEvent::Capture(frame));
    }

    /// Freeze a user-supplied image
    pub fn upload(&self, image: RgbaImage) {
        self.freezes_sent.fetch_add(1, Ordering::SeqCst);
        self.send(PipelineEvent::Upload(image));
    }

    /// Return to live
    pub fn clear(&self) {
        self.send(PipelineEvent::Clear);
    }

    pub fn switch_mode(&self, mode: Mode) {
        self.send(PipelineEvent::SwitchMode(mode));
    }

    pub fn toggle_mode(&self) {
        self.send(PipelineEvent::ToggleMode);
    }

    /// Snapshot of the runtime status
    pub fn state(&self) -> RuntimeState {
        self.runtime_state.read().clone()
    }

    pub fn live_overlay(&self) -> &OverlayLayer {
        &self.live_overlay
    }

    pub fn uploaded_view(&self) -> &OverlayLayer {
        &self.uploaded_view
    }

    /// Completed records, as they are published
    pub fn records(&self) -> &Receiver<AggregatedResult> {
        &self.records
    }

    /// Wait until the last captured or uploaded image is fully processed.
    ///
    /// Records for images that were cleared or replaced are skipped.
    pub fn wait_for_cycle(&self, timeout: Duration) -> Result<CycleOutcome> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Ok(record) = self.records.recv_timeout(Duration::from_millis(20)) {
                if self.is_current(&record) {
                    return Ok(CycleOutcome::Record(record));
                }
                debug!("Skipping record {} of a discarded image", record.ticket);
                continue;
            }

            let state = self.state();
            // events before the last freeze request, clears included, are handled
            let caught_up = state.freeze_requests >= self.freezes_sent.load(Ordering::SeqCst);
            if caught_up && state.is_settled() {
                // a record published just before settling is already queued
                for record in self.records.try_iter() {
                    if record.ticket.epoch == state.current_epoch {
                        return Ok(CycleOutcome::Record(record));
                    }
                }
                if let Some(error) = state.last_error {
                    anyhow::bail!(error);
                }
                return Ok(CycleOutcome::NothingDetected);
            }

            if Instant::now() >= deadline {
                anyhow::bail!(
                    "Timed out with {} region(s) still pending",
                    state.regions_pending
                );
            }
        }
    }

    /// Whether `record` belongs to the image of the last freeze request
    fn is_current(&self, record: &AggregatedResult) -> bool {
        let state = self.runtime_state.read();
        state.freeze_requests >= self.freezes_sent.load(Ordering::SeqCst)
            && record.ticket.epoch == state.current_epoch
    }

    /// Wait until the detector reports `mode` as active
    pub fn wait_for_mode(&self, mode: Mode, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let state = self.state();
            if state.active_mode == mode {
                return Ok(());
            }
            if let Some(error) = state.mode_error {
                anyhow::bail!("Failed to switch to {} mode: {}", mode.display_name(), error);
            }
            if Instant::now() >= deadline {
                anyhow::bail!("Timed out switching to {} mode", mode.display_name());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for AssistApp {
    fn drop(&mut self) {
        // Signal the controller to stop
        let _ = self.events.send(PipelineEvent::Shutdown);

        // The pipeline owns the detector worker; joining the controller stops both
        if let Some(handle) = self.controller.take() {
            let _ = handle.join();
        }
        self.speech.take();

        if let Some(runtime) = self.tokio.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::NoCamera;
    use crate::vision::{Detection, DetectionResult, RecognitionError};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FixedAnalyzer {
        detections: Vec<Detection>,
        /// Mode with no model on disk
        missing: Option<Mode>,
        loaded: bool,
    }

    impl Analyzer for FixedAnalyzer {
        fn restart(&mut self) {
            self.loaded = false;
        }

        fn create(&mut self, profile: &DetectorProfile) -> Result<()> {
            if Some(profile.mode) == self.missing {
                anyhow::bail!("no model for {:?}", profile.mode);
            }
            self.loaded = true;
            Ok(())
        }

        fn detect(&mut self, _image: &RgbaImage) -> Result<DetectionResult> {
            if !self.loaded {
                anyhow::bail!("Detector has no model loaded");
            }
            Ok(DetectionResult {
                detections: self.detections.clone(),
                inference_time_ms: 12,
            })
        }
    }

    /// Reads back the crop width, except for very narrow crops
    struct WidthRecognizer;

    #[async_trait]
    impl Recognizer for WidthRecognizer {
        async fn recognize(&self, crop: RgbaImage) -> Result<String, RecognitionError> {
            if crop.width() < 20 {
                return Ok("  ".into());
            }
            Ok(format!("{} wide", crop.width()))
        }
    }

    fn engines(detections: Vec<Detection>) -> Engines {
        engines_missing(detections, None)
    }

    fn engines_missing(detections: Vec<Detection>, missing: Option<Mode>) -> Engines {
        Engines {
            analyzer: Box::new(FixedAnalyzer {
                detections,
                missing,
                loaded: false,
            }),
            profiles: Box::new(|mode| DetectorProfile {
                mode,
                model_path: PathBuf::new(),
                labels_path: PathBuf::new(),
            }),
            recognizer: Arc::new(WidthRecognizer),
            speech: None,
            camera: Box::new(NoCamera),
        }
    }

    fn config_for(width: u32, height: u32) -> AppConfig {
        let mut config = AppConfig::default();
        config.view.uploaded_width = width as f32;
        config.view.uploaded_height = height as f32;
        config
    }

    #[test]
    fn test_uploaded_image_produces_record() {
        let detections = vec![
            Detection::new("stop_sign", 0.5, 0.0, 1.0, 0.5),
            Detection::new("exit", 0.0, 0.5, 0.05, 1.0),
        ];
        let app = AssistApp::start(&config_for(200, 100), engines(detections)).unwrap();

        app.upload(RgbaImage::new(200, 100));
        let outcome = app.wait_for_cycle(Duration::from_secs(5)).unwrap();

        let CycleOutcome::Record(result) = outcome else {
            panic!("expected a record, got {:?}", outcome);
        };
        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].label, "stop_sign");
        assert_eq!(result.records[0].ocr_text, "100 wide");
        assert_eq!(result.records[1].ocr_text, "N/A");
        assert_eq!(result.inference_time_ms, 12);

        assert_eq!(app.uploaded_view().snapshot().len(), 2);
        assert!(app.live_overlay().snapshot().is_empty());

        let state = app.state();
        assert_eq!(state.sessions_completed, 1);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_empty_detection_settles_without_record() {
        let app = AssistApp::start(&config_for(64, 64), engines(Vec::new())).unwrap();

        app.upload(RgbaImage::new(64, 64));
        let outcome = app.wait_for_cycle(Duration::from_secs(5)).unwrap();

        assert!(matches!(outcome, CycleOutcome::NothingDetected));
        assert!(app.uploaded_view().snapshot().is_empty());
        assert!(app.records().try_recv().is_err());
    }

    #[test]
    fn test_clear_returns_to_live() {
        let detections = vec![Detection::new("exit", 0.0, 0.0, 0.5, 0.5)];
        let app = AssistApp::start(&config_for(40, 40), engines(detections)).unwrap();

        app.upload(RgbaImage::new(40, 40));
        app.wait_for_cycle(Duration::from_secs(5)).unwrap();
        app.clear();

        wait_until(Duration::from_secs(5), || app.uploaded_view().snapshot().is_empty());
        assert!(app.uploaded_view().snapshot().is_empty());
    }

    #[test]
    fn test_mode_requests_reach_the_detector() {
        let app = AssistApp::start(&config_for(40, 40), engines(Vec::new())).unwrap();
        assert_eq!(app.state().active_mode, Mode::SignReading);

        app.toggle_mode();
        app.wait_for_mode(Mode::SurfaceDamage, Duration::from_secs(5)).unwrap();

        app.switch_mode(Mode::SignReading);
        app.wait_for_mode(Mode::SignReading, Duration::from_secs(5)).unwrap();
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_unread_record_does_not_survive_clear() {
        let detections = vec![Detection::new("stop_sign", 0.0, 0.0, 1.0, 1.0)];
        let app = AssistApp::start(&config_for(400, 100), engines(detections)).unwrap();

        // let the first image publish without reading its record
        app.upload(RgbaImage::new(200, 100));
        wait_until(Duration::from_secs(5), || app.state().sessions_completed == 1);
        assert_eq!(app.state().sessions_completed, 1);

        app.clear();
        app.upload(RgbaImage::new(400, 100));
        let outcome = app.wait_for_cycle(Duration::from_secs(5)).unwrap();

        let CycleOutcome::Record(result) = outcome else {
            panic!("expected a record, got {:?}", outcome);
        };
        assert_eq!(result.image_size, (400, 100));
        assert_eq!(result.records[0].ocr_text, "400 wide");
        assert!(app.records().try_recv().is_err());
    }

    #[test]
    fn test_failed_mode_switch_keeps_detecting() {
        let detections = vec![Detection::new("exit", 0.0, 0.0, 1.0, 1.0)];
        let app = AssistApp::start(
            &config_for(64, 64),
            engines_missing(detections, Some(Mode::SurfaceDamage)),
        )
        .unwrap();

        app.switch_mode(Mode::SurfaceDamage);
        let error = app.wait_for_mode(Mode::SurfaceDamage, Duration::from_secs(5)).unwrap_err();
        assert!(format!("{:#}", error).contains("no model"));
        assert_eq!(app.state().active_mode, Mode::SignReading);

        // the previous model is back, so detection still works
        app.upload(RgbaImage::new(64, 64));
        let outcome = app.wait_for_cycle(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, CycleOutcome::Record(_)));

        // asking for the mode that is already loaded still gets an answer
        app.switch_mode(Mode::SignReading);
        app.wait_for_mode(Mode::SignReading, Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_back_to_back_images_each_get_their_record() {
        let detections = vec![Detection::new("exit", 0.0, 0.0, 1.0, 1.0)];
        let app = AssistApp::start(&config_for(400, 100), engines(detections)).unwrap();

        for width in [100u32, 300, 200] {
            app.upload(RgbaImage::new(width, 50));
            let outcome = app.wait_for_cycle(Duration::from_secs(5)).unwrap();
            app.clear();

            let CycleOutcome::Record(result) = outcome else {
                panic!("expected a record for width {}, got {:?}", width, outcome);
            };
            assert_eq!(result.records[0].ocr_text, format!("{} wide", width));
        }
    }

    #[test]
    fn test_camera_frame_draws_on_live_overlay() {
        let detections = vec![Detection::new("stop_sign", 0.0, 0.0, 0.3, 0.3)];
        let app = AssistApp::start(&config_for(64, 64), engines(detections)).unwrap();

        app.capture(RgbaImage::new(300, 300));
        let outcome = app.wait_for_cycle(Duration::from_secs(5)).unwrap();

        assert!(matches!(outcome, CycleOutcome::Record(_)));
        let boxes = app.live_overlay().snapshot();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].label, "stop_sign");
        assert!(app.uploaded_view().snapshot().is_empty());
    }
}
