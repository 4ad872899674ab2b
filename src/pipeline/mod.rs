//! Capture / annotate / aggregate pipeline
//!
//! [`Pipeline`] is the controller. It runs on one thread and is the only
//! place that mutates the capture state machine and the aggregator; the
//! detector worker and recognition tasks report back to it as
//! [`PipelineEvent`]s.

pub mod aggregator;
pub mod dispatch;
pub mod ingestion;

use crossbeam_channel::Receiver;
use image::RgbaImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capture::{CaptureStateMachine, Epoch};
use crate::config::ViewConfig;
use crate::export::RecordSink;
use crate::mode::Mode;
use crate::overlay::OverlaySink;
use crate::shared::{PipelineEvent, SharedRuntime};
use crate::speech::SpeechSink;
use crate::vision::{DetectionResult, RecognitionError};

use aggregator::{RegionAggregator, RegionRecord, RegionRequest, Resolution, SessionTicket};
use ingestion::{route, OverlayTarget, Routing};

pub use dispatch::{DetectorWorker, TokioDispatcher};

/// One frozen image handed to the detector
#[derive(Debug, Clone)]
pub struct DetectionJob {
    pub epoch: Epoch,
    pub image: Arc<RgbaImage>,
}

/// Runs the detector off the controller thread
pub trait DetectionDispatcher: Send {
    /// Queue `job`, replacing any job still waiting
    fn submit(&mut self, job: DetectionJob);
    /// Reload the detector for `mode`
    fn switch_mode(&mut self, mode: Mode);
}

/// Runs recognition requests concurrently
pub trait RecognitionDispatcher: Send {
    fn submit(&mut self, request: RegionRequest);
}

/// Where the pipeline's output goes
pub struct Outputs {
    pub live_overlay: Box<dyn OverlaySink>,
    pub uploaded_view: Box<dyn OverlaySink>,
    pub speech: Box<dyn SpeechSink>,
    pub records: Box<dyn RecordSink>,
}

/// Pipeline settings taken from the config
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub views: ViewConfig,
    pub announce_direction: bool,
    pub initial_mode: Mode,
}

pub struct Pipeline {
    capture: CaptureStateMachine,
    aggregator: RegionAggregator,
    detector: Box<dyn DetectionDispatcher>,
    recognizer: Box<dyn RecognitionDispatcher>,
    outputs: Outputs,
    settings: PipelineSettings,
    /// Last mode sent to the detector; `None` once a switch failed
    requested_mode: Option<Mode>,
    runtime: SharedRuntime,
}

impl Pipeline {
    pub fn new(
        capture: CaptureStateMachine,
        detector: Box<dyn DetectionDispatcher>,
        recognizer: Box<dyn RecognitionDispatcher>,
        outputs: Outputs,
        settings: PipelineSettings,
        runtime: SharedRuntime,
    ) -> Self {
        {
            let mut state = runtime.write();
            state.capture_state = capture.state();
            state.current_epoch = capture.epoch();
            state.active_mode = settings.initial_mode;
        }

        Self {
            capture,
            aggregator: RegionAggregator::new(),
            detector,
            recognizer,
            outputs,
            requested_mode: Some(settings.initial_mode),
            settings,
            runtime,
        }
    }

    /// Handle events until `Shutdown` or until every sender is gone
    pub fn run(mut self, events: Receiver<PipelineEvent>) {
        info!("Pipeline controller started");
        for event in events {
            if !self.handle(event) {
                break;
            }
        }
        info!("Pipeline controller stopped");
    }

    /// Apply one event. Returns `false` on shutdown.
    pub fn handle(&mut self, event: PipelineEvent) -> bool {
        match event {
            PipelineEvent::Capture(frame) => {
                self.freeze(frame, false);
                self.runtime.write().freeze_requests += 1;
            }
            PipelineEvent::Upload(image) => {
                self.freeze(image, true);
                self.runtime.write().freeze_requests += 1;
            }
            PipelineEvent::Clear => self.clear(),
            PipelineEvent::Detected { epoch, outcome } => self.on_detected(epoch, outcome),
            PipelineEvent::RegionResolved { ticket, index, outcome } => self.on_region(ticket, index, outcome),
            PipelineEvent::SwitchMode(mode) => self.switch_mode(mode),
            PipelineEvent::ToggleMode => {
                let current = self.requested_mode.unwrap_or(self.runtime.read().active_mode);
                self.switch_mode(current.toggled())
            }
            PipelineEvent::ModeChanged(outcome) => self.on_mode_changed(outcome),
            PipelineEvent::Shutdown => return false,
        }
        true
    }

    fn freeze(&mut self, pixels: RgbaImage, uploaded: bool) {
        let frozen = if uploaded {
            self.capture.upload(pixels)
        } else {
            self.capture.capture(pixels)
        };
        let Some(image) = frozen else {
            return;
        };
        let job = DetectionJob {
            epoch: image.epoch,
            image: image.pixels.clone(),
        };

        self.reset_outputs();
        self.detector.submit(job);
        self.sync_capture_state();
    }

    fn clear(&mut self) {
        if self.capture.clear() {
            self.reset_outputs();
        }
        self.sync_capture_state();
    }

    /// Drop everything shown or collected for the previous image
    fn reset_outputs(&mut self) {
        self.aggregator.abandon();
        self.outputs.live_overlay.clear();
        self.outputs.uploaded_view.clear();
        self.outputs.records.clear();
    }

    fn on_detected(&mut self, epoch: Epoch, outcome: Result<DetectionResult, String>) {
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                if self.capture.is_current(epoch) {
                    warn!("Detection failed for {}: {}", epoch, e);
                    let mut state = self.runtime.write();
                    state.set_error(format!("Detection failed: {}", e));
                    state.analyzed_epoch = Some(epoch);
                } else {
                    debug!("Ignoring detection failure for stale image {}", epoch);
                }
                return;
            }
        };

        match route(&result, epoch, self.capture.current(), &self.settings.views) {
            Routing::Stale => {
                debug!("Dropping stale detection result for {}", epoch);
                return;
            }
            Routing::Empty { target } => {
                debug!("No detections for {}", epoch);
                self.target(target).clear();
            }
            Routing::Forward { target, boxes, directions } => {
                if self.settings.announce_direction {
                    for (screen_box, direction) in boxes.iter().zip(&directions) {
                        self.outputs
                            .speech
                            .say_now(&format!("Detected a {}, {}.", screen_box.label, direction.phrase()));
                    }
                }
                self.target(target).set_boxes(boxes);
                self.other_target(target).clear();
                self.open_session(&result);
            }
        }

        let mut state = self.runtime.write();
        state.clear_error();
        state.analyzed_epoch = Some(epoch);
        state.last_inference_ms = Some(result.inference_time_ms);
        state.session_open = self.aggregator.is_open();
        state.regions_pending = self.aggregator.pending();
    }

    fn open_session(&mut self, result: &DetectionResult) {
        let Some(image) = self.capture.current() else {
            return;
        };
        for request in self.aggregator.open(image, result) {
            self.recognizer.submit(request);
        }
    }

    fn on_region(&mut self, ticket: SessionTicket, index: usize, outcome: Result<String, RecognitionError>) {
        if let Err(e) = &outcome {
            warn!("Recognition failed for region {} of {}: {}", index, ticket, e);
        }

        match self.aggregator.resolve(ticket, index, outcome) {
            Resolution::Dropped(reason) => {
                debug!("Region {} of {} dropped: {:?}", index, ticket, reason);
                return;
            }
            Resolution::Recorded(record) => self.announce(&record),
            Resolution::Completed { record, result } => {
                self.announce(&record);
                {
                    // status first, so a published record is never ahead of it
                    let mut state = self.runtime.write();
                    state.sessions_completed += 1;
                    state.last_summary = Some(result.summary());
                    state.session_open = false;
                    state.regions_pending = 0;
                }
                self.outputs.records.publish(&result);
                return;
            }
        }

        let mut state = self.runtime.write();
        state.session_open = self.aggregator.is_open();
        state.regions_pending = self.aggregator.pending();
    }

    fn announce(&self, record: &RegionRecord) {
        self.outputs
            .speech
            .say_queued(&format!("{} detected. Text is {}", record.label, record.ocr_text));
    }

    fn switch_mode(&mut self, mode: Mode) {
        if self.requested_mode == Some(mode) {
            return;
        }
        info!("Mode requested: {}", mode.display_name());
        self.requested_mode = Some(mode);
        self.runtime.write().mode_error = None;
        self.detector.switch_mode(mode);
    }

    fn on_mode_changed(&mut self, outcome: Result<Mode, String>) {
        let mut state = self.runtime.write();
        match outcome {
            Ok(mode) => {
                info!("{} mode active", mode.display_name());
                state.active_mode = mode;
            }
            Err(e) => {
                warn!("Mode switch failed: {}", e);
                state.set_error(format!("Mode switch failed: {}", e));
                state.mode_error = Some(e);
                // the detector may be unloaded; forward every request until one succeeds
                self.requested_mode = None;
            }
        }
    }

    fn target(&mut self, target: OverlayTarget) -> &mut dyn OverlaySink {
        match target {
            OverlayTarget::LiveOverlay => self.outputs.live_overlay.as_mut(),
            OverlayTarget::UploadedView => self.outputs.uploaded_view.as_mut(),
        }
    }

    fn other_target(&mut self, target: OverlayTarget) -> &mut dyn OverlaySink {
        match target {
            OverlayTarget::LiveOverlay => self.outputs.uploaded_view.as_mut(),
            OverlayTarget::UploadedView => self.outputs.live_overlay.as_mut(),
        }
    }

    fn sync_capture_state(&self) {
        let mut state = self.runtime.write();
        state.capture_state = self.capture.state();
        state.current_epoch = self.capture.epoch();
        state.session_open = self.aggregator.is_open();
        state.regions_pending = self.aggregator.pending();
    }
}
