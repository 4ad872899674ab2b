//! Workers behind the dispatcher traits
//!
//! - [`DetectorWorker`]: one thread owning the mode switch and its analyzer.
//!   Jobs go through a single-slot queue: one frame in detection, at most
//!   one waiting, and a newer frame replaces the waiting one.
//! - [`TokioDispatcher`]: one tokio task per region.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::mode::{Mode, ModeSwitch};
use crate::pipeline::aggregator::RegionRequest;
use crate::pipeline::{DetectionDispatcher, DetectionJob, RecognitionDispatcher};
use crate::shared::PipelineEvent;
use crate::vision::{Analyzer, Recognizer};

enum Control {
    SwitchMode(Mode),
    Stop,
}

/// Detector thread handle
pub struct DetectorWorker {
    jobs_tx: Sender<DetectionJob>,
    /// Receiver clone used to evict a waiting job
    jobs_rx: Receiver<DetectionJob>,
    control: Sender<Control>,
    handle: Option<JoinHandle<()>>,
}

impl DetectorWorker {
    /// Start the worker; results are sent to `events`
    pub fn spawn(switch: ModeSwitch<Box<dyn Analyzer>>, events: Sender<PipelineEvent>) -> Result<Self> {
        let (jobs_tx, jobs_rx) = bounded::<DetectionJob>(1);
        let (control, control_rx) = unbounded();
        let worker_jobs = jobs_rx.clone();

        let handle = std::thread::Builder::new()
            .name("detector".into())
            .spawn(move || run_detector(switch, worker_jobs, control_rx, events))
            .context("Failed to start detector thread")?;

        Ok(Self {
            jobs_tx,
            jobs_rx,
            control,
            handle: Some(handle),
        })
    }
}

impl DetectionDispatcher for DetectorWorker {
    fn submit(&mut self, job: DetectionJob) {
        match self.jobs_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                if let Ok(waiting) = self.jobs_rx.try_recv() {
                    debug!("Frame {} replaced before detection", waiting.epoch);
                }
                if self.jobs_tx.try_send(job).is_err() {
                    warn!("Detector queue still full; frame dropped");
                }
            }
            Err(TrySendError::Disconnected(_)) => warn!("Detector thread is gone"),
        }
    }

    fn switch_mode(&mut self, mode: Mode) {
        if self.control.send(Control::SwitchMode(mode)).is_err() {
            warn!("Detector thread is gone");
        }
    }
}

impl Drop for DetectorWorker {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_detector(
    mut switch: ModeSwitch<Box<dyn Analyzer>>,
    jobs: Receiver<DetectionJob>,
    control: Receiver<Control>,
    events: Sender<PipelineEvent>,
) {
    info!("Detector worker started in {} mode", switch.active().display_name());

    loop {
        let event = select! {
            recv(control) -> message => match message {
                Ok(Control::SwitchMode(mode)) => {
                    let outcome = switch.switch_to(mode).map(|_| mode).map_err(|e| format!("{:#}", e));
                    PipelineEvent::ModeChanged(outcome)
                }
                Ok(Control::Stop) | Err(_) => break,
            },
            recv(jobs) -> job => match job {
                Ok(job) => {
                    let outcome = switch.detect(&job.image).map_err(|e| format!("{:#}", e));
                    PipelineEvent::Detected { epoch: job.epoch, outcome }
                }
                Err(_) => break,
            },
        };

        if events.send(event).is_err() {
            break;
        }
    }

    info!("Detector worker stopped");
}

/// Runs each recognition request as a task on a tokio runtime
pub struct TokioDispatcher {
    runtime: tokio::runtime::Handle,
    recognizer: Arc<dyn Recognizer>,
    events: Sender<PipelineEvent>,
}

impl TokioDispatcher {
    pub fn new(runtime: tokio::runtime::Handle, recognizer: Arc<dyn Recognizer>, events: Sender<PipelineEvent>) -> Self {
        Self {
            runtime,
            recognizer,
            events,
        }
    }
}

impl RecognitionDispatcher for TokioDispatcher {
    fn submit(&mut self, request: RegionRequest) {
        let recognizer = self.recognizer.clone();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            let RegionRequest { ticket, index, crop } = request;
            let outcome = recognizer.recognize(crop).await;
            if events
                .send(PipelineEvent::RegionResolved { ticket, index, outcome })
                .is_err()
            {
                debug!("Pipeline gone; result for region {} of {} dropped", index, ticket);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Epoch;
    use crate::pipeline::aggregator::SessionTicket;
    use crate::vision::{DetectionResult, DetectorProfile, RecognitionError};
    use async_trait::async_trait;
    use image::RgbaImage;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Blocks each detect call until a permit arrives
    struct GatedAnalyzer {
        permits: Receiver<()>,
        fail_create_for: Option<Mode>,
    }

    impl Analyzer for GatedAnalyzer {
        fn restart(&mut self) {}

        fn create(&mut self, profile: &DetectorProfile) -> Result<()> {
            if Some(profile.mode) == self.fail_create_for {
                anyhow::bail!("no model for {:?}", profile.mode);
            }
            Ok(())
        }

        fn detect(&mut self, image: &RgbaImage) -> Result<DetectionResult> {
            let _ = self.permits.recv();
            Ok(DetectionResult {
                detections: Vec::new(),
                inference_time_ms: image.width() as u64,
            })
        }
    }

    fn profile(mode: Mode) -> DetectorProfile {
        DetectorProfile {
            mode,
            model_path: PathBuf::new(),
            labels_path: PathBuf::new(),
        }
    }

    fn job(epoch: u64) -> DetectionJob {
        DetectionJob {
            epoch: Epoch(epoch),
            image: Arc::new(RgbaImage::new(epoch as u32, 1)),
        }
    }

    fn worker(fail_create_for: Option<Mode>) -> (DetectorWorker, Sender<()>, Receiver<PipelineEvent>) {
        let (permit_tx, permits) = unbounded();
        let (events_tx, events) = unbounded();
        let analyzer: Box<dyn Analyzer> = Box::new(GatedAnalyzer { permits, fail_create_for });
        let switch = ModeSwitch::new(Mode::SignReading, analyzer, profile).unwrap();
        (DetectorWorker::spawn(switch, events_tx).unwrap(), permit_tx, events)
    }

    fn next_epoch(events: &Receiver<PipelineEvent>) -> Epoch {
        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::Detected { epoch, .. } => epoch,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_waiting_frame_is_replaced_by_newer() {
        let (mut detector, permits, events) = worker(None);

        detector.submit(job(1));
        // wait until job 1 is taken off the queue
        while !detector.jobs_rx.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
        }
        detector.submit(job(2));
        detector.submit(job(3));

        for _ in 0..2 {
            permits.send(()).unwrap();
        }

        assert_eq!(next_epoch(&events), Epoch(1));
        assert_eq!(next_epoch(&events), Epoch(3));
        assert!(events.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_mode_switch_reports_outcome() {
        let (mut detector, _permits, events) = worker(None);
        detector.switch_mode(Mode::SurfaceDamage);

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::ModeChanged(outcome) => assert_eq!(outcome, Ok(Mode::SurfaceDamage)),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_mode_switch_failure_is_reported() {
        let (mut detector, _permits, events) = worker(Some(Mode::SurfaceDamage));
        detector.switch_mode(Mode::SurfaceDamage);

        match events.recv_timeout(Duration::from_secs(5)).unwrap() {
            PipelineEvent::ModeChanged(Err(e)) => assert!(e.contains("no model")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    struct EchoRecognizer;

    #[async_trait]
    impl Recognizer for EchoRecognizer {
        async fn recognize(&self, crop: RgbaImage) -> Result<String, RecognitionError> {
            if crop.width() == 1 {
                return Err(RecognitionError::Engine("too small".into()));
            }
            Ok(format!("{}x{}", crop.width(), crop.height()))
        }
    }

    #[test]
    fn test_tokio_dispatcher_reports_every_region() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (events_tx, events) = unbounded();
        let mut dispatcher = TokioDispatcher::new(runtime.handle().clone(), Arc::new(EchoRecognizer), events_tx);
        let ticket = SessionTicket { epoch: Epoch(1), session: 1 };

        for (index, width) in [4u32, 1, 8].into_iter().enumerate() {
            dispatcher.submit(RegionRequest {
                ticket,
                index,
                crop: RgbaImage::new(width, 2),
            });
        }

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            match events.recv_timeout(Duration::from_secs(5)).unwrap() {
                PipelineEvent::RegionResolved { index, outcome, .. } => outcomes.push((index, outcome)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);

        assert_eq!(outcomes[0].1, Ok("4x2".to_string()));
        assert!(outcomes[1].1.is_err());
        assert_eq!(outcomes[2].1, Ok("8x2".to_string()));
    }
}
