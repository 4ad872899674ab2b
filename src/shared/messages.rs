//! Messages delivered to the pipeline controller thread

use image::RgbaImage;

use crate::capture::Epoch;
use crate::mode::Mode;
use crate::pipeline::aggregator::SessionTicket;
use crate::vision::{DetectionResult, RecognitionError};

/// Everything that can change pipeline state, in arrival order
#[derive(Debug)]
pub enum PipelineEvent {
    /// Freeze a camera frame for analysis
    Capture(RgbaImage),
    /// Freeze a user-supplied image for analysis
    Upload(RgbaImage),
    /// Drop the frozen image and return to live
    Clear,
    /// Detector finished with the image frozen under `epoch`
    Detected {
        epoch: Epoch,
        outcome: Result<DetectionResult, String>,
    },
    /// Recognizer finished one region
    RegionResolved {
        ticket: SessionTicket,
        index: usize,
        outcome: Result<String, RecognitionError>,
    },
    /// Select a detection mode
    SwitchMode(Mode),
    /// Select the other detection mode
    ToggleMode,
    /// Detector worker finished loading a mode
    ModeChanged(Result<Mode, String>),
    /// Stop the controller
    Shutdown,
}
