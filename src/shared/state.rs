//! Runtime status shared with other threads

use parking_lot::RwLock;
use std::sync::Arc;

use crate::capture::{CaptureState, Epoch};
use crate::mode::Mode;

/// Runtime state that is not persisted
#[derive(Debug, Clone, Default)]
pub struct RuntimeState {
    /// Live or frozen
    pub capture_state: CaptureState,
    /// Epoch of the frozen (or last cleared) image
    pub current_epoch: Epoch,
    /// Mode the detector has loaded
    pub active_mode: Mode,
    /// Why the last mode switch failed, until the next request
    pub mode_error: Option<String>,
    /// Last epoch whose detector result was handled
    pub analyzed_epoch: Option<Epoch>,
    /// Inference time of the last handled result
    pub last_inference_ms: Option<u64>,
    /// Whether an aggregation session is open
    pub session_open: bool,
    /// Regions of the open session still waiting for text
    pub regions_pending: usize,
    /// Sessions that published a record
    pub sessions_completed: u64,
    /// Capture and upload requests handled, accepted or not
    pub freeze_requests: u64,
    /// Summary of the last published record
    pub last_summary: Option<String>,
    /// Last error message (if any)
    pub last_error: Option<String>,
}

impl RuntimeState {
    /// Clear the last error
    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Set an error message
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// Whether the frozen image has been fully processed
    pub fn is_settled(&self) -> bool {
        self.capture_state == CaptureState::Frozen
            && self.analyzed_epoch == Some(self.current_epoch)
            && !self.session_open
    }
}

pub type SharedRuntime = Arc<RwLock<RuntimeState>>;
