//! Capture Layer
//!
//! Decides whether the pipeline is following the live camera or is frozen on
//! one captured/uploaded image, and owns that image.

pub mod frame;

use image::RgbaImage;
use thiserror::Error;
use tracing::{debug, info};

pub use frame::{Epoch, ImageOrigin, SourceImage};

/// Control surface of the live camera source
pub trait CameraControl: Send {
    /// Stop delivering preview frames
    fn pause(&mut self);
    /// Resume delivering preview frames
    fn resume(&mut self);
}

/// Camera control for setups without a camera (still images only)
#[derive(Debug, Default)]
pub struct NoCamera;

impl CameraControl for NoCamera {
    fn pause(&mut self) {}
    fn resume(&mut self) {}
}

/// Capture state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    /// Camera running, no image held
    #[default]
    Live,
    /// Image held, camera paused
    Frozen,
}

/// Reasons a capture or upload is refused
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("an image is already frozen; clear it first")]
    AlreadyFrozen,
    #[error("image has no pixels ({0}x{1})")]
    EmptyImage(u32, u32),
}

/// Live/Frozen state machine owning the current source image
pub struct CaptureStateMachine {
    state: CaptureState,
    current: Option<SourceImage>,
    epoch: Epoch,
    camera: Box<dyn CameraControl>,
}

impl CaptureStateMachine {
    /// Create a state machine in `Live` with the camera running
    pub fn new(camera: Box<dyn CameraControl>) -> Self {
        Self {
            state: CaptureState::Live,
            current: None,
            epoch: Epoch::default(),
            camera,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Epoch of the current (or most recently cleared) image
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// The frozen image, if any
    pub fn current(&self) -> Option<&SourceImage> {
        self.current.as_ref()
    }

    /// Whether `epoch` still names the frozen image
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current.as_ref().is_some_and(|image| image.epoch == epoch)
    }

    /// Freeze a camera frame. Returns `None` (no-op) when already frozen.
    pub fn capture(&mut self, frame: RgbaImage) -> Option<&SourceImage> {
        self.freeze_logged(frame, ImageOrigin::Camera)
    }

    /// Freeze a user-supplied image. Returns `None` (no-op) when already frozen.
    pub fn upload(&mut self, image: RgbaImage) -> Option<&SourceImage> {
        self.freeze_logged(image, ImageOrigin::Upload)
    }

    /// Freeze an image, reporting why it was refused
    pub fn try_freeze(&mut self, pixels: RgbaImage, origin: ImageOrigin) -> Result<&SourceImage, CaptureError> {
        if self.state == CaptureState::Frozen {
            return Err(CaptureError::AlreadyFrozen);
        }
        let (w, h) = pixels.dimensions();
        if w == 0 || h == 0 {
            return Err(CaptureError::EmptyImage(w, h));
        }

        self.epoch = self.epoch.next();
        self.camera.pause();
        self.state = CaptureState::Frozen;
        info!("Frozen {:?} image {}x{} as {}", origin, w, h, self.epoch);

        let image: &SourceImage = self.current.insert(SourceImage::new(self.epoch, origin, pixels));
        Ok(image)
    }

    fn freeze_logged(&mut self, pixels: RgbaImage, origin: ImageOrigin) -> Option<&SourceImage> {
        match self.try_freeze(pixels, origin) {
            Ok(image) => Some(image),
            Err(e) => {
                debug!("Ignoring {:?} image: {}", origin, e);
                None
            }
        }
    }

    /// Drop the frozen image and resume the camera.
    ///
    /// Returns `false` when already live; calling it repeatedly is harmless.
    pub fn clear(&mut self) -> bool {
        if self.state == CaptureState::Live {
            return false;
        }

        self.current = None;
        self.epoch = self.epoch.next();
        self.state = CaptureState::Live;
        self.camera.resume();
        info!("Cleared frozen image, back to live ({})", self.epoch);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct RecordingCamera {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CameraControl for RecordingCamera {
        fn pause(&mut self) {
            self.calls.lock().push("pause");
        }
        fn resume(&mut self) {
            self.calls.lock().push("resume");
        }
    }

    fn machine() -> (CaptureStateMachine, RecordingCamera) {
        let camera = RecordingCamera::default();
        (CaptureStateMachine::new(Box::new(camera.clone())), camera)
    }

    fn frame() -> RgbaImage {
        RgbaImage::new(8, 6)
    }

    #[test]
    fn test_initial_state_is_live() {
        let (sm, _) = machine();
        assert_eq!(sm.state(), CaptureState::Live);
        assert!(sm.current().is_none());
    }

    #[test]
    fn test_capture_freezes_and_pauses_camera() {
        let (mut sm, camera) = machine();
        let epoch = sm.capture(frame()).map(|image| image.epoch).unwrap();

        assert_eq!(sm.state(), CaptureState::Frozen);
        assert!(sm.is_current(epoch));
        assert_eq!(sm.current().unwrap().origin, ImageOrigin::Camera);
        assert_eq!(*camera.calls.lock(), vec!["pause"]);
    }

    #[test]
    fn test_capture_while_frozen_is_rejected() {
        let (mut sm, camera) = machine();
        let first = sm.capture(frame()).map(|image| image.epoch).unwrap();

        assert!(sm.capture(frame()).is_none());
        assert!(sm.upload(frame()).is_none());
        assert_eq!(
            sm.try_freeze(frame(), ImageOrigin::Upload).unwrap_err(),
            CaptureError::AlreadyFrozen
        );
        assert!(sm.is_current(first));
        assert_eq!(camera.calls.lock().len(), 1);
    }

    #[test]
    fn test_upload_marks_origin() {
        let (mut sm, _) = machine();
        sm.upload(frame());
        assert_eq!(sm.current().unwrap().origin, ImageOrigin::Upload);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let (mut sm, _) = machine();
        let err = sm.try_freeze(RgbaImage::new(0, 10), ImageOrigin::Upload).unwrap_err();
        assert_eq!(err, CaptureError::EmptyImage(0, 10));
        assert_eq!(sm.state(), CaptureState::Live);
    }

    #[test]
    fn test_clear_resumes_and_invalidates_epoch() {
        let (mut sm, camera) = machine();
        let epoch = sm.capture(frame()).map(|image| image.epoch).unwrap();

        assert!(sm.clear());
        assert_eq!(sm.state(), CaptureState::Live);
        assert!(!sm.is_current(epoch));
        assert!(sm.epoch() > epoch);
        assert_eq!(*camera.calls.lock(), vec!["pause", "resume"]);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (mut sm, camera) = machine();
        assert!(!sm.clear());

        sm.capture(frame());
        assert!(sm.clear());
        assert!(!sm.clear());
        assert_eq!(*camera.calls.lock(), vec!["pause", "resume"]);
    }

    #[test]
    fn test_recapture_gets_new_epoch() {
        let (mut sm, _) = machine();
        let first = sm.capture(frame()).map(|image| image.epoch).unwrap();
        sm.clear();
        let second = sm.capture(frame()).map(|image| image.epoch).unwrap();

        assert_ne!(first, second);
        assert!(!sm.is_current(first));
        assert!(sm.is_current(second));
    }
}
