//! The single image currently frozen for analysis

use image::RgbaImage;
use std::fmt;
use std::sync::Arc;

use crate::geometry::PixelBox;

/// Generation number of the current source image.
///
/// Bumped on every capture, upload and clear. Anything dispatched against an
/// older epoch is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the frozen image came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOrigin {
    /// Frame frozen from the live camera feed
    Camera,
    /// Image supplied by the user
    Upload,
}

/// A frozen image with the epoch it was frozen under
#[derive(Debug, Clone)]
pub struct SourceImage {
    /// Epoch this image belongs to
    pub epoch: Epoch,
    /// Capture or upload
    pub origin: ImageOrigin,
    /// RGBA pixel data, shared read-only with the detector worker
    pub pixels: Arc<RgbaImage>,
}

impl SourceImage {
    pub fn new(epoch: Epoch, origin: ImageOrigin, pixels: RgbaImage) -> Self {
        Self {
            epoch,
            origin,
            pixels: Arc::new(pixels),
        }
    }

    /// Get image dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// Copy a region out of the image.
    ///
    /// The crop is an owned buffer so it stays valid after this image is
    /// replaced or cleared.
    pub fn crop(&self, region: &PixelBox) -> RgbaImage {
        image::imageops::crop_imm(
            self.pixels.as_ref(),
            region.x1,
            region.y1,
            region.width(),
            region.height(),
        )
        .to_image()
    }
}
