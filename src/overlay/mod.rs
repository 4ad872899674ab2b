//! Overlay Presentation Layer
//!
//! Rectangles and labels handed to a rendering surface. The pipeline only
//! replaces or clears the full set; drawing is up to the surface.

pub mod widgets;

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::geometry::ViewRect;

pub use widgets::{render_boxes, BoxStyle};

/// One labelled rectangle in view pixels
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenBox {
    pub label: String,
    pub rect: ViewRect,
}

/// A surface that draws boxes. Both calls replace whatever was shown before.
pub trait OverlaySink: Send {
    fn set_boxes(&mut self, boxes: Vec<ScreenBox>);
    fn clear(&mut self);
}

/// Box set shared with whatever thread draws it
#[derive(Debug, Clone, Default)]
pub struct OverlayLayer {
    name: &'static str,
    boxes: Arc<RwLock<Vec<ScreenBox>>>,
}

impl OverlayLayer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            boxes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Current boxes
    pub fn snapshot(&self) -> Vec<ScreenBox> {
        self.boxes.read().clone()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.boxes.read().is_empty()
    }
}

impl OverlaySink for OverlayLayer {
    fn set_boxes(&mut self, boxes: Vec<ScreenBox>) {
        // zero-area rectangles are never drawn
        let drawable: Vec<ScreenBox> = boxes.into_iter().filter(|b| b.rect.is_drawable()).collect();
        debug!("{} overlay: {} boxes", self.name, drawable.len());
        *self.boxes.write() = drawable;
    }

    fn clear(&mut self) {
        self.boxes.write().clear();
    }
}
