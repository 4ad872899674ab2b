//! Detection Ingestion
//!
//! Decides what happens to a detector result: dropped if its image is no
//! longer current, cleared from the view if empty, otherwise mapped into
//! view space for the surface that shows the image.

use crate::capture::{Epoch, ImageOrigin, SourceImage};
use crate::config::ViewConfig;
use crate::geometry::{center_third_direction, fit_rect, to_fitted_view_box, to_view_box, Direction, ViewRect};
use crate::overlay::ScreenBox;
use crate::vision::DetectionResult;

/// Surface a frozen image is shown on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayTarget {
    /// Camera preview; boxes stretched over the whole view
    LiveOverlay,
    /// Uploaded image, aspect-fit inside the view
    UploadedView,
}

impl From<ImageOrigin> for OverlayTarget {
    fn from(origin: ImageOrigin) -> Self {
        match origin {
            ImageOrigin::Camera => OverlayTarget::LiveOverlay,
            ImageOrigin::Upload => OverlayTarget::UploadedView,
        }
    }
}

/// Routing decision for one detector result
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    /// The image the result was computed on is gone
    Stale,
    /// Nothing detected; clear the target
    Empty { target: OverlayTarget },
    /// Draw `boxes` on `target` and aggregate the regions.
    /// `directions[i]` belongs to `boxes[i]`.
    Forward {
        target: OverlayTarget,
        boxes: Vec<ScreenBox>,
        directions: Vec<Direction>,
    },
}

/// Route `result`, computed against the image frozen under `owner`
pub fn route(result: &DetectionResult, owner: Epoch, current: Option<&SourceImage>, views: &ViewConfig) -> Routing {
    let Some(image) = current.filter(|image| image.epoch == owner) else {
        return Routing::Stale;
    };

    let target = OverlayTarget::from(image.origin);
    if result.is_empty() {
        return Routing::Empty { target };
    }

    let (width, height) = image.dimensions();
    let (view_width, rects): (f32, Vec<ViewRect>) = match target {
        OverlayTarget::LiveOverlay => (
            views.live_width,
            result
                .detections
                .iter()
                .map(|d| to_view_box(&d.bbox, views.live_width, views.live_height, width, height))
                .collect(),
        ),
        OverlayTarget::UploadedView => {
            let shown = fit_rect(width, height, views.uploaded_width, views.uploaded_height);
            (
                views.uploaded_width,
                result
                    .detections
                    .iter()
                    .map(|d| to_fitted_view_box(&d.bbox, &shown))
                    .collect(),
            )
        }
    };

    let directions = rects.iter().map(|r| center_third_direction(r, view_width)).collect();
    let boxes = result
        .detections
        .iter()
        .zip(rects)
        .map(|(d, rect)| ScreenBox {
            label: d.label.clone(),
            rect,
        })
        .collect();

    Routing::Forward {
        target,
        boxes,
        directions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::Detection;
    use image::RgbaImage;

    fn views() -> ViewConfig {
        ViewConfig {
            live_width: 300.0,
            live_height: 400.0,
            uploaded_width: 300.0,
            uploaded_height: 300.0,
        }
    }

    fn frozen(epoch: u64, origin: ImageOrigin) -> SourceImage {
        SourceImage::new(Epoch(epoch), origin, RgbaImage::new(600, 300))
    }

    fn result() -> DetectionResult {
        DetectionResult {
            detections: vec![
                Detection::new("left", 0.0, 0.0, 0.2, 0.5),
                Detection::new("right", 0.8, 0.5, 1.0, 1.0),
            ],
            inference_time_ms: 5,
        }
    }

    #[test]
    fn test_stale_when_image_replaced_or_cleared() {
        let image = frozen(3, ImageOrigin::Camera);
        assert_eq!(route(&result(), Epoch(2), Some(&image), &views()), Routing::Stale);
        assert_eq!(route(&result(), Epoch(3), None, &views()), Routing::Stale);
    }

    #[test]
    fn test_empty_result_clears_target() {
        let image = frozen(1, ImageOrigin::Upload);
        assert_eq!(
            route(&DetectionResult::default(), Epoch(1), Some(&image), &views()),
            Routing::Empty { target: OverlayTarget::UploadedView }
        );
    }

    #[test]
    fn test_live_boxes_stretch_to_view() {
        let image = frozen(1, ImageOrigin::Camera);
        let Routing::Forward { target, boxes, directions } = route(&result(), Epoch(1), Some(&image), &views()) else {
            panic!("expected forward");
        };

        assert_eq!(target, OverlayTarget::LiveOverlay);
        assert!((boxes[0].rect.right - 60.0).abs() < 1e-3);
        assert!((boxes[0].rect.bottom - 200.0).abs() < 1e-3);
        assert_eq!(boxes[1].label, "right");
        assert_eq!(directions, vec![Direction::Left, Direction::Right]);
    }

    #[test]
    fn test_uploaded_boxes_follow_fitted_image() {
        let image = frozen(1, ImageOrigin::Upload);
        let Routing::Forward { target, boxes, .. } = route(&result(), Epoch(1), Some(&image), &views()) else {
            panic!("expected forward");
        };

        // 600x300 fit into 300x300: shown at top 75, height 150
        assert_eq!(target, OverlayTarget::UploadedView);
        assert!((boxes[0].rect.top - 75.0).abs() < 1e-3);
        assert!((boxes[0].rect.bottom - 150.0).abs() < 1e-3);
        assert!((boxes[1].rect.bottom - 225.0).abs() < 1e-3);
    }
}
