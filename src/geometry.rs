//! Coordinate transforms between the three box spaces
//!
//! - normalized: `[0, 1]` fractions of the source image (detector output)
//! - pixel: integer pixels of the source image (crop regions)
//! - view: floating point pixels of a display surface (overlay rectangles)
//!
//! Everything here is a pure function of its inputs.

use serde::{Deserialize, Serialize};

/// Box in normalized source-image space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl NormalizedBox {
    /// Build a box, ordering the corners so that `x1 <= x2` and `y1 <= y2`
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Same box with every coordinate clamped into `[0, 1]`
    pub fn clamped(&self) -> Self {
        Self::new(
            self.x1.clamp(0.0, 1.0),
            self.y1.clamp(0.0, 1.0),
            self.x2.clamp(0.0, 1.0),
            self.y2.clamp(0.0, 1.0),
        )
    }
}

/// Box in source-image pixels. `x2`/`y2` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }
}

/// Rectangle in display (view) pixels
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl ViewRect {
    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn center_x(&self) -> f32 {
        (self.left + self.right) / 2.0
    }

    /// Zero-area rectangles are never drawn
    pub fn is_drawable(&self) -> bool {
        self.width() > 0.0 && self.height() > 0.0
    }
}

/// Horizontal position of a box relative to the view, split in thirds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Center,
    Right,
}

impl Direction {
    /// Phrase used in spoken announcements
    pub fn phrase(&self) -> &'static str {
        match self {
            Direction::Left => "on the left",
            Direction::Center => "in front",
            Direction::Right => "on the right",
        }
    }
}

/// Map a normalized box to a crop rectangle in source pixels.
///
/// The min corner is clamped into `[0, dim - 1]` and the max corner into
/// `[min + 1, dim]`, so the result is at least 1x1 even for a zero-area box.
pub fn to_pixel_box(b: &NormalizedBox, width: u32, height: u32) -> PixelBox {
    let (x1, x2) = pixel_span(b.x1, b.x2, width);
    let (y1, y2) = pixel_span(b.y1, b.y2, height);
    PixelBox { x1, y1, x2, y2 }
}

fn pixel_span(lo: f32, hi: f32, dim: u32) -> (u32, u32) {
    let scale = dim as f64;
    let min = round_to_pixel(lo as f64 * scale).min(dim.saturating_sub(1));
    let max = round_to_pixel(hi as f64 * scale).clamp(min + 1, dim.max(min + 1));
    (min, max)
}

fn round_to_pixel(value: f64) -> u32 {
    if value.is_nan() || value <= 0.0 {
        0
    } else {
        value.round().min(u32::MAX as f64) as u32
    }
}

/// Inverse of [`to_pixel_box`] for unclamped integer inputs.
///
/// A zero dimension maps that axis to 0.
pub fn normalize(pixel_box: &PixelBox, width: u32, height: u32) -> NormalizedBox {
    let nx = |v: u32| if width == 0 { 0.0 } else { (v as f64 / width as f64) as f32 };
    let ny = |v: u32| if height == 0 { 0.0 } else { (v as f64 / height as f64) as f32 };
    NormalizedBox {
        x1: nx(pixel_box.x1),
        y1: ny(pixel_box.y1),
        x2: nx(pixel_box.x2),
        y2: ny(pixel_box.y2),
    }
}

/// Map a normalized box onto a view that stretches the source to its bounds.
///
/// X and Y are scaled independently by `view / source`. A zero source
/// dimension gives a zero scale, i.e. a degenerate rectangle.
pub fn to_view_box(
    b: &NormalizedBox,
    view_width: f32,
    view_height: f32,
    source_width: u32,
    source_height: u32,
) -> ViewRect {
    let scale_x = axis_scale(view_width, source_width);
    let scale_y = axis_scale(view_height, source_height);
    let sw = source_width as f32;
    let sh = source_height as f32;

    ViewRect {
        left: b.x1 * sw * scale_x,
        top: b.y1 * sh * scale_y,
        right: b.x2 * sw * scale_x,
        bottom: b.y2 * sh * scale_y,
    }
}

fn axis_scale(view: f32, source: u32) -> f32 {
    if source == 0 {
        0.0
    } else {
        view / source as f32
    }
}

/// Rectangle the source occupies when aspect-fit and centered inside a view
pub fn fit_rect(source_width: u32, source_height: u32, view_width: f32, view_height: f32) -> ViewRect {
    if source_width == 0 || source_height == 0 {
        return ViewRect::default();
    }

    let sw = source_width as f32;
    let sh = source_height as f32;
    let scale = (view_width / sw).min(view_height / sh).max(0.0);
    let shown_w = sw * scale;
    let shown_h = sh * scale;
    let left = (view_width - shown_w) / 2.0;
    let top = (view_height - shown_h) / 2.0;

    ViewRect {
        left,
        top,
        right: left + shown_w,
        bottom: top + shown_h,
    }
}

/// Map a normalized box into the displayed rectangle returned by [`fit_rect`]
pub fn to_fitted_view_box(b: &NormalizedBox, shown: &ViewRect) -> ViewRect {
    let w = shown.width();
    let h = shown.height();
    ViewRect {
        left: b.x1 * w + shown.left,
        top: b.y1 * h + shown.top,
        right: b.x2 * w + shown.left,
        bottom: b.y2 * h + shown.top,
    }
}

/// Left/center/right third of a view-space box.
///
/// Both the box and `view_width` must be in view pixels. A center exactly on
/// a third boundary counts as `Center`.
pub fn center_third_direction(view_box: &ViewRect, view_width: f32) -> Direction {
    let center_x = view_box.center_x();
    if center_x < view_width / 3.0 {
        Direction::Left
    } else if center_x > 2.0 * view_width / 3.0 {
        Direction::Right
    } else {
        Direction::Center
    }
}
