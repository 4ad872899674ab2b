//! Box drawing onto still images

use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::overlay::ScreenBox;

/// Style for drawn boxes
#[derive(Debug, Clone)]
pub struct BoxStyle {
    /// Stroke color (RGBA)
    pub color: Rgba<u8>,
    /// Stroke width in pixels
    pub stroke: u32,
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self {
            color: Rgba([255, 40, 40, 255]),
            stroke: 3,
        }
    }
}

/// Draw `boxes` onto a copy of `image`. Box coordinates are image pixels.
pub fn render_boxes(image: &RgbaImage, boxes: &[ScreenBox], style: &BoxStyle) -> RgbaImage {
    let mut canvas = image.clone();

    for screen_box in boxes.iter().filter(|b| b.rect.is_drawable()) {
        let r = &screen_box.rect;
        for inset in 0..style.stroke.max(1) {
            let inset = inset as f32;
            let width = (r.width() - 2.0 * inset).round();
            let height = (r.height() - 2.0 * inset).round();
            if width < 1.0 || height < 1.0 {
                break;
            }
            let rect = Rect::at((r.left + inset).round() as i32, (r.top + inset).round() as i32)
                .of_size(width as u32, height as u32);
            draw_hollow_rect_mut(&mut canvas, rect, style.color);
        }
    }

    canvas
}
