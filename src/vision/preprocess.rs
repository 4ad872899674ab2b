//! Image preprocessing for the ONNX models
//!
//! Handles resizing, normalization, and tensor conversion for the YOLO
//! detector and the PaddleOCR recognizer.

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use ndarray::{Array3, Array4};

/// Gray used to pad letterboxed detector input (YOLO convention)
const LETTERBOX_FILL: u8 = 114;

/// Convert an RGBA image to an HWC RGB f32 array in `[0, 1]`
pub fn rgba_to_rgb_f32(image: &RgbaImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        rgb[[y, x, 0]] = pixel[0] as f32 / 255.0;
        rgb[[y, x, 1]] = pixel[1] as f32 / 255.0;
        rgb[[y, x, 2]] = pixel[2] as f32 / 255.0;
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let (h, w, _) = image.dim();
    let mut normalized = Array3::<f32>::zeros((h, w, 3));

    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                normalized[[y, x, c]] = (image[[y, x, c]] - mean[c]) / std[c];
            }
        }
    }

    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

/// How an image was placed inside the square detector input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Input pixels per source pixel
    pub scale: f32,
    /// Horizontal padding in input pixels
    pub pad_x: f32,
    /// Vertical padding in input pixels
    pub pad_y: f32,
}

impl Letterbox {
    /// Map an input-space x coordinate back to source pixels
    pub fn source_x(&self, x: f32) -> f32 {
        (x - self.pad_x) / self.scale
    }

    /// Map an input-space y coordinate back to source pixels
    pub fn source_y(&self, y: f32) -> f32 {
        (y - self.pad_y) / self.scale
    }
}

/// Resize keeping aspect ratio and pad to a `size` x `size` square
pub fn letterbox(image: &RgbaImage, size: u32) -> (RgbaImage, Letterbox) {
    let size = size.max(1);
    let (w, h) = image.dimensions();
    let scale = (size as f32 / w.max(1) as f32).min(size as f32 / h.max(1) as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbaImage::from_pixel(size, size, Rgba([LETTERBOX_FILL, LETTERBOX_FILL, LETTERBOX_FILL, 255]));
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Full preprocessing for the detector: letterbox, scale to `[0, 1]`, NCHW
pub fn preprocess_for_detection(image: &RgbaImage, input_size: u32) -> (Array4<f32>, Letterbox) {
    let (boxed, placement) = letterbox(image, input_size);
    let tensor = hwc_to_nchw(&rgba_to_rgb_f32(&boxed));
    (tensor, placement)
}

/// Upscale crops whose smaller side is below `min_dimension` (at most 4x)
pub fn upscale_small_crop(crop: &RgbaImage, min_dimension: u32) -> RgbaImage {
    let (w, h) = crop.dimensions();
    let smallest = w.min(h).max(1);
    if smallest >= min_dimension {
        return crop.clone();
    }

    let factor = min_dimension.div_ceil(smallest).clamp(2, 4);
    image::imageops::resize(crop, w * factor, h * factor, FilterType::Triangle)
}

/// Resize a crop for recognition (fixed height, variable width up to max)
pub fn resize_for_recognition(crop: &RgbaImage, target_height: u32, max_width: u32) -> RgbaImage {
    let target_height = target_height.max(1);
    let (w, h) = crop.dimensions();
    let scale = target_height as f32 / h.max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, max_width.max(1));
    image::imageops::resize(crop, new_w, target_height, FilterType::Triangle)
}

/// Full preprocessing for the recognizer: resize, normalize to `[-1, 1]`, NCHW
pub fn preprocess_for_recognition(crop: &RgbaImage, target_height: u32, max_width: u32) -> Array4<f32> {
    let resized = resize_for_recognition(crop, target_height, max_width);
    let rgb = rgba_to_rgb_f32(&resized);
    // PaddleOCR expects (pixel / 255 - 0.5) / 0.5
    let normalized = normalize(&rgb, &[0.5, 0.5, 0.5], &[0.5, 0.5, 0.5]);
    hwc_to_nchw(&normalized)
}
