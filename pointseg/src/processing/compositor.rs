//! Mask compositor: per-label colors blended over the source image

use crate::error::SegmentError;
use crate::models::BinaryMask;
use crate::processing::labels::LabelId;
use bytes::Bytes;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder as _, Rgba, RgbaImage};

/// Blend parameters shared by every label
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Palette {
    pub alpha: u8,
    pub hue_step: f32,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            alpha: 128,
            hue_step: 137.5,
        }
    }
}

impl Palette {
    pub fn new(alpha: u8, hue_step: f32) -> Self {
        Self { alpha, hue_step }
    }

    /// Hue in [0, 360) for a label; negative ids wrap around
    pub fn hue(&self, label: LabelId) -> f32 {
        let hue = (label as f64 * self.hue_step as f64).rem_euclid(360.0) as f32;
        // values just under 360 round up to 360.0 in f32
        if hue >= 360.0 {
            0.0
        } else {
            hue
        }
    }

    pub fn color(&self, label: LabelId) -> Rgba<u8> {
        let [r, g, b] = hsv_to_rgb(self.hue(label), 1.0, 1.0);
        Rgba([r, g, b, self.alpha])
    }
}

/// Sector-based HSV to 8-bit RGB, each component rounded
pub fn hsv_to_rgb(hue: f32, saturation: f32, value: f32) -> [u8; 3] {
    let s = saturation.clamp(0.0, 1.0);
    let v = value.clamp(0.0, 1.0);
    let to_byte = |x: f32| (x * 255.0).round() as u8;

    if s <= 0.0 {
        let gray = to_byte(v);
        return [gray, gray, gray];
    }

    let h = if (0.0..360.0).contains(&hue) { hue / 60.0 } else { 0.0 };
    let sector = h.floor();
    let f = h - sector;

    let v8 = to_byte(v);
    let p = to_byte((1.0 - s) * v);
    let q = to_byte((1.0 - s * f) * v);
    let t = to_byte((1.0 - s * (1.0 - f)) * v);

    match sector as u8 {
        0 => [v8, t, p],
        1 => [q, v8, p],
        2 => [p, v8, t],
        3 => [p, q, v8],
        4 => [t, p, v8],
        _ => [v8, p, q],
    }
}

/// `(base * (255 - a) + color * a) / 255` per channel, alpha forced opaque
pub fn blend(base: Rgba<u8>, color: Rgba<u8>) -> Rgba<u8> {
    let a = color[3] as u32;
    let mix = |p: u8, c: u8| ((p as u32 * (255 - a) + c as u32 * a) / 255) as u8;
    Rgba([
        mix(base[0], color[0]),
        mix(base[1], color[1]),
        mix(base[2], color[2]),
        255,
    ])
}

/// Copy of `base` with every label's mask blended in, in iteration order.
///
/// Pixels outside every mask keep their base value, so an empty mask set
/// returns `base` unchanged.
pub fn composite<'a, I>(base: &RgbaImage, masks: I, palette: Palette) -> RgbaImage
where
    I: IntoIterator<Item = (LabelId, &'a BinaryMask)>,
{
    let mut out = base.clone();
    for (label, mask) in masks {
        let color = palette.color(label);
        paint(&mut out, mask, |pixel| *pixel = blend(*pixel, color));
    }
    out
}

/// Label colors on a transparent background, for hosts that draw their own image
pub fn overlay<'a, I>(width: u32, height: u32, masks: I, palette: Palette) -> RgbaImage
where
    I: IntoIterator<Item = (LabelId, &'a BinaryMask)>,
{
    let mut out = RgbaImage::new(width, height);
    for (label, mask) in masks {
        let color = palette.color(label);
        paint(&mut out, mask, |pixel| {
            if pixel[3] == 0 {
                *pixel = color;
            } else {
                let covered = pixel[3] as u32;
                let alpha = color[3] as u32 + covered * (255 - color[3] as u32) / 255;
                let mut mixed = blend(*pixel, color);
                mixed[3] = alpha.min(255) as u8;
                *pixel = mixed;
            }
        });
    }
    out
}

fn paint(image: &mut RgbaImage, mask: &BinaryMask, mut apply: impl FnMut(&mut Rgba<u8>)) {
    let width = image.width().min(mask.width());
    let height = image.height().min(mask.height());
    for y in 0..height {
        for x in 0..width {
            if mask.get(x, y) {
                apply(image.get_pixel_mut(x, y));
            }
        }
    }
}

pub fn encode_png(image: &RgbaImage) -> Result<Bytes, SegmentError> {
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        ColorType::Rgba8,
    )?;
    Ok(Bytes::from(buf))
}
