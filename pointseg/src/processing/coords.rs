//! Conversions between display pixels, original pixels and model space
//!
//! Display coordinates come from touch input on a scaled view of the image.
//! The decoder expects points in the encoder's fixed 1024x1024 pixel space.
//! Going through integer display pixels loses precision, so a round trip
//! back to display space is not exact.

/// Encoder input resolution on both axes
pub const MODEL_INPUT_SIZE: u32 = 1024;

/// A 2D point in some coordinate space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Width and height of an image or view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

// Largest f32 strictly below 1.0
const BELOW_ONE: f32 = 1.0 - f32::EPSILON / 2.0;

/// Display point to original-image pixels, scaling each axis independently
pub fn to_original(display: Point2, display_size: Size, original_size: Size) -> Point2 {
    if display_size.width == 0 || display_size.height == 0 {
        return Point2::new(0.0, 0.0);
    }
    let scale_x = original_size.width as f32 / display_size.width as f32;
    let scale_y = original_size.height as f32 / display_size.height as f32;
    Point2::new(display.x * scale_x, display.y * scale_y)
}

/// Original-image pixels to normalized `[0, 1)`
pub fn to_model_space(original: Point2, original_size: Size) -> Point2 {
    if original_size.width == 0 || original_size.height == 0 {
        return Point2::new(0.0, 0.0);
    }
    Point2::new(
        clamp_unit(original.x / original_size.width as f32),
        clamp_unit(original.y / original_size.height as f32),
    )
}

/// Normalized coordinates to model pixels in `[0, 1024)`
pub fn to_model_pixels(normalized: Point2) -> Point2 {
    // Scaling by a power of two is exact, so values below 1.0 stay below 1024
    let size = MODEL_INPUT_SIZE as f32;
    Point2::new(clamp_unit(normalized.x) * size, clamp_unit(normalized.y) * size)
}

/// Caller-normalized point (relative to the full original image) to model pixels
pub fn from_normalized(x: f32, y: f32) -> Point2 {
    to_model_pixels(Point2::new(x, y))
}

/// Display point straight to model pixels
pub fn display_to_model(display: Point2, display_size: Size, original_size: Size) -> Point2 {
    to_model_pixels(to_model_space(
        to_original(display, display_size, original_size),
        original_size,
    ))
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, BELOW_ONE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_original_independent_axes() {
        let p = to_original(Point2::new(100.0, 50.0), Size::new(200, 100), Size::new(400, 300));
        assert_eq!(p, Point2::new(200.0, 150.0));
    }

    #[test]
    fn test_to_model_space_divides_by_original() {
        let p = to_model_space(Point2::new(200.0, 150.0), Size::new(400, 300));
        assert_eq!(p, Point2::new(0.5, 0.5));
    }

    #[test]
    fn test_to_model_pixels_center() {
        assert_eq!(to_model_pixels(Point2::new(0.5, 0.5)), Point2::new(512.0, 512.0));
    }

    #[test]
    fn test_to_model_pixels_upper_edge_stays_below_1024() {
        let p = to_model_pixels(Point2::new(1.0, 1.0));
        assert!(p.x < 1024.0 && p.y < 1024.0);
        assert!(p.x > 1023.0 && p.y > 1023.0);
    }

    #[test]
    fn test_out_of_range_and_nan_are_clamped() {
        let p = from_normalized(-0.5, f32::NAN);
        assert_eq!(p, Point2::new(0.0, 0.0));
        let p = from_normalized(3.0, 0.25);
        assert!(p.x < 1024.0);
        assert_eq!(p.y, 256.0);
    }

    #[test]
    fn test_zero_sizes_do_not_divide_by_zero() {
        let p = to_original(Point2::new(10.0, 10.0), Size::new(0, 0), Size::new(10, 10));
        assert_eq!(p, Point2::new(0.0, 0.0));
        let p = to_model_space(Point2::new(10.0, 10.0), Size::new(0, 10));
        assert_eq!(p, Point2::new(0.0, 0.0));
    }

    #[test]
    fn test_display_to_model_unchanged_dimensions() {
        let size = Size::new(400, 300);
        let p = display_to_model(Point2::new(100.0, 75.0), size, size);
        assert_eq!(p, Point2::new(256.0, 256.0));
    }
}
