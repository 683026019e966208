//! Utility functions for image input

use crate::error::SegmentError;
use image::io::Reader as ImageReader;
use image::RgbaImage;
use std::io::Cursor;

/// Decode encoded image bytes (PNG or JPEG) into RGBA.
///
/// Dimensions are read from the header first so oversized inputs are
/// rejected before any pixel buffer is allocated.
pub fn decode_image(bytes: &[u8], max_pixels: u64) -> Result<RgbaImage, SegmentError> {
    if bytes.is_empty() {
        return Err(SegmentError::DecodeInput("Image bytes are empty".to_string()));
    }

    let (width, height) = reader(bytes)?
        .into_dimensions()
        .map_err(|e| SegmentError::DecodeInput(format!("Failed to read image header: {}", e)))?;

    if width == 0 || height == 0 {
        return Err(SegmentError::DecodeInput(format!(
            "Image has zero size ({}x{})",
            width, height
        )));
    }

    let pixels = width as u64 * height as u64;
    if pixels > max_pixels {
        return Err(SegmentError::DecodeInput(format!(
            "Image is {}x{} ({} pixels), limit is {}",
            width, height, pixels, max_pixels
        )));
    }

    let image = reader(bytes)?
        .decode()
        .map_err(|e| SegmentError::DecodeInput(format!("Failed to decode image: {}", e)))?;
    Ok(image.to_rgba8())
}

fn reader(bytes: &[u8]) -> Result<ImageReader<Cursor<&[u8]>>, SegmentError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| SegmentError::DecodeInput(format!("Unrecognized image format: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::compositor::encode_png;
    use image::Rgba;

    #[test]
    fn test_decode_png() {
        let source = RgbaImage::from_pixel(12, 5, Rgba([9, 8, 7, 255]));
        let png = encode_png(&source).unwrap();
        let decoded = decode_image(&png, 1_000).unwrap();
        assert_eq!(decoded, source);
    }

    #[test]
    fn test_decode_empty() {
        assert!(matches!(decode_image(&[], 1_000), Err(SegmentError::DecodeInput(_))));
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode_image(b"definitely not an image", 1_000);
        assert!(matches!(result, Err(SegmentError::DecodeInput(_))));
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let png = encode_png(&RgbaImage::new(40, 40)).unwrap();
        let result = decode_image(&png, 1_599);
        assert!(matches!(result, Err(SegmentError::DecodeInput(_))));
        assert!(decode_image(&png, 1_600).is_ok());
    }
}
