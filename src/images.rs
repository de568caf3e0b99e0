//! Query image preprocessing.
//!
//! Decodes uploaded bytes, caps the width and converts to 3-channel RGB before
//! the image reaches the embedder.

use image::{DynamicImage, GenericImageView, ImageFormat};

/// Decode `data` and normalize it for embedding.
///
/// Images wider than `max_width` are downsampled with Lanczos3 to exactly
/// `max_width` wide, height `round(max_width * h / w)`. Alpha is dropped.
pub fn prepare_query_image(data: &[u8], max_width: u32) -> image::ImageResult<DynamicImage> {
    let img = image::load_from_memory(data)?;

    let (width, height) = img.dimensions();
    let img = match scaled_dimensions(width, height, max_width) {
        Some((new_w, new_h)) => {
            log::debug!("resizing query image {width}x{height} -> {new_w}x{new_h}");
            img.resize_exact(new_w, new_h, image::imageops::FilterType::Lanczos3)
        }
        None => img,
    };

    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}

/// Target size when `width` exceeds `max_width`, `None` when no resize is needed.
pub fn scaled_dimensions(width: u32, height: u32, max_width: u32) -> Option<(u32, u32)> {
    if width <= max_width || max_width == 0 {
        return None;
    }

    let new_h = ((max_width as f64) * (height as f64) / (width as f64)).round() as u32;
    Some((max_width, new_h.max(1)))
}

/// Detect image format from bytes
pub fn detect_format(data: &[u8]) -> Option<ImageFormat> {
    image::guess_format(data).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::encode_image;

    fn create_png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbaImage::from_fn(width, height, |x, y| {
            image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        encode_image(&DynamicImage::ImageRgba8(img), ImageFormat::Png)
    }

    #[test]
    fn test_scaled_dimensions() {
        assert_eq!(scaled_dimensions(2048, 1024, 1024), Some((1024, 512)));
        assert_eq!(scaled_dimensions(3000, 1001, 1024), Some((1024, 342)));
        assert_eq!(scaled_dimensions(1024, 4000, 1024), None);
        assert_eq!(scaled_dimensions(5000, 1, 1024), Some((1024, 1)));
    }

    #[test]
    fn test_small_image_keeps_size_and_drops_alpha() {
        let png = create_png(40, 30);
        let img = prepare_query_image(&png, 1024).unwrap();

        assert_eq!(img.dimensions(), (40, 30));
        assert!(matches!(img, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn test_wide_image_is_downsampled() {
        let png = create_png(300, 100);
        let img = prepare_query_image(&png, 120).unwrap();

        assert_eq!(img.dimensions(), (120, 40));
        assert!(matches!(img, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn test_tall_image_is_not_resized() {
        let png = create_png(100, 500);
        let img = prepare_query_image(&png, 120).unwrap();
        assert_eq!(img.dimensions(), (100, 500));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(prepare_query_image(&[1, 2, 3, 4, 5], 1024).is_err());
        assert!(prepare_query_image(&[], 1024).is_err());
    }

    #[test]
    fn test_detect_format_png() {
        let png = create_png(1, 1);
        assert_eq!(detect_format(&png), Some(ImageFormat::Png));
    }
}
