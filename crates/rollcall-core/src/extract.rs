//! Feature extraction — image bytes to a fixed-length descriptor.
//!
//! The image is decoded, normalized to a fixed square grid, and summarized
//! by per-channel means and standard deviations (color and contrast), mean
//! luminance (brightness), and per-quadrant channel means (coarse spatial
//! information).

use crate::descriptor::FaceDescriptor;
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use thiserror::Error;

// --- Named constants ---
const CHANNELS: usize = 3;
const QUADRANTS: usize = 4;
/// Rec.601 luma weights for R, G, B.
const LUMA_WEIGHTS: [f32; 3] = [0.299, 0.587, 0.114];

/// Descriptor length for any normalization size:
/// channel means + channel std devs + luminance + quadrant channel means.
pub const DESCRIPTOR_LEN: usize = CHANNELS * 2 + 1 + QUADRANTS * CHANNELS;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("bytes do not decode as an image: {0}")]
    DecodeFailure(String),
    #[error("unsupported image format (expected JPEG, PNG, BMP, or GIF)")]
    UnsupportedFormat,
}

/// Deterministic pixel-statistic feature extractor.
///
/// Identical input bytes always yield an identical descriptor; there is no
/// randomness anywhere in the pipeline.
pub struct FeatureExtractor {
    normalize_size: u32,
}

impl FeatureExtractor {
    /// Create an extractor that normalizes inputs to `size` × `size` pixels.
    pub fn new(normalize_size: u32) -> Self {
        Self { normalize_size }
    }

    pub fn normalize_size(&self) -> u32 {
        self.normalize_size
    }

    /// Extract a descriptor from raw image bytes.
    ///
    /// Validates the bytes independently of any earlier screening: the
    /// extractor is also invoked directly on query images that never passed
    /// through the resolver.
    pub fn extract(&self, bytes: &[u8]) -> Result<FaceDescriptor, ExtractError> {
        validate_raster(bytes)?;

        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ExtractError::DecodeFailure(e.to_string()))?;
        let rgb = decoded.to_rgb8();
        let normalized = image::imageops::resize(
            &rgb,
            self.normalize_size,
            self.normalize_size,
            FilterType::Triangle,
        );

        Ok(describe(&normalized))
    }
}

/// Reject bytes that are not a supported raster image.
///
/// A common failure mode is an HTML error page saved where an image was
/// expected, so HTML is sniffed explicitly before format detection.
pub fn validate_raster(bytes: &[u8]) -> Result<(), ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::DecodeFailure("empty input".into()));
    }
    if bytes.starts_with(b"<!DOCTYPE") || bytes.starts_with(b"<html") || bytes.starts_with(b"<HTML")
    {
        return Err(ExtractError::DecodeFailure(
            "input is HTML, not an image".into(),
        ));
    }

    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Bmp | ImageFormat::Gif) => Ok(()),
        Ok(_) => Err(ExtractError::UnsupportedFormat),
        Err(e) => Err(ExtractError::DecodeFailure(e.to_string())),
    }
}

/// Compute the descriptor over a normalized RGB grid.
fn describe(img: &RgbImage) -> FaceDescriptor {
    let (w, h) = img.dimensions();
    let pixel_count = (w as f64) * (h as f64);

    let mut channel_sum = [0.0f64; CHANNELS];
    let mut channel_sq_sum = [0.0f64; CHANNELS];
    let mut luma_sum = 0.0f64;
    let mut quadrant_sum = [[0.0f64; CHANNELS]; QUADRANTS];
    let mut quadrant_count = [0.0f64; QUADRANTS];

    for (x, y, pixel) in img.enumerate_pixels() {
        let q = quadrant_of(x, y, w, h);
        quadrant_count[q] += 1.0;
        let mut luma = 0.0f32;
        for c in 0..CHANNELS {
            let v = pixel.0[c] as f64;
            channel_sum[c] += v;
            channel_sq_sum[c] += v * v;
            quadrant_sum[q][c] += v;
            luma += LUMA_WEIGHTS[c] * pixel.0[c] as f32;
        }
        luma_sum += luma as f64;
    }

    let mut values = Vec::with_capacity(DESCRIPTOR_LEN);

    // Channel means, scaled into [0, 1].
    let means: Vec<f64> = channel_sum.iter().map(|s| s / pixel_count).collect();
    for m in &means {
        values.push((m / 255.0) as f32);
    }

    // Channel standard deviations (contrast proxy). Max possible std dev of
    // an 8-bit channel is 127.5, so dividing by it keeps values in [0, 1].
    for c in 0..CHANNELS {
        let variance = (channel_sq_sum[c] / pixel_count - means[c] * means[c]).max(0.0);
        values.push((variance.sqrt() / 127.5) as f32);
    }

    // Mean luminance (brightness).
    values.push((luma_sum / pixel_count / 255.0) as f32);

    // Quadrant channel means, row-major: top-left, top-right, bottom-left,
    // bottom-right.
    for q in 0..QUADRANTS {
        let count = quadrant_count[q].max(1.0);
        for c in 0..CHANNELS {
            values.push((quadrant_sum[q][c] / count / 255.0) as f32);
        }
    }

    debug_assert_eq!(values.len(), DESCRIPTOR_LEN);
    FaceDescriptor { values }
}

fn quadrant_of(x: u32, y: u32, w: u32, h: u32) -> usize {
    let right = usize::from(x >= w / 2);
    let bottom = usize::from(y >= h / 2);
    bottom * 2 + right
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::io::Cursor;

    fn encode_png(img: &RgbImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn solid(w: u32, h: u32, rgb: [u8; 3]) -> Vec<u8> {
        encode_png(&RgbImage::from_pixel(w, h, Rgb(rgb)))
    }

    #[test]
    fn test_extract_is_deterministic() {
        let bytes = solid(40, 30, [120, 60, 200]);
        let extractor = FeatureExtractor::new(100);
        let a = extractor.extract(&bytes).unwrap();
        let b = extractor.extract(&bytes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_descriptor_has_fixed_length() {
        let extractor = FeatureExtractor::new(100);
        let small = extractor.extract(&solid(8, 8, [10, 20, 30])).unwrap();
        let large = extractor.extract(&solid(300, 200, [10, 20, 30])).unwrap();
        assert_eq!(small.len(), DESCRIPTOR_LEN);
        assert_eq!(large.len(), DESCRIPTOR_LEN);
    }

    #[test]
    fn test_solid_color_statistics() {
        let extractor = FeatureExtractor::new(50);
        let d = extractor.extract(&solid(50, 50, [255, 0, 0])).unwrap();
        // Mean R is maximal, G and B are zero.
        assert!((d.values[0] - 1.0).abs() < 1e-3);
        assert!(d.values[1].abs() < 1e-3);
        assert!(d.values[2].abs() < 1e-3);
        // A solid image has no contrast.
        assert!(d.values[3].abs() < 1e-3);
        // Luminance equals the R luma weight.
        assert!((d.values[6] - LUMA_WEIGHTS[0]).abs() < 1e-2);
    }

    #[test]
    fn test_quadrant_means_capture_position() {
        // Left half white, right half black: horizontal mirror must produce
        // a different descriptor even though global statistics agree.
        let mut left = RgbImage::from_pixel(40, 40, Rgb([0, 0, 0]));
        let mut right = RgbImage::from_pixel(40, 40, Rgb([0, 0, 0]));
        for y in 0..40 {
            for x in 0..20 {
                left.put_pixel(x, y, Rgb([255, 255, 255]));
                right.put_pixel(x + 20, y, Rgb([255, 255, 255]));
            }
        }
        let extractor = FeatureExtractor::new(40);
        let dl = extractor.extract(&encode_png(&left)).unwrap();
        let dr = extractor.extract(&encode_png(&right)).unwrap();
        // Global means match...
        assert!((dl.values[0] - dr.values[0]).abs() < 1e-3);
        // ...but quadrant means differ.
        assert!(dl.similarity(&dr) < 1.0 - 1e-3);
    }

    #[test]
    fn test_html_bytes_rejected() {
        let extractor = FeatureExtractor::new(100);
        let err = extractor
            .extract(b"<!DOCTYPE html><html><body>404</body></html>")
            .unwrap_err();
        assert!(matches!(err, ExtractError::DecodeFailure(_)));
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        let extractor = FeatureExtractor::new(100);
        assert!(extractor.extract(&[0u8, 1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn test_unsupported_format_rejected() {
        // A valid TIFF header decodes as an image format outside the
        // supported set.
        let tiff_header = b"II*\x00\x08\x00\x00\x00";
        let extractor = FeatureExtractor::new(100);
        let err = extractor.extract(tiff_header).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedFormat));
    }

    #[test]
    fn test_truncated_png_fails_decode() {
        let mut bytes = solid(20, 20, [1, 2, 3]);
        bytes.truncate(bytes.len() / 2);
        let extractor = FeatureExtractor::new(100);
        let err = extractor.extract(&bytes).unwrap_err();
        assert!(matches!(err, ExtractError::DecodeFailure(_)));
    }
}
