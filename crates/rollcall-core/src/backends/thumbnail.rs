//! Model-free baseline extractor.
//!
//! Downsamples the face crop to a 16×16 grayscale thumbnail and centres it
//! to zero mean and unit length. Useful where no ONNX model is installed and
//! as a deterministic backend in tests; it does not generalise across
//! lighting or pose the way a trained embedding does.

use crate::extractor::{check_output, EmbeddingExtractor, ExtractorError, ExtractorInfo};
use crate::types::{Embedding, FaceRegion};
use image::imageops::{self, FilterType};

const THUMB_SIZE: u32 = 16;
const THUMB_MODEL_VERSION: &str = "thumb16";

#[derive(Debug, Default)]
pub struct ThumbnailExtractor;

impl ThumbnailExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl EmbeddingExtractor for ThumbnailExtractor {
    fn info(&self) -> ExtractorInfo {
        ExtractorInfo {
            dimension: (THUMB_SIZE * THUMB_SIZE) as usize,
            model_version: THUMB_MODEL_VERSION.to_string(),
        }
    }

    fn extract(&mut self, region: &FaceRegion<'_>) -> Result<Embedding, ExtractorError> {
        let image = region.image;
        let (x, y, w, h) = region
            .bbox
            .clamped(image.width(), image.height())
            .ok_or(ExtractorError::EmptyRegion)?;

        let rgb = image.to_rgb();
        let crop = imageops::crop_imm(&rgb, x, y, w, h).to_image();
        let gray = image::DynamicImage::ImageRgb8(crop).to_luma8();
        let thumb = imageops::resize(&gray, THUMB_SIZE, THUMB_SIZE, FilterType::Triangle);

        let raw: Vec<f32> = thumb.pixels().map(|p| p.0[0] as f32).collect();
        check_output(&self.info(), &raw)?;

        let mean = raw.iter().sum::<f32>() / raw.len() as f32;
        let centred = raw.into_iter().map(|v| v - mean).collect();

        Ok(Embedding::new(centred, THUMB_MODEL_VERSION).l2_normalized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, FaceImage, PixelEncoding};

    fn checker(size: u32, cell: u32) -> FaceImage {
        let mut data = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                data.push(if (x / cell + y / cell) % 2 == 0 { 220 } else { 30 });
            }
        }
        FaceImage::new(size, size, PixelEncoding::Gray8, data).unwrap()
    }

    fn full(size: u32) -> BoundingBox {
        BoundingBox { x: 0.0, y: 0.0, width: size as f32, height: size as f32, confidence: 1.0 }
    }

    #[test]
    fn test_output_is_unit_length() {
        let img = checker(64, 8);
        let bbox = full(64);
        let e = ThumbnailExtractor::new()
            .extract(&FaceRegion { image: &img, bbox: &bbox })
            .unwrap();
        assert_eq!(e.dimension(), 256);
        let norm: f32 = e.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert_eq!(e.model_version.as_deref(), Some("thumb16"));
    }

    #[test]
    fn test_same_image_same_embedding() {
        let img = checker(64, 8);
        let bbox = full(64);
        let mut ex = ThumbnailExtractor::new();
        let a = ex.extract(&FaceRegion { image: &img, bbox: &bbox }).unwrap();
        let b = ex.extract(&FaceRegion { image: &img, bbox: &bbox }).unwrap();
        assert_eq!(a.euclidean_distance(&b).unwrap(), 0.0);
    }

    #[test]
    fn test_different_patterns_are_far_apart() {
        let fine = checker(64, 4);
        let coarse = checker(64, 32);
        let bbox = full(64);
        let mut ex = ThumbnailExtractor::new();
        let a = ex.extract(&FaceRegion { image: &fine, bbox: &bbox }).unwrap();
        let b = ex.extract(&FaceRegion { image: &coarse, bbox: &bbox }).unwrap();
        assert!(a.euclidean_distance(&b).unwrap() > 0.5);
    }

    #[test]
    fn test_region_outside_image() {
        let img = checker(16, 4);
        let bbox = BoundingBox { x: 40.0, y: 40.0, width: 5.0, height: 5.0, confidence: 1.0 };
        let err = ThumbnailExtractor::new()
            .extract(&FaceRegion { image: &img, bbox: &bbox })
            .unwrap_err();
        assert!(matches!(err, ExtractorError::EmptyRegion));
    }
}
