//! Detector for inputs that are already face crops.

use crate::extractor::{ExtractorError, FaceDetector};
use crate::types::{BoundingBox, FaceImage};

/// Reports the whole frame as exactly one face.
#[derive(Debug, Default, Clone, Copy)]
pub struct WholeFrameDetector;

impl FaceDetector for WholeFrameDetector {
    fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, ExtractorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: image.width() as f32,
            height: image.height() as f32,
            confidence: 1.0,
        }])
    }
}
