//! Pluggable face detection and embedding extraction.
//!
//! The gallery and matcher only ever see [`Embedding`]s and the
//! [`ExtractorInfo`] that describes them; which backend produced a vector
//! is a configuration choice.

use crate::types::{BoundingBox, DimensionMismatch, Embedding, FaceImage, FaceRegion};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region is empty after clamping to the image")]
    EmptyRegion,
    #[error(transparent)]
    Dimension(#[from] DimensionMismatch),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// What an extractor produces: vector length and version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorInfo {
    pub dimension: usize,
    pub model_version: String,
}

/// Finds faces in a frame.
pub trait FaceDetector: Send {
    /// Detect faces, returning bounding boxes sorted by confidence (highest first).
    fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, ExtractorError>;
}

/// Maps a face region to a fixed-length feature vector.
pub trait EmbeddingExtractor: Send {
    fn info(&self) -> ExtractorInfo;

    fn extract(&mut self, region: &FaceRegion<'_>) -> Result<Embedding, ExtractorError>;
}

/// Checks a freshly extracted vector against what the extractor advertises.
pub(crate) fn check_output(info: &ExtractorInfo, raw: &[f32]) -> Result<(), ExtractorError> {
    if raw.len() != info.dimension {
        return Err(DimensionMismatch {
            expected: info.dimension,
            actual: raw.len(),
        }
        .into());
    }
    Ok(())
}

/// Outcome of looking for exactly one face in an enrollment sample.
#[derive(Debug)]
pub enum SingleFace {
    None,
    Many(usize),
    One(BoundingBox, Embedding),
}

/// One detector plus one extractor, run back to back.
pub struct FacePipeline {
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn EmbeddingExtractor>,
}

impl FacePipeline {
    pub fn new(detector: Box<dyn FaceDetector>, extractor: Box<dyn EmbeddingExtractor>) -> Self {
        Self {
            detector,
            extractor,
        }
    }

    pub fn info(&self) -> ExtractorInfo {
        self.extractor.info()
    }

    pub fn detect(&mut self, image: &FaceImage) -> Result<Vec<BoundingBox>, ExtractorError> {
        self.detector.detect(image)
    }

    /// Embed every detected face independently.
    ///
    /// A face whose extraction fails is logged and skipped; only a detector
    /// failure is returned as an error.
    pub fn embed_all(
        &mut self,
        image: &FaceImage,
    ) -> Result<Vec<(BoundingBox, Embedding)>, ExtractorError> {
        let faces = self.detector.detect(image)?;
        let mut out = Vec::with_capacity(faces.len());
        for (i, bbox) in faces.into_iter().enumerate() {
            let region = FaceRegion { image, bbox: &bbox };
            match self.extractor.extract(&region) {
                Ok(embedding) => out.push((bbox, embedding)),
                Err(e) => {
                    tracing::warn!(face = i, error = %e, "skipping face: embedding failed");
                }
            }
        }
        Ok(out)
    }

    /// Detect and embed a sample that must contain exactly one face.
    pub fn embed_single(&mut self, image: &FaceImage) -> Result<SingleFace, ExtractorError> {
        let mut faces = self.detector.detect(image)?;
        match faces.len() {
            0 => Ok(SingleFace::None),
            1 => {
                let bbox = faces.remove(0);
                let embedding = self.extractor.extract(&FaceRegion {
                    image,
                    bbox: &bbox,
                })?;
                Ok(SingleFace::One(bbox, embedding))
            }
            n => Ok(SingleFace::Many(n)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Deterministic stand-ins for ONNX backends.

    use super::*;

    /// Returns a fixed list of boxes for every frame.
    pub struct FixedDetector(pub Vec<BoundingBox>);

    impl FaceDetector for FixedDetector {
        fn detect(&mut self, _image: &FaceImage) -> Result<Vec<BoundingBox>, ExtractorError> {
            Ok(self.0.clone())
        }
    }

    pub fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{bbox, FixedDetector};
    use super::*;
    use crate::backends::thumbnail::ThumbnailExtractor;
    use crate::types::PixelEncoding;

    fn gradient(width: u32, height: u32) -> FaceImage {
        let data = (0..width * height).map(|i| (i % 251) as u8).collect();
        FaceImage::new(width, height, PixelEncoding::Gray8, data).unwrap()
    }

    #[test]
    fn test_embed_single_counts_faces() {
        let image = gradient(64, 64);

        let mut none = FacePipeline::new(
            Box::new(FixedDetector(vec![])),
            Box::new(ThumbnailExtractor::new()),
        );
        assert!(matches!(none.embed_single(&image).unwrap(), SingleFace::None));

        let mut two = FacePipeline::new(
            Box::new(FixedDetector(vec![bbox(0.0, 0.0, 20.0, 20.0), bbox(30.0, 30.0, 20.0, 20.0)])),
            Box::new(ThumbnailExtractor::new()),
        );
        assert!(matches!(two.embed_single(&image).unwrap(), SingleFace::Many(2)));

        let mut one = FacePipeline::new(
            Box::new(FixedDetector(vec![bbox(0.0, 0.0, 32.0, 32.0)])),
            Box::new(ThumbnailExtractor::new()),
        );
        match one.embed_single(&image).unwrap() {
            SingleFace::One(_, e) => assert_eq!(e.dimension(), one.info().dimension),
            other => panic!("expected one face, got {other:?}"),
        }
    }

    #[test]
    fn test_embed_all_skips_unusable_faces() {
        let image = gradient(64, 64);
        let mut pipeline = FacePipeline::new(
            Box::new(FixedDetector(vec![
                bbox(0.0, 0.0, 32.0, 32.0),
                bbox(500.0, 500.0, 10.0, 10.0),
            ])),
            Box::new(ThumbnailExtractor::new()),
        );
        let faces = pipeline.embed_all(&image).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].0.x, 0.0);
    }

    #[test]
    fn test_check_output_dimension() {
        let info = ExtractorInfo { dimension: 3, model_version: "t".into() };
        assert!(check_output(&info, &[0.0; 3]).is_ok());
        assert!(matches!(
            check_output(&info, &[0.0; 2]),
            Err(ExtractorError::Dimension(DimensionMismatch { expected: 3, actual: 2 }))
        ));
    }
}
