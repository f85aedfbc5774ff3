//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Takes a square crop around the detected box, resizes it to 112×112 and
//! produces a 512-dimensional L2-normalised embedding (w600k_r50 model).

use crate::extractor::{check_output, EmbeddingExtractor, ExtractorError, ExtractorInfo};
use crate::types::{Embedding, FaceRegion};
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric normalization, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Fraction of the box size added on every side before cropping.
const CROP_MARGIN: f32 = 0.1;

pub struct ArcFaceExtractor {
    session: Session,
}

impl ArcFaceExtractor {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ExtractorError> {
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Square crop (with margin) around the box, resized to the model input.
    fn crop(region: &FaceRegion<'_>) -> Result<image::RgbImage, ExtractorError> {
        let b = region.bbox;
        let side = b.width.max(b.height) * (1.0 + 2.0 * CROP_MARGIN);
        let square = crate::types::BoundingBox {
            x: b.x + b.width / 2.0 - side / 2.0,
            y: b.y + b.height / 2.0 - side / 2.0,
            width: side,
            height: side,
            confidence: b.confidence,
        };
        let image = region.image;
        let (x, y, w, h) = square
            .clamped(image.width(), image.height())
            .ok_or(ExtractorError::EmptyRegion)?;
        let rgb = image.to_rgb();
        let crop = imageops::crop_imm(&rgb, x, y, w, h).to_image();
        Ok(imageops::resize(
            &crop,
            ARCFACE_INPUT_SIZE,
            ARCFACE_INPUT_SIZE,
            FilterType::Triangle,
        ))
    }

    /// Convert a 112×112 RGB crop into a NCHW float tensor.
    fn preprocess(face: &image::RgbImage) -> Array4<f32> {
        let size = ARCFACE_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

impl EmbeddingExtractor for ArcFaceExtractor {
    fn info(&self) -> ExtractorInfo {
        ExtractorInfo {
            dimension: ARCFACE_EMBEDDING_DIM,
            model_version: ARCFACE_MODEL_VERSION.to_string(),
        }
    }

    fn extract(&mut self, region: &FaceRegion<'_>) -> Result<Embedding, ExtractorError> {
        let face = Self::crop(region)?;
        let input = Self::preprocess(&face);

        let raw: Vec<f32> = {
            let outputs = self
                .session
                .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            let (_, raw_data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;
            raw_data.to_vec()
        };
        check_output(&self.info(), &raw)?;

        Ok(Embedding::new(raw, ARCFACE_MODEL_VERSION).l2_normalized())
    }
}
