use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bounding box for a detected face, in source image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    /// Clamp the box to an image of the given size, returning integer
    /// `(x, y, width, height)`. `None` if nothing of the box remains.
    pub fn clamped(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(image_width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(image_height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Two embeddings of different length were compared.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Face embedding vector produced by one extractor version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: Some(model_version.into()),
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two embeddings of equal dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> Result<f32, DimensionMismatch> {
        if self.values.len() != other.values.len() {
            return Err(DimensionMismatch {
                expected: self.values.len(),
                actual: other.values.len(),
            });
        }
        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }

    /// Serialize the vector as little-endian `f32` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode bytes written by [`to_bytes`](Self::to_bytes).
    ///
    /// Returns `None` for empty input or a length that is not a multiple of 4.
    pub fn from_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }

    /// Scale to unit length. Zero vectors are returned unchanged.
    pub fn l2_normalized(mut self) -> Self {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            self.values.iter_mut().for_each(|x| *x /= norm);
        }
        self
    }
}

/// Color layout of a [`FaceImage`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelEncoding {
    Gray8,
    Rgb8,
    Bgr8,
}

impl PixelEncoding {
    pub fn channels(self) -> usize {
        match self {
            PixelEncoding::Gray8 => 1,
            PixelEncoding::Rgb8 | PixelEncoding::Bgr8 => 3,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pixel buffer has {actual} bytes, expected {expected} for {width}x{height} {encoding:?}")]
pub struct InvalidImage {
    pub width: u32,
    pub height: u32,
    pub encoding: PixelEncoding,
    pub expected: usize,
    pub actual: usize,
}

/// An owned, packed pixel buffer handed to the core by the capture layer.
#[derive(Debug, Clone)]
pub struct FaceImage {
    width: u32,
    height: u32,
    encoding: PixelEncoding,
    data: Vec<u8>,
}

impl FaceImage {
    pub fn new(
        width: u32,
        height: u32,
        encoding: PixelEncoding,
        data: Vec<u8>,
    ) -> Result<Self, InvalidImage> {
        let expected = width as usize * height as usize * encoding.channels();
        if data.len() != expected {
            return Err(InvalidImage {
                width,
                height,
                encoding,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            encoding,
            data,
        })
    }

    pub fn from_dynamic(image: &image::DynamicImage) -> Self {
        let rgb = image.to_rgb8();
        Self {
            width: rgb.width(),
            height: rgb.height(),
            encoding: PixelEncoding::Rgb8,
            data: rgb.into_raw(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn encoding(&self) -> PixelEncoding {
        self.encoding
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Convert to an RGB image regardless of the source encoding.
    pub fn to_rgb(&self) -> image::RgbImage {
        let rgb: Vec<u8> = match self.encoding {
            PixelEncoding::Rgb8 => self.data.clone(),
            PixelEncoding::Bgr8 => self
                .data
                .chunks_exact(3)
                .flat_map(|p| [p[2], p[1], p[0]])
                .collect(),
            PixelEncoding::Gray8 => self.data.iter().flat_map(|&y| [y, y, y]).collect(),
        };
        // Length was validated at construction.
        image::RgbImage::from_raw(self.width, self.height, rgb)
            .unwrap_or_else(|| image::RgbImage::new(self.width, self.height))
    }
}

/// A detected face: the bounding box plus the frame it was found in.
#[derive(Debug, Clone, Copy)]
pub struct FaceRegion<'a> {
    pub image: &'a FaceImage,
    pub bbox: &'a BoundingBox,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = emb(&[0.3, -1.2, 4.0]);
        assert_eq!(a.euclidean_distance(&a).unwrap(), 0.0);
    }

    #[test]
    fn test_distance_non_negative_and_symmetric() {
        let a = emb(&[1.0, 2.0, 3.0]);
        let b = emb(&[-1.0, 0.5, 9.0]);
        let ab = a.euclidean_distance(&b).unwrap();
        let ba = b.euclidean_distance(&a).unwrap();
        assert!(ab >= 0.0);
        assert!((ab - ba).abs() < 1e-6);
    }

    #[test]
    fn test_distance_three_four_five() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch_is_error() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        let err = a.euclidean_distance(&b).unwrap_err();
        assert_eq!(err, DimensionMismatch { expected: 2, actual: 3 });
    }

    #[test]
    fn test_bytes_roundtrip_keeps_version() {
        let a = Embedding::new(vec![0.25, -3.5, 1e-7], "thumb16");
        let b = Embedding::from_bytes(&a.to_bytes(), a.model_version.clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        assert!(Embedding::from_bytes(&[], None).is_none());
        assert!(Embedding::from_bytes(&[0, 1, 2], None).is_none());
    }

    #[test]
    fn test_l2_normalized() {
        let a = emb(&[3.0, 4.0]).l2_normalized();
        assert!((a.values[0] - 0.6).abs() < 1e-6);
        assert!((a.values[1] - 0.8).abs() < 1e-6);
        let zero = emb(&[0.0, 0.0]).l2_normalized();
        assert_eq!(zero.values, vec![0.0, 0.0]);
    }

    #[test]
    fn test_face_image_validates_length() {
        assert!(FaceImage::new(2, 2, PixelEncoding::Rgb8, vec![0; 12]).is_ok());
        let err = FaceImage::new(2, 2, PixelEncoding::Rgb8, vec![0; 4]).unwrap_err();
        assert_eq!(err.expected, 12);
        assert_eq!(err.actual, 4);
    }

    #[test]
    fn test_bgr_to_rgb_swaps_channels() {
        let img = FaceImage::new(1, 1, PixelEncoding::Bgr8, vec![10, 20, 30]).unwrap();
        let rgb = img.to_rgb();
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
    }

    #[test]
    fn test_gray_to_rgb_replicates() {
        let img = FaceImage::new(1, 1, PixelEncoding::Gray8, vec![77]).unwrap();
        assert_eq!(img.to_rgb().get_pixel(0, 0).0, [77, 77, 77]);
    }

    #[test]
    fn test_bbox_clamped() {
        let b = BoundingBox { x: -5.0, y: 2.0, width: 20.0, height: 100.0, confidence: 0.9 };
        assert_eq!(b.clamped(10, 50), Some((0, 2, 10, 48)));
        let outside = BoundingBox { x: 60.0, y: 0.0, width: 5.0, height: 5.0, confidence: 0.9 };
        assert_eq!(outside.clamped(10, 10), None);
    }
}
