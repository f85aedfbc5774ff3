//! One recognition pass over a frame: faces → embeddings → matches → check-ins.

use crate::extractor::FacePipeline;
use crate::gallery::Gallery;
use crate::ledger::{AttendanceRecord, Ledger};
use crate::matcher::{MatchOutcome, Matcher};
use crate::types::{BoundingBox, FaceImage};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Match decision for one face in a frame.
#[derive(Debug, Clone, Serialize)]
pub struct FaceResult {
    pub bbox: BoundingBox,
    pub outcome: MatchOutcome,
}

/// Everything a single frame produced. A frame that fails detection or
/// yields no faces is an empty report, never an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrameReport {
    pub faces: Vec<FaceResult>,
    /// Records created by this frame (first sighting of the day).
    pub check_ins: Vec<AttendanceRecord>,
    /// Detector failure for this frame, if any.
    pub error: Option<String>,
}

impl FrameReport {
    /// Accepted identities, one entry per matched face.
    pub fn matched_ids(&self) -> Vec<&str> {
        self.faces
            .iter()
            .filter_map(|f| f.outcome.accepted())
            .map(|c| c.identity_id.as_str())
            .collect()
    }
}

pub struct RecognitionSession {
    gallery: Arc<Gallery>,
    ledger: Arc<Ledger>,
    matcher: Box<dyn Matcher + Send + Sync>,
    threshold: f32,
}

impl RecognitionSession {
    pub fn new(
        gallery: Arc<Gallery>,
        ledger: Arc<Ledger>,
        matcher: Box<dyn Matcher + Send + Sync>,
        threshold: f32,
    ) -> Self {
        Self {
            gallery,
            ledger,
            matcher,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Match every face in `image` without touching the ledger.
    pub fn identify(&self, pipeline: &mut FacePipeline, image: &FaceImage) -> FrameReport {
        let faces = match pipeline.embed_all(image) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "frame skipped: detection failed");
                return FrameReport {
                    error: Some(e.to_string()),
                    ..FrameReport::default()
                };
            }
        };

        // One snapshot for the whole frame.
        let snapshot = self.gallery.snapshot();
        let faces: Vec<FaceResult> = faces
            .into_iter()
            .map(|(bbox, probe)| FaceResult {
                outcome: self.matcher.best_match(&probe, &snapshot, self.threshold),
                bbox,
            })
            .collect();

        for face in &faces {
            match &face.outcome {
                MatchOutcome::EmptyGallery => {
                    tracing::warn!("face detected but the gallery is empty");
                }
                MatchOutcome::DimensionMismatch { probe, gallery } => {
                    tracing::warn!(probe, gallery, "probe dimension does not match gallery");
                }
                MatchOutcome::Matched(c) => {
                    tracing::debug!(identity = %c.identity_id, distance = c.distance, "face matched");
                }
                MatchOutcome::Rejected { nearest } => {
                    tracing::debug!(
                        nearest = nearest.as_ref().map(|c| c.distance),
                        "face rejected"
                    );
                }
            }
        }

        FrameReport {
            faces,
            ..FrameReport::default()
        }
    }

    /// Match every face and record a sighting for each accepted identity.
    pub fn process_frame(
        &self,
        pipeline: &mut FacePipeline,
        image: &FaceImage,
        at: NaiveDateTime,
    ) -> FrameReport {
        let mut report = self.identify(pipeline, image);

        let accepted: Vec<String> = {
            let mut seen = HashSet::new();
            report
                .matched_ids()
                .into_iter()
                .filter(|id| seen.insert(*id))
                .map(str::to_string)
                .collect()
        };

        for identity_id in accepted {
            match self.ledger.record_sighting(&identity_id, at) {
                Ok(Some(record)) => report.check_ins.push(record),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(identity = %identity_id, error = %e, "sighting not recorded");
                }
            }
        }
        report
    }

    /// [`process_frame`](Self::process_frame) stamped with the ledger's clock.
    pub fn recognize(&self, pipeline: &mut FacePipeline, image: &FaceImage) -> FrameReport {
        self.process_frame(pipeline, image, self.ledger.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::thumbnail::ThumbnailExtractor;
    use crate::clock::ManualClock;
    use crate::extractor::testing::{bbox, FixedDetector};
    use crate::extractor::{ExtractorError, FaceDetector};
    use crate::ledger::AttendanceStatus;
    use crate::matcher::EuclideanMatcher;
    use crate::store::MemoryStore;
    use crate::types::PixelEncoding;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    /// 64×32 frame: left half a horizontal gradient, right half vertical stripes.
    fn two_face_frame() -> FaceImage {
        let (w, h) = (64u32, 32u32);
        let mut data = Vec::with_capacity((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let v = if x < 32 {
                    (x * 8) as u8
                } else if (y / 4) % 2 == 0 {
                    230
                } else {
                    20
                };
                data.push(v);
            }
        }
        FaceImage::new(w, h, PixelEncoding::Gray8, data).unwrap()
    }

    fn pipeline(boxes: Vec<BoundingBox>) -> FacePipeline {
        FacePipeline::new(
            Box::new(FixedDetector(boxes)),
            Box::new(ThumbnailExtractor::new()),
        )
    }

    struct Setup {
        gallery: Arc<Gallery>,
        ledger: Arc<Ledger>,
        session: RecognitionSession,
    }

    fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        let (gallery, _) = Gallery::load(store.clone()).unwrap();
        let gallery = Arc::new(gallery);
        let clock = Arc::new(ManualClock::new(noon()));
        let ledger = Arc::new(Ledger::new(store, gallery.clone(), clock));
        let session = RecognitionSession::new(
            gallery.clone(),
            ledger.clone(),
            Box::new(EuclideanMatcher::default()),
            0.6,
        );
        Setup { gallery, ledger, session }
    }

    #[test]
    fn test_enroll_then_recognise_same_image() {
        let s = setup();
        let frame = two_face_frame();
        let left = bbox(0.0, 0.0, 32.0, 32.0);
        s.gallery
            .enroll(&mut pipeline(vec![left.clone()]), "S001", "Alice", &frame, None)
            .unwrap();

        let report = s.session.process_frame(&mut pipeline(vec![left.clone()]), &frame, noon());
        assert_eq!(report.matched_ids(), vec!["S001"]);
        assert_eq!(report.check_ins.len(), 1);
        assert_eq!(report.check_ins[0].status, AttendanceStatus::Present);

        let again = s.session.process_frame(&mut pipeline(vec![left.clone()]), &frame, noon());
        assert_eq!(again.matched_ids(), vec!["S001"]);
        assert!(again.check_ins.is_empty());
    }

    #[test]
    fn test_faces_matched_independently() {
        let s = setup();
        let frame = two_face_frame();
        let left = bbox(0.0, 0.0, 32.0, 32.0);
        let right = bbox(32.0, 0.0, 32.0, 32.0);
        s.gallery
            .enroll(&mut pipeline(vec![left.clone()]), "S001", "Alice", &frame, None)
            .unwrap();

        let report = s
            .session
            .process_frame(&mut pipeline(vec![left.clone(), right]), &frame, noon());
        assert_eq!(report.faces.len(), 2);
        assert!(report.faces[0].outcome.accepted().is_some());
        assert!(matches!(report.faces[1].outcome, MatchOutcome::Rejected { .. }));
    }

    #[test]
    fn test_duplicate_match_in_frame_checks_in_once() {
        let s = setup();
        let frame = two_face_frame();
        let left = bbox(0.0, 0.0, 32.0, 32.0);
        s.gallery
            .enroll(&mut pipeline(vec![left.clone()]), "S001", "Alice", &frame, None)
            .unwrap();

        let report = s
            .session
            .process_frame(&mut pipeline(vec![left.clone(), left]), &frame, noon());
        assert_eq!(report.matched_ids(), vec!["S001", "S001"]);
        assert_eq!(report.check_ins.len(), 1);
        assert_eq!(s.ledger.day(noon().date()).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_gallery_reported_per_face() {
        let s = setup();
        let report = s.session.process_frame(
            &mut pipeline(vec![bbox(0.0, 0.0, 32.0, 32.0)]),
            &two_face_frame(),
            noon(),
        );
        assert_eq!(report.faces[0].outcome, MatchOutcome::EmptyGallery);
        assert!(report.check_ins.is_empty());
    }

    struct BrokenDetector;

    impl FaceDetector for BrokenDetector {
        fn detect(&mut self, _image: &FaceImage) -> Result<Vec<BoundingBox>, ExtractorError> {
            Err(ExtractorError::InferenceFailed("sensor glitch".into()))
        }
    }

    #[test]
    fn test_detector_failure_is_an_empty_frame() {
        let s = setup();
        let mut broken = FacePipeline::new(Box::new(BrokenDetector), Box::new(ThumbnailExtractor::new()));
        let report = s.session.process_frame(&mut broken, &two_face_frame(), noon());
        assert!(report.faces.is_empty());
        assert!(report.error.unwrap().contains("sensor glitch"));
    }
}
