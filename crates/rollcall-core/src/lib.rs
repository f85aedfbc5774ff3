//! rollcall-core — face identity matching and attendance reconciliation.
//!
//! Faces go through a [`FacePipeline`] (detector plus embedding extractor),
//! are matched against a [`Gallery`] snapshot by a [`Matcher`], and accepted
//! identities are written to the [`Ledger`]. Persistence sits behind the
//! [`GalleryStore`] and [`LedgerStore`] traits.

pub mod backends;
pub mod clock;
pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod session;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use extractor::{EmbeddingExtractor, ExtractorError, ExtractorInfo, FaceDetector, FacePipeline};
pub use gallery::{EnrollmentError, Gallery, GallerySnapshot, Identity, IdentitySummary, LoadReport};
pub use ledger::{
    AttendanceRecord, AttendanceStatus, DaySummary, IdentityTally, Ledger, LedgerError,
    ReconcileOutcome, Submission,
};
pub use matcher::{EuclideanMatcher, MatchCandidate, MatchOutcome, Matcher};
pub use session::{FrameReport, RecognitionSession};
pub use store::{GalleryStore, LedgerStore, MemoryStore, StoreError, StoredIdentity, StoredReference};
pub use types::{BoundingBox, DimensionMismatch, Embedding, FaceImage, FaceRegion, PixelEncoding};
