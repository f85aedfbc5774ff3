//! Concrete detector and extractor implementations.

pub mod arcface;
pub mod scrfd;
pub mod thumbnail;
pub mod whole_frame;

pub use arcface::ArcFaceExtractor;
pub use scrfd::ScrfdDetector;
pub use thumbnail::ThumbnailExtractor;
pub use whole_frame::WholeFrameDetector;
