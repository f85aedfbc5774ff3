use crate::config::{Config, DetectorKind, ExtractorKind};
use rollcall_core::backends::{ArcFaceExtractor, ScrfdDetector, ThumbnailExtractor, WholeFrameDetector};
use rollcall_core::{
    EmbeddingExtractor, EnrollmentError, ExtractorError, FaceDetector, FaceImage, FacePipeline,
    FrameReport, Gallery, Identity, RecognitionSession,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to read image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("model loading failed: {0}")]
    Model(#[from] ExtractorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity_id: String,
        name: String,
        image_path: PathBuf,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    Reenroll {
        identity_id: String,
        image_path: PathBuf,
        replace: bool,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
    Recognize {
        image_path: PathBuf,
        reply: oneshot::Sender<Result<FrameReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Enroll a new identity from the single face in `image_path`.
    pub async fn enroll(
        &self,
        identity_id: &str,
        name: &str,
        image_path: &Path,
    ) -> Result<Identity, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            identity_id: identity_id.to_string(),
            name: name.to_string(),
            image_path: image_path.to_path_buf(),
            reply,
        })
        .await
    }

    /// Add (or, with `replace`, swap in) a reference from `image_path`.
    pub async fn reenroll(
        &self,
        identity_id: &str,
        image_path: &Path,
        replace: bool,
    ) -> Result<Identity, EngineError> {
        self.request(|reply| EngineRequest::Reenroll {
            identity_id: identity_id.to_string(),
            image_path: image_path.to_path_buf(),
            replace,
            reply,
        })
        .await
    }

    /// Match every face in `image_path` and record first sightings.
    pub async fn recognize(&self, image_path: &Path) -> Result<FrameReport, EngineError> {
        self.request(|reply| EngineRequest::Recognize {
            image_path: image_path.to_path_buf(),
            reply,
        })
        .await
    }
}

/// Load the detector and extractor named by the configuration. Fails fast
/// when a required model file is missing.
pub fn build_pipeline(config: &Config) -> Result<FacePipeline, EngineError> {
    let detector: Box<dyn FaceDetector> = match config.detector {
        DetectorKind::Scrfd => {
            let path = config.scrfd_model_path();
            let detector = ScrfdDetector::load(&path, config.detection_confidence)?;
            tracing::info!(path = %path.display(), "SCRFD detector loaded");
            Box::new(detector)
        }
        DetectorKind::WholeFrame => {
            tracing::info!("whole-frame detector: images are treated as face crops");
            Box::new(WholeFrameDetector)
        }
    };

    let extractor: Box<dyn EmbeddingExtractor> = match config.extractor {
        ExtractorKind::Arcface => {
            let path = config.arcface_model_path();
            let extractor = ArcFaceExtractor::load(&path)?;
            tracing::info!(path = %path.display(), "ArcFace extractor loaded");
            Box::new(extractor)
        }
        ExtractorKind::Thumbnail => Box::new(ThumbnailExtractor::new()),
    };

    Ok(FacePipeline::new(detector, extractor))
}

/// Spawn the engine on a dedicated OS thread that owns `pipeline`.
pub fn spawn_engine(
    mut pipeline: FacePipeline,
    gallery: Arc<Gallery>,
    session: Arc<RecognitionSession>,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        identity_id,
                        name,
                        image_path,
                        reply,
                    } => {
                        let result = load_image(&image_path).and_then(|image| {
                            Ok(gallery.enroll(
                                &mut pipeline,
                                &identity_id,
                                &name,
                                &image,
                                Some(&*image_path.to_string_lossy()),
                            )?)
                        });
                        let _ = reply.send(result);
                    }
                    EngineRequest::Reenroll {
                        identity_id,
                        image_path,
                        replace,
                        reply,
                    } => {
                        let result = load_image(&image_path).and_then(|image| {
                            Ok(gallery.add_reference(
                                &mut pipeline,
                                &identity_id,
                                &image,
                                Some(&*image_path.to_string_lossy()),
                                replace,
                            )?)
                        });
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { image_path, reply } => {
                        let result = load_image(&image_path)
                            .map(|image| session.recognize(&mut pipeline, &image));
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn load_image(path: &Path) -> Result<FaceImage, EngineError> {
    let image = image::open(path).map_err(|source| EngineError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(FaceImage::from_dynamic(&image))
}
