//! In-memory index of enrolled identities.
//!
//! Readers take an [`Arc<GallerySnapshot>`] and keep it for the whole match
//! operation. Writers persist first, then publish a fresh snapshot, so a
//! match in progress never sees a half-applied enrollment.

use crate::extractor::{ExtractorError, FacePipeline, SingleFace};
use crate::store::{GalleryStore, StoreError, StoredIdentity, StoredReference};
use crate::types::{DimensionMismatch, Embedding, FaceImage};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("no face detected in enrollment image")]
    NoFace,
    #[error("{count} faces detected in enrollment image; exactly one is required")]
    AmbiguousFace { count: usize },
    #[error("identity already exists: {0}")]
    DuplicateIdentity(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
    #[error("embedding model version mismatch: gallery uses {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("extractor: {0}")]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for EnrollmentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateIdentity(id) => EnrollmentError::DuplicateIdentity(id),
            StoreError::IdentityNotFound(id) => EnrollmentError::NotFound(id),
            other => EnrollmentError::Storage(other),
        }
    }
}

/// One reference embedding of an identity.
#[derive(Debug, Clone)]
pub struct Reference {
    pub id: Uuid,
    pub embedding: Embedding,
    pub image_path: Option<String>,
}

impl Reference {
    fn to_stored(&self) -> StoredReference {
        StoredReference {
            id: self.id,
            image_path: self.image_path.clone(),
            embedding: Some(self.embedding.to_bytes()),
            model_version: self.embedding.model_version.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: String,
    pub name: String,
    /// Monotonic enrollment order; lower enrolled earlier.
    pub enrollment_seq: u64,
    /// In enrollment order.
    pub references: Vec<Reference>,
}

impl Identity {
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            enrollment_seq: self.enrollment_seq,
            references: self.references.len(),
        }
    }
}

/// Embedding-free view of an identity for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub enrollment_seq: u64,
    pub references: usize,
}

fn validate(identity_id: &str, name: &str) -> Result<(), EnrollmentError> {
    if identity_id.trim().is_empty() || identity_id.trim() != identity_id {
        return Err(EnrollmentError::InvalidIdentity(format!(
            "identifier {identity_id:?} must be non-empty without surrounding whitespace"
        )));
    }
    if name.trim().is_empty() {
        return Err(EnrollmentError::InvalidIdentity(format!(
            "name for {identity_id} must not be empty"
        )));
    }
    Ok(())
}

/// Immutable view of the gallery used by one match operation.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    identities: Vec<Identity>,
}

impl GallerySnapshot {
    fn new(mut identities: Vec<Identity>) -> Self {
        identities.sort_by_key(|i| i.enrollment_seq);
        Self { identities }
    }

    /// Identities in enrollment order.
    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn get(&self, identity_id: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == identity_id)
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.get(identity_id).is_some()
    }

    pub fn reference_count(&self) -> usize {
        self.identities.iter().map(|i| i.references.len()).sum()
    }

    /// Flattened (identity, embedding) pairs, in enrollment order.
    pub fn all_embeddings(&self) -> impl Iterator<Item = (&Identity, &Embedding)> {
        self.identities
            .iter()
            .flat_map(|i| i.references.iter().map(move |r| (i, &r.embedding)))
    }

    /// Dimension shared by every reference, if any reference exists.
    pub fn dimension(&self) -> Option<usize> {
        self.all_embeddings().next().map(|(_, e)| e.dimension())
    }

    fn model_version(&self) -> Option<&str> {
        self.all_embeddings()
            .find_map(|(_, e)| e.model_version.as_deref())
    }

    fn next_seq(&self) -> u64 {
        self.identities
            .iter()
            .map(|i| i.enrollment_seq + 1)
            .max()
            .unwrap_or(1)
    }

    /// Ensure `embedding` can be compared with what is already enrolled.
    fn check_compatible(&self, embedding: &Embedding) -> Result<(), EnrollmentError> {
        if let Some(expected) = self.dimension() {
            if expected != embedding.dimension() {
                return Err(DimensionMismatch {
                    expected,
                    actual: embedding.dimension(),
                }
                .into());
            }
        }
        if let (Some(expected), Some(actual)) =
            (self.model_version(), embedding.model_version.as_deref())
        {
            if expected != actual {
                return Err(EnrollmentError::VersionMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Why a stored reference was left out of the loaded gallery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OmitReason {
    MissingEmbedding,
    Undecodable,
    DimensionMismatch { expected: usize, actual: usize },
    VersionMismatch { expected: String, actual: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadIssue {
    pub identity_id: String,
    pub reference_id: Uuid,
    pub image_path: Option<String>,
    pub reason: OmitReason,
}

/// Summary of [`Gallery::load`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    pub identities: usize,
    pub references: usize,
    pub omitted: Vec<LoadIssue>,
}

pub struct Gallery {
    store: Arc<dyn GalleryStore>,
    current: ArcSwap<GallerySnapshot>,
    /// Serializes read-persist-publish sequences.
    writer: Mutex<()>,
}

impl Gallery {
    /// Rebuild the gallery from storage.
    ///
    /// References whose stored encoding is missing, unreadable or
    /// incompatible with the rest of the gallery are left out and listed in
    /// the report; their identity is still loaded.
    pub fn load(store: Arc<dyn GalleryStore>) -> Result<(Self, LoadReport), StoreError> {
        let stored = store.load_identities()?;
        let mut report = LoadReport::default();
        let mut accepted = GallerySnapshot::default();

        for s in stored {
            let mut identity = Identity {
                id: s.id,
                name: s.name,
                enrollment_seq: s.enrollment_seq,
                references: Vec::with_capacity(s.references.len()),
            };
            for r in s.references {
                match decode_reference(&accepted, &identity, &r) {
                    Ok(embedding) => identity.references.push(Reference {
                        id: r.id,
                        embedding,
                        image_path: r.image_path,
                    }),
                    Err(reason) => {
                        tracing::warn!(
                            identity = %identity.id,
                            reference = %r.id,
                            image = r.image_path.as_deref().unwrap_or("-"),
                            ?reason,
                            "reference embedding omitted from gallery"
                        );
                        report.omitted.push(LoadIssue {
                            identity_id: identity.id.clone(),
                            reference_id: r.id,
                            image_path: r.image_path,
                            reason,
                        });
                    }
                }
            }
            report.references += identity.references.len();
            accepted.identities.push(identity);
        }

        report.identities = accepted.identities.len();
        tracing::info!(
            identities = report.identities,
            references = report.references,
            omitted = report.omitted.len(),
            "gallery loaded"
        );

        let gallery = Self {
            store,
            current: ArcSwap::from_pointee(GallerySnapshot::new(accepted.identities)),
            writer: Mutex::new(()),
        };
        Ok((gallery, report))
    }

    /// The current immutable view. Hold on to it for one whole match.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        self.current.load_full()
    }

    pub fn contains(&self, identity_id: &str) -> bool {
        self.snapshot().contains(identity_id)
    }

    pub fn get(&self, identity_id: &str) -> Option<Identity> {
        self.snapshot().get(identity_id).cloned()
    }

    pub fn list(&self) -> Vec<IdentitySummary> {
        self.snapshot()
            .identities()
            .iter()
            .map(Identity::summary)
            .collect()
    }

    /// Enroll a new identity from a sample image holding exactly one face.
    pub fn enroll(
        &self,
        pipeline: &mut FacePipeline,
        identity_id: &str,
        name: &str,
        sample: &FaceImage,
        image_path: Option<&str>,
    ) -> Result<Identity, EnrollmentError> {
        validate(identity_id, name)?;
        if self.contains(identity_id) {
            return Err(EnrollmentError::DuplicateIdentity(identity_id.to_string()));
        }
        let embedding = single_face(pipeline, sample)?;
        self.enroll_embedding(identity_id, name, embedding, image_path)
    }

    /// Enroll a new identity from an already computed embedding.
    pub fn enroll_embedding(
        &self,
        identity_id: &str,
        name: &str,
        embedding: Embedding,
        image_path: Option<&str>,
    ) -> Result<Identity, EnrollmentError> {
        validate(identity_id, name)?;
        self.mutate(|snapshot| {
            if snapshot.contains(identity_id) {
                return Err(EnrollmentError::DuplicateIdentity(identity_id.to_string()));
            }
            snapshot.check_compatible(&embedding)?;
            let identity = Identity {
                id: identity_id.to_string(),
                name: name.to_string(),
                enrollment_seq: snapshot.next_seq(),
                references: vec![Reference {
                    id: Uuid::new_v4(),
                    embedding,
                    image_path: image_path.map(str::to_string),
                }],
            };
            self.store.insert_identity(&StoredIdentity {
                id: identity.id.clone(),
                name: identity.name.clone(),
                enrollment_seq: identity.enrollment_seq,
                references: identity.references.iter().map(Reference::to_stored).collect(),
            })?;
            tracing::info!(
                identity = %identity.id,
                seq = identity.enrollment_seq,
                "identity enrolled"
            );
            Ok((Some(identity.clone()), identity))
        })
    }

    /// Re-enroll: add one reference from a new sample, or replace all
    /// existing references with it when `replace` is set.
    pub fn add_reference(
        &self,
        pipeline: &mut FacePipeline,
        identity_id: &str,
        sample: &FaceImage,
        image_path: Option<&str>,
        replace: bool,
    ) -> Result<Identity, EnrollmentError> {
        if !self.contains(identity_id) {
            return Err(EnrollmentError::NotFound(identity_id.to_string()));
        }
        let embedding = single_face(pipeline, sample)?;
        self.add_reference_embedding(identity_id, embedding, image_path, replace)
    }

    pub fn add_reference_embedding(
        &self,
        identity_id: &str,
        embedding: Embedding,
        image_path: Option<&str>,
        replace: bool,
    ) -> Result<Identity, EnrollmentError> {
        self.mutate(|snapshot| {
            let mut identity = snapshot
                .get(identity_id)
                .cloned()
                .ok_or_else(|| EnrollmentError::NotFound(identity_id.to_string()))?;

            // A replacement that empties the only populated identity may
            // change the gallery's dimension; otherwise it must match.
            let others_enrolled = snapshot
                .identities()
                .iter()
                .any(|i| i.id != identity_id && !i.references.is_empty());
            if !replace || others_enrolled {
                let peers = GallerySnapshot::new(
                    snapshot
                        .identities()
                        .iter()
                        .filter(|i| !replace || i.id != identity_id)
                        .cloned()
                        .collect(),
                );
                peers.check_compatible(&embedding)?;
            }

            let reference = Reference {
                id: Uuid::new_v4(),
                embedding,
                image_path: image_path.map(str::to_string),
            };
            if replace {
                self.store
                    .replace_references(identity_id, &[reference.to_stored()])?;
                identity.references = vec![reference];
            } else {
                self.store
                    .append_reference(identity_id, &reference.to_stored())?;
                identity.references.push(reference);
            }
            tracing::info!(
                identity = %identity_id,
                references = identity.references.len(),
                replace,
                "identity re-enrolled"
            );
            Ok((Some(identity.clone()), identity))
        })
    }

    pub fn rename(&self, identity_id: &str, name: &str) -> Result<Identity, EnrollmentError> {
        validate(identity_id, name)?;
        self.mutate(|snapshot| {
            let mut identity = snapshot
                .get(identity_id)
                .cloned()
                .ok_or_else(|| EnrollmentError::NotFound(identity_id.to_string()))?;
            self.store.rename_identity(identity_id, name)?;
            identity.name = name.to_string();
            Ok((Some(identity.clone()), identity))
        })
    }

    /// Remove an identity, its references and (through the store) its
    /// attendance records.
    pub fn remove(&self, identity_id: &str) -> Result<Identity, EnrollmentError> {
        self.mutate(|snapshot| {
            let identity = snapshot
                .get(identity_id)
                .cloned()
                .ok_or_else(|| EnrollmentError::NotFound(identity_id.to_string()))?;
            self.store.delete_identity(identity_id)?;
            tracing::info!(identity = %identity_id, "identity removed");
            Ok((None, identity))
        })
    }

    /// Run `f` against the current snapshot under the writer lock. `f`
    /// persists its change and returns the identity to upsert into the next
    /// snapshot (or `None` to drop the one it acted on) along with the result.
    fn mutate(
        &self,
        f: impl FnOnce(&GallerySnapshot) -> Result<(Option<Identity>, Identity), EnrollmentError>,
    ) -> Result<Identity, EnrollmentError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();
        let (upsert, acted_on) = f(&snapshot)?;

        let mut identities: Vec<Identity> = snapshot
            .identities()
            .iter()
            .filter(|i| i.id != acted_on.id)
            .cloned()
            .collect();
        identities.extend(upsert);

        self.current.store(Arc::new(GallerySnapshot::new(identities)));
        Ok(acted_on)
    }
}

fn single_face(pipeline: &mut FacePipeline, sample: &FaceImage) -> Result<Embedding, EnrollmentError> {
    match pipeline.embed_single(sample)? {
        SingleFace::None => Err(EnrollmentError::NoFace),
        SingleFace::Many(count) => Err(EnrollmentError::AmbiguousFace { count }),
        SingleFace::One(_, embedding) => Ok(embedding),
    }
}

fn decode_reference(
    accepted: &GallerySnapshot,
    identity: &Identity,
    stored: &StoredReference,
) -> Result<Embedding, OmitReason> {
    let bytes = stored
        .embedding
        .as_deref()
        .ok_or(OmitReason::MissingEmbedding)?;
    let embedding = Embedding::from_bytes(bytes, stored.model_version.clone())
        .ok_or(OmitReason::Undecodable)?;

    // Compare against everything accepted so far, this identity included.
    let first = accepted
        .all_embeddings()
        .map(|(_, e)| e)
        .chain(identity.references.iter().map(|r| &r.embedding))
        .next();
    if let Some(first) = first {
        if first.dimension() != embedding.dimension() {
            return Err(OmitReason::DimensionMismatch {
                expected: first.dimension(),
                actual: embedding.dimension(),
            });
        }
        if let (Some(expected), Some(actual)) = (
            first.model_version.as_deref(),
            embedding.model_version.as_deref(),
        ) {
            if expected != actual {
                return Err(OmitReason::VersionMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
    }
    Ok(embedding)
}
