use crate::engine::EngineHandle;
use chrono::{NaiveDate, NaiveTime};
use rollcall_core::ledger::{parse_date, parse_time};
use rollcall_core::{Embedding, ExtractorInfo, Gallery, Ledger, LedgerError, Submission};
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// Static facts reported by `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub extractor: String,
    pub detector: String,
    pub model_version: String,
    pub dimension: usize,
    pub match_threshold: f32,
    pub late_after: Option<NaiveTime>,
    pub db_path: PathBuf,
}

impl ServiceInfo {
    pub fn new(config: &crate::config::Config, extractor: &ExtractorInfo) -> Self {
        Self {
            extractor: config.extractor.to_string(),
            detector: config.detector.to_string(),
            model_version: extractor.model_version.clone(),
            dimension: extractor.dimension,
            match_threshold: config.match_threshold,
            late_after: config.late_after,
            db_path: config.db_path.clone(),
        }
    }
}

fn failed(err: impl Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

/// Run a storage-backed call off the async executor.
async fn blocking<T, E>(f: impl FnOnce() -> Result<T, E> + Send + 'static) -> zbus::fdo::Result<T>
where
    T: Send + 'static,
    E: Display + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(failed)?
        .map_err(failed)
}

/// Empty or `today` means the ledger's current date.
fn resolve_date(ledger: &Ledger, raw: &str) -> Result<NaiveDate, LedgerError> {
    match raw.trim() {
        "" | "today" => Ok(ledger.today()),
        other => parse_date(other),
    }
}

fn parse_submissions(json: &str) -> Result<Vec<Submission>, String> {
    serde_json::from_str(json).map_err(|e| format!("invalid submissions JSON: {e}"))
}

fn require_absolute(image_path: &str) -> zbus::fdo::Result<PathBuf> {
    let path = Path::new(image_path);
    if !path.is_absolute() {
        return Err(zbus::fdo::Error::InvalidArgs(format!(
            "image path must be absolute: {image_path}"
        )));
    }
    Ok(path.to_path_buf())
}

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Every method replies with a JSON document.
pub struct AttendanceService {
    engine: EngineHandle,
    gallery: Arc<Gallery>,
    ledger: Arc<Ledger>,
    info: ServiceInfo,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        gallery: Arc<Gallery>,
        ledger: Arc<Ledger>,
        info: ServiceInfo,
    ) -> Self {
        Self {
            engine,
            gallery,
            ledger,
            info,
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll a new identity from a single-face image.
    async fn enroll(&self, identity_id: &str, name: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, image = image_path, "enroll requested");
        let path = require_absolute(image_path)?;
        let identity = self
            .engine
            .enroll(identity_id, name, &path)
            .await
            .map_err(failed)?;
        to_json(&identity.summary())
    }

    /// Enroll from a serialized embedding (little-endian f32).
    async fn enroll_embedding(
        &self,
        identity_id: &str,
        name: &str,
        embedding: Vec<u8>,
        model_version: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, bytes = embedding.len(), "enroll_embedding requested");
        let version = (!model_version.is_empty()).then(|| model_version.to_string());
        let embedding = Embedding::from_bytes(&embedding, version).ok_or_else(|| {
            zbus::fdo::Error::InvalidArgs("embedding must be a non-empty sequence of f32".into())
        })?;
        let gallery = Arc::clone(&self.gallery);
        let (id, name) = (identity_id.to_string(), name.to_string());
        let identity = blocking(move || gallery.enroll_embedding(&id, &name, embedding, None)).await?;
        to_json(&identity.summary())
    }

    /// Add a reference from a new image, or replace all references with it.
    async fn reenroll(&self, identity_id: &str, image_path: &str, replace: bool) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, replace, "reenroll requested");
        let path = require_absolute(image_path)?;
        let identity = self
            .engine
            .reenroll(identity_id, &path, replace)
            .await
            .map_err(failed)?;
        to_json(&identity.summary())
    }

    /// Remove an identity together with its attendance history.
    async fn remove_identity(&self, identity_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, "remove_identity requested");
        let gallery = Arc::clone(&self.gallery);
        let id = identity_id.to_string();
        let removed = blocking(move || gallery.remove(&id)).await?;
        to_json(&removed.summary())
    }

    /// Change an identity's display name.
    async fn rename_identity(&self, identity_id: &str, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity = identity_id, "rename_identity requested");
        let gallery = Arc::clone(&self.gallery);
        let (id, name) = (identity_id.to_string(), name.to_string());
        let identity = blocking(move || gallery.rename(&id, &name)).await?;
        to_json(&identity.summary())
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.gallery.list())
    }

    /// Match every face in an image and check in recognised identities.
    async fn recognize(&self, image_path: &str) -> zbus::fdo::Result<String> {
        let path = require_absolute(image_path)?;
        let report = self.engine.recognize(&path).await.map_err(failed)?;
        tracing::info!(
            faces = report.faces.len(),
            check_ins = report.check_ins.len(),
            "recognize completed"
        );
        to_json(&report)
    }

    /// Merge a JSON array of submissions into the given date.
    async fn reconcile(&self, date: &str, submissions_json: &str) -> zbus::fdo::Result<String> {
        let submissions = parse_submissions(submissions_json).map_err(zbus::fdo::Error::InvalidArgs)?;
        let date = resolve_date(&self.ledger, date).map_err(failed)?;
        tracing::info!(%date, submissions = submissions.len(), "reconcile requested");
        let ledger = Arc::clone(&self.ledger);
        let outcome = blocking(move || ledger.reconcile(date, &submissions)).await?;
        to_json(&outcome)
    }

    /// Stamp a check-out; an empty `time` means now.
    async fn check_out(&self, identity_id: &str, date: &str, time: &str) -> zbus::fdo::Result<String> {
        let date = resolve_date(&self.ledger, date).map_err(failed)?;
        let time = match time.trim() {
            "" => None,
            t => Some(parse_time(t).map_err(failed)?),
        };
        let ledger = Arc::clone(&self.ledger);
        let id = identity_id.to_string();
        let record = blocking(move || ledger.check_out(&id, date, time)).await?;
        to_json(&record)
    }

    /// All records and the summary for one date.
    async fn day(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = resolve_date(&self.ledger, date).map_err(failed)?;
        let ledger = Arc::clone(&self.ledger);
        let (records, summary) = blocking(move || {
            Ok::<_, LedgerError>((ledger.day(date)?, ledger.day_summary(date)?))
        })
        .await?;
        to_json(&serde_json::json!({
            "date": date,
            "summary": summary,
            "records": records,
        }))
    }

    /// Records for one identity between two dates, inclusive.
    async fn history(&self, identity_id: &str, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let from = parse_date(from).map_err(failed)?;
        let to = resolve_date(&self.ledger, to).map_err(failed)?;
        let ledger = Arc::clone(&self.ledger);
        let id = identity_id.to_string();
        let records = blocking(move || ledger.history(&id, from, to)).await?;
        to_json(&records)
    }

    /// Day summary plus per-identity tallies over all recorded days.
    async fn report(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = resolve_date(&self.ledger, date).map_err(failed)?;
        let ledger = Arc::clone(&self.ledger);
        let (summary, tallies) = blocking(move || {
            Ok::<_, LedgerError>((ledger.day_summary(date)?, ledger.tallies()?))
        })
        .await?;
        to_json(&serde_json::json!({
            "date": date,
            "summary": summary,
            "tallies": tallies,
        }))
    }

    /// Administrative removal of a single attendance record.
    async fn remove_record(&self, identity_id: &str, date: &str) -> zbus::fdo::Result<bool> {
        let date = parse_date(date).map_err(failed)?;
        tracing::info!(identity = identity_id, %date, "remove_record requested");
        let ledger = Arc::clone(&self.ledger);
        let id = identity_id.to_string();
        blocking(move || ledger.remove_record(&id, date)).await?;
        Ok(true)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let snapshot = self.gallery.snapshot();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "extractor": self.info,
            "identities": snapshot.identities().len(),
            "references": snapshot.reference_count(),
            "gallery_dimension": snapshot.dimension(),
            "today": self.ledger.today(),
        }))
    }
}
