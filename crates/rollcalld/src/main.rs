use anyhow::{Context, Result};
use rollcall_core::{EuclideanMatcher, Gallery, Ledger, RecognitionSession, SystemClock};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, ServiceInfo, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db = %config.db_path.display(),
        extractor = %config.extractor,
        detector = %config.detector,
        threshold = config.match_threshold,
        "configuration loaded"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("failed to open database {}", config.db_path.display()))?,
    );

    let (gallery, report) = Gallery::load(store.clone()).context("failed to load gallery")?;
    if !report.omitted.is_empty() {
        tracing::warn!(
            omitted = report.omitted.len(),
            "some references were left out; re-enroll the affected identities"
        );
    }
    let gallery = Arc::new(gallery);

    let ledger = Arc::new(
        Ledger::new(store, gallery.clone(), Arc::new(SystemClock))
            .with_late_after(config.late_after),
    );

    let pipeline = engine::build_pipeline(&config).context("failed to load models")?;
    let extractor = pipeline.info();
    if let Some(dimension) = gallery.snapshot().dimension() {
        if dimension != extractor.dimension {
            tracing::warn!(
                gallery = dimension,
                extractor = extractor.dimension,
                "gallery embeddings do not match the configured extractor; re-enroll required"
            );
        }
    }

    let session = Arc::new(RecognitionSession::new(
        gallery.clone(),
        ledger.clone(),
        Box::new(EuclideanMatcher::default()),
        config.match_threshold,
    ));
    let engine = engine::spawn_engine(pipeline, gallery.clone(), session)?;

    let service = AttendanceService::new(
        engine,
        gallery,
        ledger,
        ServiceInfo::new(&config, &extractor),
    );
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
