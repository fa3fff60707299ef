use anyhow::{Context, Result};
use rollcall_core::RecognitionService;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusType, Config};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    let models = config.model_paths();
    tracing::info!(
        detector = %models.detector.display(),
        embedding = %models.embedding.display(),
        store = %config.store_dir.display(),
        "loading models"
    );

    // Missing models or an unwritable store are fatal.
    let service = RecognitionService::load(&models, &config.store_dir, config.recognition)
        .context("initializing recognition service")?;
    let engine = engine::spawn_engine(service, config.queue_depth, config.inference_timeout())?;

    let builder = match config.bus {
        BusType::System => zbus::connection::Builder::system()?,
        BusType::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RollcallService::new(engine, config.clone()))?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
