use anyhow::{Context, Result};
use facewhiz_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod registry;

use config::{BusKind, Config};
use dbus_interface::RegistryService;

const BUS_NAME: &str = "org.facewhiz.Registry1";
const OBJECT_PATH: &str = "/org/facewhiz/Registry1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewhizd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        db_path = %config.db_path.display(),
        match_threshold = config.match_threshold,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;
    let registry = registry::spawn_registry(store, config.request_queue, config.match_threshold)?;

    let service = RegistryService::new(registry.clone(), config.db_path.display().to_string());
    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("failed to register {BUS_NAME} on the {:?} bus", config.bus))?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "facewhizd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facewhizd shutting down");

    registry.shutdown().await?;
    Ok(())
}
