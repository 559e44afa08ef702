//! Weighbridge Telemetry Server
//!
//! Main entry point: wires the station directory, scale monitors, stream
//! broadcaster and HTTP API together.

use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weighbridge_telemetry::plate_detect::{PlateDetector, SimulatedDetector};
use weighbridge_telemetry::scale_manager::ScaleManager;
use weighbridge_telemetry::state::{AppConfig, AppState};
use weighbridge_telemetry::station_directory::StationDirectory;
use weighbridge_telemetry::stream_broadcaster::StreamBroadcaster;
use weighbridge_telemetry::web_api;
use weighbridge_telemetry::weight_hub::WeightHub;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weighbridge_telemetry=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting weighbridge telemetry server v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        stations_file = %config.stations_file.display(),
        demo_mode = config.demo_mode,
        "Configuration loaded"
    );

    // Initialize components
    let directory = Arc::new(StationDirectory::with_file(config.stations_file.clone()));
    let hub = Arc::new(WeightHub::new());
    let scales = Arc::new(ScaleManager::new(hub.clone()));
    let broadcaster = Arc::new(StreamBroadcaster::new(config.stream.clone()));
    let detector: Arc<dyn PlateDetector> = Arc::new(SimulatedDetector);

    // Initial station load; a missing or broken file is not fatal, the
    // server just starts with no monitors until a reload succeeds
    match directory.reload_from_file().await {
        Ok(stations) => {
            tracing::info!(count = stations.len(), "Station list loaded");
            scales.reload(stations).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Station list not loaded, starting empty");
        }
    }

    if config.demo_mode {
        scales.start_demo_mode().await;
    }

    // Create application state
    let state = AppState {
        config: config.clone(),
        directory,
        hub,
        scales,
        broadcaster,
        detector,
    };

    let app = web_api::create_router(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
