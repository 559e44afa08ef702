//! Application state
//!
//! Holds all shared components and configuration

use crate::plate_detect::PlateDetector;
use crate::scale_manager::ScaleManager;
use crate::station_directory::StationDirectory;
use crate::stream_broadcaster::{StreamBroadcaster, StreamSettings};
use crate::weight_hub::WeightHub;
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// JSON station list supplied by the persistence layer
    pub stations_file: PathBuf,
    /// Operator flag enabling the demo scale simulation
    pub demo_mode: bool,
    /// Video transcoder output shaping
    pub stream: StreamSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            stations_file: std::env::var("STATIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("stations.json")),
            demo_mode: std::env::var("DEMO_MODE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            stream: StreamSettings::default(),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Desired-state station list
    pub directory: Arc<StationDirectory>,
    /// Weight event pub/sub
    pub hub: Arc<WeightHub>,
    /// Serial scale monitors
    pub scales: Arc<ScaleManager>,
    /// Shared camera capture pipelines
    pub broadcaster: Arc<StreamBroadcaster>,
    /// Plate recognition collaborator
    pub detector: Arc<dyn PlateDetector>,
}
