//! Weighbridge Telemetry Server Library
//!
//! Device telemetry and stream broadcast core for weighbridge operations.
//!
//! ## Architecture
//!
//! 1. StationDirectory - desired-state station configuration
//! 2. ScaleManager - reconnecting serial monitors, one per enabled station
//! 3. WeightHub - pub/sub fan-out of live weight events
//! 4. StreamBroadcaster - shared camera capture pipelines
//! 5. PlateDetector - capture-and-detect collaborator seam
//! 6. WebAPI - SSE/MJPEG consumer adapters and admin endpoints
//!
//! ## Design Principles
//!
//! - Single writer per device: a monitor/capture task owns its handle
//! - Failures degrade to a status flag or stale data, never to a crash
//! - Teardown order: signal stop, release the device, drop the registry entry

pub mod error;
pub mod plate_detect;
pub mod scale_manager;
pub mod state;
pub mod station_directory;
pub mod stream_broadcaster;
pub mod web_api;
pub mod weight_hub;

pub use error::{Error, Result};
pub use state::AppState;
