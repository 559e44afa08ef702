//! WebAPI - HTTP Endpoints
//!
//! ## Responsibilities
//!
//! - SSE/MJPEG consumer adapters over the shared telemetry state
//! - Remote scale bridge ingestion
//! - Station list administration
//!
//! Authorization happens outside this core: an outer layer may attach a
//! [`VisibleStations`] extension to the request, and the telemetry adapters
//! never emit data for a station outside it.

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::collections::HashSet;

use crate::state::AppState;

/// The set of station ids a caller may observe
///
/// `None` means unrestricted (no auth layer installed, or an admin caller).
#[derive(Debug, Clone, Default)]
pub struct VisibleStations(pub Option<HashSet<u32>>);

impl VisibleStations {
    /// Everything visible
    pub fn all() -> Self {
        Self(None)
    }

    /// Restrict to the given station ids
    pub fn only(ids: impl IntoIterator<Item = u32>) -> Self {
        Self(Some(ids.into_iter().collect()))
    }

    pub fn allows(&self, station_id: u32) -> bool {
        match &self.0 {
            Some(ids) => ids.contains(&station_id),
            None => true,
        }
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_scales": state.scales.active_station_ids().await.len(),
        "active_streams": state.broadcaster.stream_count().await,
        "weight_subscribers": state.hub.subscriber_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_default_allows_everything() {
        let vis = VisibleStations::default();
        assert!(vis.allows(1));
        assert!(vis.allows(999));
    }

    #[test]
    fn test_visibility_restricts_to_set() {
        let vis = VisibleStations::only([1, 3]);
        assert!(vis.allows(1));
        assert!(vis.allows(3));
        assert!(!vis.allows(2));
    }

    #[test]
    fn test_visibility_empty_set_denies_all() {
        let vis = VisibleStations::only([]);
        assert!(!vis.allows(1));
    }
}
