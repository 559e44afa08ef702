//! PlateDetector - Capture-and-Detect Collaborator Seam
//!
//! The recognition pipeline itself lives outside this core; operators wire a
//! real implementation in at startup. What this module owns is the contract
//! (grab one frame from a camera source, return the detected plate text and
//! the stored snapshot) and the simulated implementation used on
//! deployments without cameras.

use crate::error::{Error, Result};
use async_trait::async_trait;

/// Result of one capture-and-detect round trip
#[derive(Debug, Clone)]
pub struct PlateCapture {
    /// Detected plate text
    pub plate: String,
    /// Where the evidence snapshot was stored, as served to the browser
    pub snapshot: String,
}

/// Capture one frame from `source` and run plate detection on it
#[async_trait]
pub trait PlateDetector: Send + Sync {
    async fn capture_and_detect(&self, source: &str) -> Result<PlateCapture>;
}

/// Detector stand-in for camera-less and demo deployments
///
/// Fails on an empty source exactly like a real capture would, so callers
/// exercise their fallback path.
pub struct SimulatedDetector;

#[async_trait]
impl PlateDetector for SimulatedDetector {
    async fn capture_and_detect(&self, source: &str) -> Result<PlateCapture> {
        if source.is_empty() {
            return Err(Error::Validation("No camera source configured".to_string()));
        }

        tracing::debug!(source = %source, "Simulated plate detection");

        Ok(PlateCapture {
            plate: "B 1234 DEMO".to_string(),
            snapshot: "/static/images/placeholder_truck.jpg".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simulated_detector_returns_plate() {
        let detector = SimulatedDetector;
        let capture = detector
            .capture_and_detect("rtsp://cam.local/stream")
            .await
            .unwrap();
        assert_eq!(capture.plate, "B 1234 DEMO");
    }

    #[tokio::test]
    async fn test_simulated_detector_rejects_empty_source() {
        let detector = SimulatedDetector;
        assert!(detector.capture_and_detect("").await.is_err());
    }
}
