//! StationDirectory - Desired-State Station Configuration
//!
//! ## Responsibilities
//!
//! - Hold the full desired-state list of weighing stations
//! - Load/reload the list from a JSON file
//! - Resolve a station/camera id to a video source URL
//! - Resolve a remote-bridge token to its station
//!
//! The directory is the in-process stand-in for the persistence layer: it is
//! always replaced wholesale (never patched), and a failed reload leaves the
//! previous list untouched.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

/// One CCTV attached to a station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationCamera {
    pub name: String,
    /// Camera index, file path or RTSP URL
    pub source: String,
}

/// Weighing station configuration
///
/// Combines the scale (serial) side and the camera side of one physical lane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Station {
    pub id: u32,
    pub name: String,
    /// e.g. "COM3" or "/dev/ttyUSB0"
    pub serial_port: String,
    /// 0 falls back to 9600
    pub baud_rate: u32,
    pub enabled: bool,
    /// Authentication token for the remote scale bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub cameras: Vec<StationCamera>,
}

/// StationDirectory instance
pub struct StationDirectory {
    stations: RwLock<Vec<Station>>,
    file: Option<PathBuf>,
}

impl StationDirectory {
    /// Create an empty directory without a backing file
    pub fn new() -> Self {
        Self {
            stations: RwLock::new(Vec::new()),
            file: None,
        }
    }

    /// Create a directory backed by a JSON station list file
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            stations: RwLock::new(Vec::new()),
            file: Some(path.into()),
        }
    }

    /// Replace the whole desired-state list
    pub async fn replace_all(&self, stations: Vec<Station>) {
        let mut current = self.stations.write().await;
        tracing::info!(count = stations.len(), "Station list replaced");
        *current = stations;
    }

    /// Re-read the backing file and replace the list
    ///
    /// Any read or parse failure aborts before the stored list is touched.
    pub async fn reload_from_file(&self) -> Result<Vec<Station>> {
        let path = self
            .file
            .as_ref()
            .ok_or_else(|| Error::Config("No station file configured".to_string()))?;

        let stations = Self::read_file(path).await?;
        self.replace_all(stations.clone()).await;
        Ok(stations)
    }

    async fn read_file(path: &Path) -> Result<Vec<Station>> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;

        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("Cannot parse {}: {}", path.display(), e)))
    }

    /// All stations, enabled or not
    pub async fn all(&self) -> Vec<Station> {
        self.stations.read().await.clone()
    }

    /// Enabled stations only
    pub async fn enabled(&self) -> Vec<Station> {
        self.stations
            .read()
            .await
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect()
    }

    /// Look up one station
    pub async fn get(&self, id: u32) -> Option<Station> {
        self.stations.read().await.iter().find(|s| s.id == id).cloned()
    }

    /// Resolve a remote-bridge token to its station
    ///
    /// Disabled stations never match, so revoking a station also revokes its
    /// token.
    pub async fn find_by_token(&self, token: &str) -> Option<Station> {
        self.stations
            .read()
            .await
            .iter()
            .find(|s| s.enabled && s.token.as_deref() == Some(token))
            .cloned()
    }

    /// Resolve a station/camera pair to its source URL
    pub async fn resolve_camera(&self, station_id: u32, camera: usize) -> Option<String> {
        self.stations
            .read()
            .await
            .iter()
            .find(|s| s.id == station_id)
            .and_then(|s| s.cameras.get(camera))
            .map(|c| c.source.clone())
    }
}

impl Default for StationDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn station(id: u32, enabled: bool, token: Option<&str>) -> Station {
        Station {
            id,
            name: format!("Lane {}", id),
            serial_port: format!("/dev/ttyUSB{}", id),
            baud_rate: 9600,
            enabled,
            token: token.map(str::to_string),
            cameras: vec![StationCamera {
                name: "gate".to_string(),
                source: format!("rtsp://cam{}.local/stream", id),
            }],
        }
    }

    #[tokio::test]
    async fn test_replace_all_swaps_whole_list() {
        let dir = StationDirectory::new();
        dir.replace_all(vec![station(1, true, None), station(2, false, None)])
            .await;
        assert_eq!(dir.all().await.len(), 2);

        dir.replace_all(vec![station(3, true, None)]).await;
        let all = dir.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 3);
    }

    #[tokio::test]
    async fn test_enabled_filters_disabled_stations() {
        let dir = StationDirectory::new();
        dir.replace_all(vec![station(1, true, None), station(2, false, None)])
            .await;

        let enabled = dir.enabled().await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, 1);
    }

    #[tokio::test]
    async fn test_token_only_matches_enabled() {
        let dir = StationDirectory::new();
        dir.replace_all(vec![
            station(1, true, Some("alpha")),
            station(2, false, Some("beta")),
        ])
        .await;

        assert_eq!(dir.find_by_token("alpha").await.unwrap().id, 1);
        assert!(dir.find_by_token("beta").await.is_none());
        assert!(dir.find_by_token("gamma").await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_camera() {
        let dir = StationDirectory::new();
        dir.replace_all(vec![station(1, true, None)]).await;

        assert_eq!(
            dir.resolve_camera(1, 0).await.as_deref(),
            Some("rtsp://cam1.local/stream")
        );
        assert!(dir.resolve_camera(1, 5).await.is_none());
        assert!(dir.resolve_camera(9, 0).await.is_none());
    }

    #[tokio::test]
    async fn test_reload_failure_preserves_list() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":7,"name":"Main Gate","serial_port":"/dev/ttyS0","baud_rate":0,"enabled":true}}]"#
        )
        .unwrap();

        let dir = StationDirectory::with_file(file.path());
        let loaded = dir.reload_from_file().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, 7);

        // Corrupt the file; reload must fail and keep the old list
        write!(file, "not json").unwrap();
        file.flush().unwrap();
        assert!(dir.reload_from_file().await.is_err());
        assert_eq!(dir.all().await.len(), 1);
    }
}
