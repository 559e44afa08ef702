//! ScaleManager - Serial Weight Indicator Monitoring
//!
//! ## Responsibilities
//!
//! - One reconnecting monitor task per enabled station
//! - Tolerant parsing of newline-delimited indicator output
//! - Live config reload (full desired-state list, set difference)
//! - Demo simulation for deployments without hardware
//!
//! Each monitor owns its serial handle exclusively; the shared station map
//! only ever holds the last parsed weight and the connected flag. Device
//! failures are never fatal: an absent indicator simply reports
//! `connected:false` until it appears.

use crate::weight_hub::{ScaleData, WeightHub};
use crate::station_directory::Station;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Delay between connection attempts
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Baud rate used when a station does not specify one
const DEFAULT_BAUD_RATE: u32 = 9600;

/// Demo simulation tick period
const DEMO_TICK: Duration = Duration::from_millis(500);

/// Longest indicator line accepted before the connection is recycled
const MAX_LINE_LEN: usize = 8192;

/// Published view of one station's live state
#[derive(Debug, Clone, Serialize)]
pub struct ScaleSnapshot {
    pub scale_id: u32,
    pub weight: f64,
    pub connected: bool,
}

/// Runtime state shared between a monitor and its readers
#[derive(Debug, Default)]
struct ScaleState {
    weight: f64,
    connected: bool,
}

/// One running monitor
struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// ScaleManager instance
pub struct ScaleManager {
    /// Last weight + connected flag per station, written only by the owning
    /// monitor (and the demo/bridge paths for the weight field)
    scales: Arc<RwLock<HashMap<u32, ScaleState>>>,
    /// Running monitor tasks
    monitors: Mutex<HashMap<u32, MonitorHandle>>,
    hub: Arc<WeightHub>,
    demo: Mutex<Option<MonitorHandle>>,
}

impl ScaleManager {
    /// Create new ScaleManager publishing into `hub`
    pub fn new(hub: Arc<WeightHub>) -> Self {
        Self {
            scales: Arc::new(RwLock::new(HashMap::new())),
            monitors: Mutex::new(HashMap::new()),
            hub,
            demo: Mutex::new(None),
        }
    }

    /// Apply a full desired-state station list
    ///
    /// Monitors for stations that are gone (or now disabled) are stopped,
    /// their handles awaited and their runtime state removed. Every station
    /// in the desired set is then stopped-and-restarted unconditionally, so
    /// a port or baud change always gets a fresh connection.
    pub async fn reload(&self, desired: Vec<Station>) {
        let desired: Vec<Station> = desired.into_iter().filter(|s| s.enabled).collect();
        let desired_ids: HashSet<u32> = desired.iter().map(|s| s.id).collect();

        let mut monitors = self.monitors.lock().await;

        let stale: Vec<u32> = monitors
            .keys()
            .filter(|id| !desired_ids.contains(id))
            .copied()
            .collect();

        for id in stale {
            if let Some(handle) = monitors.remove(&id) {
                Self::stop_monitor(handle).await;
            }
            self.scales.write().await.remove(&id);
            tracing::info!(station_id = id, "Stopped scale monitor");
        }

        for station in desired {
            self.start_monitor(&mut monitors, station).await;
        }
    }

    /// Register one station and (re)start its monitor
    async fn start_monitor(&self, monitors: &mut HashMap<u32, MonitorHandle>, station: Station) {
        if let Some(handle) = monitors.remove(&station.id) {
            Self::stop_monitor(handle).await;
        }

        self.scales
            .write()
            .await
            .insert(station.id, ScaleState::default());

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(monitor_loop(
            station.clone(),
            self.scales.clone(),
            self.hub.clone(),
            stop_rx,
        ));

        monitors.insert(
            station.id,
            MonitorHandle {
                stop: stop_tx,
                task,
            },
        );

        tracing::info!(
            station_id = station.id,
            name = %station.name,
            port = %station.serial_port,
            "Started scale monitor"
        );
    }

    /// Signal stop and wait until the monitor has released its device
    async fn stop_monitor(handle: MonitorHandle) {
        let _ = handle.stop.send(true);
        let _ = handle.task.await;
    }

    /// Inject a reading coming from the remote scale bridge
    ///
    /// Takes the same path as a physical reading: last weight updated,
    /// `connected:true` event published. The connected flag in the map stays
    /// owned by the station's monitor - it reflects the local serial link.
    pub async fn inject_reading(&self, station_id: u32, weight: f64) {
        if let Some(state) = self.scales.write().await.get_mut(&station_id) {
            state.weight = weight;
        }
        self.hub.publish(ScaleData::now(station_id, weight, true)).await;
    }

    /// Snapshot the live state of every station
    pub async fn snapshot(&self) -> Vec<ScaleSnapshot> {
        self.scales
            .read()
            .await
            .iter()
            .map(|(id, state)| ScaleSnapshot {
                scale_id: *id,
                weight: state.weight,
                connected: state.connected,
            })
            .collect()
    }

    /// Ids of stations with a running monitor
    pub async fn active_station_ids(&self) -> Vec<u32> {
        self.monitors.lock().await.keys().copied().collect()
    }

    /// Start the demo simulation ticker
    ///
    /// Synthesizes plausible weights for stations whose hardware is
    /// currently disconnected, published as `connected:true` so the UI can
    /// be exercised without an indicator attached. The shared connected
    /// flag is left untouched: it keeps reporting the hardware truth. Only
    /// ever started behind the operator's demo flag.
    pub async fn start_demo_mode(&self) {
        let mut demo = self.demo.lock().await;
        if demo.is_some() {
            tracing::warn!("Demo simulation already running");
            return;
        }

        tracing::info!("Starting demo scale simulation");

        let scales = self.scales.clone();
        let hub = self.hub.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEMO_TICK);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                let now = chrono::Utc::now().timestamp();
                let weight = demo_weight(now);

                let disconnected: Vec<u32> = {
                    let mut scales = scales.write().await;
                    scales
                        .iter_mut()
                        .filter(|(_, state)| !state.connected)
                        .map(|(id, state)| {
                            state.weight = weight;
                            *id
                        })
                        .collect()
                };

                for id in disconnected {
                    hub.publish(ScaleData::now(id, weight, true)).await;
                }
            }
            tracing::info!("Demo scale simulation stopped");
        });

        *demo = Some(MonitorHandle {
            stop: stop_tx,
            task,
        });
    }

    /// Stop the demo simulation ticker
    pub async fn stop_demo_mode(&self) {
        if let Some(handle) = self.demo.lock().await.take() {
            Self::stop_monitor(handle).await;
        }
    }
}

/// Synthetic demo weight: toggles between empty and loaded (~24.5 t) on a
/// 20 s period, with jitter on the loaded phase
fn demo_weight(now: i64) -> f64 {
    if (now / 20) % 2 == 0 {
        0.0
    } else {
        24_500.0 + (now % 100) as f64
    }
}

/// Extract a weight from raw indicator output
///
/// Everything except digits, `.` and `-` is discarded before parsing, so
/// framing like `"ST,GS,+  12345 kg"` still yields `12345.0`. Unparseable
/// leftovers become `0.0`; indicator noise must never take the monitor down.
pub fn parse_weight(raw: &str) -> f64 {
    let clean: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    clean.parse().unwrap_or(0.0)
}

/// Per-station monitor: {Disconnected, Connected} with infinite retry
async fn monitor_loop(
    station: Station,
    scales: Arc<RwLock<HashMap<u32, ScaleState>>>,
    hub: Arc<WeightHub>,
    mut stop: watch::Receiver<bool>,
) {
    let baud = if station.baud_rate == 0 {
        DEFAULT_BAUD_RATE
    } else {
        station.baud_rate
    };

    loop {
        if *stop.borrow() {
            break;
        }

        // Disconnected: try to open 8-N-1 at the configured baud
        let port = tokio_serial::new(station.serial_port.as_str(), baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .open_native_async();

        let port = match port {
            Ok(port) => port,
            Err(e) => {
                tracing::debug!(
                    station_id = station.id,
                    port = %station.serial_port,
                    error = %e,
                    "Scale connection failed, retrying"
                );
                set_connected(&scales, station.id, false).await;
                hub.publish(ScaleData::now(station.id, 0.0, false)).await;

                tokio::select! {
                    _ = tokio::time::sleep(RETRY_DELAY) => continue,
                    _ = stop.changed() => break,
                }
            }
        };

        set_connected(&scales, station.id, true).await;
        tracing::info!(
            station_id = station.id,
            name = %station.name,
            port = %station.serial_port,
            "Connected to scale"
        );

        // Connected: read newline-delimited indicator output until the
        // stream errors or closes, then drop the handle and reconnect
        let mut lines = FramedRead::new(port, LinesCodec::new_with_max_length(MAX_LINE_LEN));

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    // Dropping the framed reader closes the port
                    set_connected(&scales, station.id, false).await;
                    return;
                }
                line = lines.next() => match line {
                    Some(Ok(text)) => {
                        let weight = parse_weight(&text);
                        {
                            let mut scales = scales.write().await;
                            if let Some(state) = scales.get_mut(&station.id) {
                                state.weight = weight;
                                state.connected = true;
                            }
                        }
                        hub.publish(ScaleData::now(station.id, weight, true)).await;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            station_id = station.id,
                            error = %e,
                            "Error reading scale, reconnecting"
                        );
                        break;
                    }
                    None => {
                        tracing::warn!(station_id = station.id, "Scale stream closed, reconnecting");
                        break;
                    }
                }
            }
        }

        set_connected(&scales, station.id, false).await;
    }
}

async fn set_connected(
    scales: &Arc<RwLock<HashMap<u32, ScaleState>>>,
    station_id: u32,
    connected: bool,
) {
    if let Some(state) = scales.write().await.get_mut(&station_id) {
        state.connected = connected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_station(id: u32) -> Station {
        Station {
            id,
            name: format!("Lane {}", id),
            // Never exists, so the monitor stays in its retry loop
            serial_port: format!("/dev/ttyWEIGH-TEST-{}", id),
            baud_rate: 0,
            enabled: true,
            token: None,
            cameras: Vec::new(),
        }
    }

    #[test]
    fn test_parse_weight_indicator_frames() {
        assert_eq!(parse_weight("ST,GS,+  12345 kg"), 12345.0);
        assert_eq!(parse_weight(" 0.00 "), 0.0);
        assert_eq!(parse_weight("- 50.5"), -50.5);
        assert_eq!(parse_weight("random text 100"), 100.0);
        assert_eq!(parse_weight("12.34kg"), 12.34);
    }

    #[test]
    fn test_parse_weight_no_digits_is_zero() {
        assert_eq!(parse_weight("garbage"), 0.0);
        assert_eq!(parse_weight(""), 0.0);
        assert_eq!(parse_weight("...--"), 0.0);
    }

    #[test]
    fn test_demo_weight_oscillates() {
        // Even 20s bucket: empty
        assert_eq!(demo_weight(40), 0.0);
        // Odd bucket: loaded with jitter
        let loaded = demo_weight(25);
        assert!((24_500.0..24_600.0).contains(&loaded));
    }

    #[tokio::test]
    async fn test_reload_removes_excluded_station() {
        let hub = Arc::new(WeightHub::new());
        let manager = ScaleManager::new(hub);

        manager.reload(vec![test_station(5)]).await;
        assert_eq!(manager.active_station_ids().await, vec![5]);
        assert_eq!(manager.snapshot().await.len(), 1);

        // Station 5 no longer desired: monitor terminates, state is gone
        timeout(Duration::from_secs(5), manager.reload(Vec::new()))
            .await
            .expect("reload must not hang on monitor teardown");
        assert!(manager.active_station_ids().await.is_empty());
        assert!(manager.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_station_gets_no_monitor() {
        let hub = Arc::new(WeightHub::new());
        let manager = ScaleManager::new(hub);

        let mut station = test_station(1);
        station.enabled = false;
        manager.reload(vec![station]).await;

        assert!(manager.active_station_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_unopenable_station_reports_disconnected() {
        let hub = Arc::new(WeightHub::new());
        let manager = ScaleManager::new(hub.clone());
        let (_id, mut rx) = hub.subscribe().await;

        manager.reload(vec![test_station(3)]).await;

        // Published on every failed open attempt, one per retry cycle
        let event = timeout(Duration::from_secs(8), rx.recv())
            .await
            .expect("monitor should publish a status event")
            .unwrap();
        assert_eq!(event.scale_id, 3);
        assert!(!event.connected);

        let snapshot = manager.snapshot().await;
        assert!(!snapshot[0].connected);

        manager.reload(Vec::new()).await;
    }

    #[tokio::test]
    async fn test_demo_mode_publishes_for_disconnected_only() {
        let hub = Arc::new(WeightHub::new());
        let manager = ScaleManager::new(hub.clone());

        manager.reload(vec![test_station(9)]).await;
        let (_id, mut rx) = hub.subscribe().await;
        manager.start_demo_mode().await;

        // The monitor publishes connected:false events; the demo ticker
        // publishes connected:true ones for the same station.
        let event = timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.connected {
                    break event;
                }
            }
        })
        .await
        .expect("demo simulation should publish synthetic readings");

        assert_eq!(event.scale_id, 9);

        // The hardware truth is untouched by the simulation
        assert!(!manager.snapshot().await[0].connected);

        manager.stop_demo_mode().await;
        manager.reload(Vec::new()).await;
    }

    #[tokio::test]
    async fn test_inject_reading_publishes_and_updates_weight() {
        let hub = Arc::new(WeightHub::new());
        let manager = ScaleManager::new(hub.clone());

        manager.reload(vec![test_station(2)]).await;
        let (_id, mut rx) = hub.subscribe().await;

        manager.inject_reading(2, 18_040.0).await;

        // The monitor may interleave connected:false retry events; the
        // injected reading is the one carrying the bridge weight.
        let event = timeout(Duration::from_secs(2), async {
            loop {
                let event = rx.recv().await.unwrap();
                if event.weight == 18_040.0 {
                    break event;
                }
            }
        })
        .await
        .expect("injected reading should be published");
        assert_eq!(event.scale_id, 2);
        assert!(event.connected);

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot[0].weight, 18_040.0);

        manager.reload(Vec::new()).await;
    }
}
