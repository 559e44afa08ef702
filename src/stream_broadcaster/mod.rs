//! StreamBroadcaster - Shared Camera Capture Pipelines
//!
//! ## Responsibilities
//!
//! - At most one capture pipeline per distinct camera source, regardless of
//!   viewer count
//! - Reference-counted stream lifecycle (lazy start, teardown at zero)
//! - Republish the freshest encoded frame to all viewers
//!
//! Capture runs an external ffmpeg transcoder per source: RTSP is forced
//! onto TCP, frames are downscaled and re-encoded as MJPEG at a capped rate,
//! and the concatenated JPEGs on its stdout are split by [`JpegFramer`].
//! Viewers never touch the device; they read the shared last-frame buffer at
//! their own cadence, so a slow client gets a stale frame instead of
//! stalling the producer.

mod framer;

pub use framer::JpegFramer;

use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Delay before a failed or closed source is reopened
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Transcoder output shaping
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Downscale target, bandwidth-appropriate for browser viewing
    pub width: u32,
    pub height: u32,
    /// ffmpeg `-q:v` (1-31, lower is better)
    pub quality: u8,
    /// Produced frame rate cap
    pub fps: u8,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 854,
            height: 480,
            quality: 5,
            fps: 5,
        }
    }
}

/// One camera source shared by all its current viewers
pub struct SharedStream {
    source: String,
    /// Most recent encoded frame; empty until the first frame lands
    last_frame: RwLock<Bytes>,
}

impl SharedStream {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Current frame, cheap to clone (shared immutable buffer)
    pub async fn last_frame(&self) -> Bytes {
        self.last_frame.read().await.clone()
    }
}

struct StreamEntry {
    stream: Arc<SharedStream>,
    viewers: usize,
    stop: watch::Sender<bool>,
    _task: JoinHandle<()>,
}

/// StreamBroadcaster instance
pub struct StreamBroadcaster {
    streams: Mutex<HashMap<String, StreamEntry>>,
    settings: StreamSettings,
}

impl StreamBroadcaster {
    /// Create new StreamBroadcaster
    pub fn new(settings: StreamSettings) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Get the shared stream for `source`, starting its capture task on
    /// first use, and count one more viewer
    pub async fn acquire(&self, source: &str) -> Arc<SharedStream> {
        let mut streams = self.streams.lock().await;

        if let Some(entry) = streams.get_mut(source) {
            entry.viewers += 1;
            tracing::debug!(source = %source, viewers = entry.viewers, "Stream viewer attached");
            return entry.stream.clone();
        }

        let stream = Arc::new(SharedStream {
            source: source.to_string(),
            last_frame: RwLock::new(Bytes::new()),
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(capture_loop(
            stream.clone(),
            self.settings.clone(),
            stop_rx,
        ));

        streams.insert(
            source.to_string(),
            StreamEntry {
                stream: stream.clone(),
                viewers: 1,
                stop: stop_tx,
                _task: task,
            },
        );

        tracing::info!(source = %source, "Capture pipeline started");
        stream
    }

    /// Drop one viewer; at zero the capture task is signaled to stop and
    /// the registry entry removed
    ///
    /// Stop is signaled before the entry disappears, so a racing acquire
    /// always creates a fresh stream instead of adopting a half-closed one.
    pub async fn release(&self, source: &str) {
        let mut streams = self.streams.lock().await;

        let Some(entry) = streams.get_mut(source) else {
            return;
        };

        entry.viewers = entry.viewers.saturating_sub(1);
        tracing::debug!(source = %source, viewers = entry.viewers, "Stream viewer detached");

        if entry.viewers == 0 {
            let _ = entry.stop.send(true);
            streams.remove(source);
            tracing::info!(source = %source, "Capture pipeline stopping, last viewer gone");
        }
    }

    /// Number of active capture pipelines
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    /// Viewer count for one source (debugging/health)
    pub async fn viewer_count(&self, source: &str) -> usize {
        self.streams
            .lock()
            .await
            .get(source)
            .map(|e| e.viewers)
            .unwrap_or(0)
    }
}

/// Outer reconnect loop: spawn the transcoder, pump frames, back off and
/// reopen on any failure until stopped
async fn capture_loop(
    stream: Arc<SharedStream>,
    settings: StreamSettings,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let mut child = match spawn_transcoder(&stream.source, &settings) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(source = %stream.source, error = %e, "Transcoder spawn failed");
                if sleep_or_stop(&mut stop, RECONNECT_DELAY).await {
                    break;
                }
                continue;
            }
        };

        let Some(mut stdout) = child.stdout.take() else {
            shutdown_transcoder(&mut child).await;
            if sleep_or_stop(&mut stop, RECONNECT_DELAY).await {
                break;
            }
            continue;
        };

        let mut framer = JpegFramer::new();
        let mut chunk = vec![0u8; 32 * 1024];

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    shutdown_transcoder(&mut child).await;
                    tracing::debug!(source = %stream.source, "Capture task stopped");
                    return;
                }
                read = stdout.read(&mut chunk) => match read {
                    Ok(0) => {
                        tracing::warn!(source = %stream.source, "Transcoder output closed, reconnecting");
                        shutdown_transcoder(&mut child).await;
                        break;
                    }
                    Ok(n) => {
                        for frame in framer.feed(&chunk[..n]) {
                            *stream.last_frame.write().await = frame;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(source = %stream.source, error = %e, "Transcoder read error, reconnecting");
                        shutdown_transcoder(&mut child).await;
                        break;
                    }
                }
            }
        }

        if sleep_or_stop(&mut stop, RECONNECT_DELAY).await {
            break;
        }
    }

    tracing::debug!(source = %stream.source, "Capture task stopped");
}

/// Spawn ffmpeg turning one video source into piped MJPEG
fn spawn_transcoder(source: &str, settings: &StreamSettings) -> std::io::Result<Child> {
    let mut cmd = Command::new("ffmpeg");

    // TCP avoids packet-loss artifacts on lossy RTSP links
    if source.starts_with("rtsp://") {
        cmd.args(["-rtsp_transport", "tcp"]);
    }

    cmd.args([
        "-i",
        source,
        "-vf",
        &format!("scale={}:{}", settings.width, settings.height),
        "-f",
        "image2pipe",
        "-vcodec",
        "mjpeg",
        "-q:v",
        &settings.quality.to_string(),
        "-r",
        &settings.fps.to_string(),
        "-loglevel",
        "error",
        "-",
    ])
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .kill_on_drop(true)
    .spawn()
}

/// Kill the transcoder and reap it so no zombie is left behind
async fn shutdown_transcoder(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Wait out the reconnect delay; true means stop was signaled meanwhile
async fn sleep_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = stop.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Sources below never open; capture tasks sit in their reconnect loop,
    // which is all the registry lifecycle needs.

    #[tokio::test]
    async fn test_two_viewers_share_one_pipeline() {
        let broadcaster = StreamBroadcaster::new(StreamSettings::default());

        let a = broadcaster.acquire("rtsp://test.invalid/lane1").await;
        let b = broadcaster.acquire("rtsp://test.invalid/lane1").await;

        assert_eq!(broadcaster.stream_count().await, 1);
        assert_eq!(broadcaster.viewer_count("rtsp://test.invalid/lane1").await, 2);
        assert!(Arc::ptr_eq(&a, &b));

        broadcaster.release("rtsp://test.invalid/lane1").await;
        assert_eq!(broadcaster.stream_count().await, 1);

        broadcaster.release("rtsp://test.invalid/lane1").await;
        assert_eq!(broadcaster.stream_count().await, 0);
        assert_eq!(broadcaster.viewer_count("rtsp://test.invalid/lane1").await, 0);
    }

    #[tokio::test]
    async fn test_distinct_sources_get_distinct_pipelines() {
        let broadcaster = StreamBroadcaster::new(StreamSettings::default());

        broadcaster.acquire("rtsp://test.invalid/lane1").await;
        broadcaster.acquire("rtsp://test.invalid/lane2").await;

        assert_eq!(broadcaster.stream_count().await, 2);

        broadcaster.release("rtsp://test.invalid/lane1").await;
        broadcaster.release("rtsp://test.invalid/lane2").await;
        assert_eq!(broadcaster.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_unknown_source_is_noop() {
        let broadcaster = StreamBroadcaster::new(StreamSettings::default());
        broadcaster.release("rtsp://test.invalid/never-acquired").await;
        assert_eq!(broadcaster.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_reacquire_after_teardown_starts_fresh() {
        let broadcaster = StreamBroadcaster::new(StreamSettings::default());

        let first = broadcaster.acquire("rtsp://test.invalid/lane1").await;
        broadcaster.release("rtsp://test.invalid/lane1").await;

        let second = broadcaster.acquire("rtsp://test.invalid/lane1").await;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(broadcaster.stream_count().await, 1);

        broadcaster.release("rtsp://test.invalid/lane1").await;
    }
}
