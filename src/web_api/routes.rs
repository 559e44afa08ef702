//! API routes and the per-connection delivery adapters

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Extension, Json, Router,
};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result};
use crate::state::AppState;
use crate::station_directory::Station;
use crate::web_api::VisibleStations;

/// Weight snapshot cadence (5 Hz)
const SSE_INTERVAL: Duration = Duration::from_millis(200);

/// Video delivery cadence (10 Hz), independent of the capture rate
const FRAME_INTERVAL: Duration = Duration::from_millis(100);

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Stations (desired-state admin)
        .route("/api/stations", get(list_stations))
        .route("/api/stations", put(replace_stations))
        .route("/api/stations/reload", post(reload_stations))
        // Telemetry
        .route("/api/scales", get(scales_snapshot))
        .route("/api/scales/stream", get(stream_scale_data))
        .route("/api/scales/events", get(scale_events))
        // Video
        .route("/api/video/stream", get(stream_video))
        // Remote scale bridge
        .route("/api/external/scale", post(remote_scale_data))
        // Plate capture
        .route("/api/capture", post(capture_plate))
        .with_state(state)
}

// ========================================
// Stations
// ========================================

async fn list_stations(State(state): State<AppState>) -> Json<Vec<Station>> {
    Json(state.directory.all().await)
}

/// Replace the full desired-state list and apply it to the monitors
async fn replace_stations(
    State(state): State<AppState>,
    Json(stations): Json<Vec<Station>>,
) -> Json<serde_json::Value> {
    state.directory.replace_all(stations.clone()).await;
    state.scales.reload(stations).await;

    Json(json!({
        "status": "success",
        "stations": state.directory.all().await.len(),
    }))
}

/// Re-read the station file; a failed read leaves the running set untouched
async fn reload_stations(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let stations = state.directory.reload_from_file().await?;
    state.scales.reload(stations).await;

    Ok(Json(json!({
        "status": "success",
        "stations": state.directory.all().await.len(),
    })))
}

// ========================================
// Weight telemetry
// ========================================

/// One-shot snapshot of every visible station
async fn scales_snapshot(
    State(state): State<AppState>,
    visibility: Option<Extension<VisibleStations>>,
) -> impl IntoResponse {
    let visibility = visibility
        .map(|Extension(v)| v)
        .unwrap_or_else(VisibleStations::all);

    let visible: Vec<_> = state
        .scales
        .snapshot()
        .await
        .into_iter()
        .filter(|s| visibility.allows(s.scale_id))
        .collect();

    Json(visible)
}

/// SSE stream of live weights
///
/// Level-triggered: every tick snapshots the station map and emits one event
/// per visible station, so a new client sees current values immediately with
/// no history replay. Client disconnect is observed at the next tick.
async fn stream_scale_data(
    State(state): State<AppState>,
    visibility: Option<Extension<VisibleStations>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let visibility = visibility
        .map(|Extension(v)| v)
        .unwrap_or_else(VisibleStations::all);
    let (tx, rx) = mpsc::channel::<std::result::Result<Event, Infallible>>(16);
    let scales = state.scales.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SSE_INTERVAL);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            for reading in scales.snapshot().await {
                if !visibility.allows(reading.scale_id) {
                    continue;
                }
                let Ok(json) = serde_json::to_string(&reading) else {
                    continue;
                };
                if tx.send(Ok(Event::default().data(json))).await.is_err() {
                    return;
                }
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

/// SSE stream of discrete weight events as they are published
///
/// Edge-triggered counterpart of [`stream_scale_data`]: subscribes to the
/// hub, so only readings published after connect are delivered.
async fn scale_events(
    State(state): State<AppState>,
    visibility: Option<Extension<VisibleStations>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let visibility = visibility
        .map(|Extension(v)| v)
        .unwrap_or_else(VisibleStations::all);
    let (subscriber_id, mut events) = state.hub.subscribe().await;
    let (tx, rx) = mpsc::channel::<std::result::Result<Event, Infallible>>(64);
    let hub = state.hub.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                event = events.recv() => {
                    let Some(data) = event else { break };
                    if !visibility.allows(data.scale_id) {
                        continue;
                    }
                    let Ok(json) = serde_json::to_string(&data) else {
                        continue;
                    };
                    if tx.send(Ok(Event::default().data(json))).await.is_err() {
                        break;
                    }
                }
            }
        }
        hub.unsubscribe(&subscriber_id).await;
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

// ========================================
// Video
// ========================================

#[derive(Debug, Deserialize)]
struct VideoQuery {
    url: Option<String>,
    station_id: Option<u32>,
    camera: Option<usize>,
}

/// MJPEG proxy for one camera source
///
/// All viewers of the same source share one capture pipeline; each
/// connection only runs its own delivery ticker, reading the shared frame
/// at a fixed cadence and writing one multipart chunk per tick.
async fn stream_video(
    State(state): State<AppState>,
    Query(query): Query<VideoQuery>,
) -> Result<Response> {
    let source = match query.url {
        Some(url) if !url.is_empty() => url,
        _ => {
            let station_id = query
                .station_id
                .ok_or_else(|| Error::Validation("Missing url or station_id".to_string()))?;
            state
                .directory
                .resolve_camera(station_id, query.camera.unwrap_or(0))
                .await
                .ok_or_else(|| {
                    Error::NotFound(format!("No camera for station {}", station_id))
                })?
        }
    };

    let stream = state.broadcaster.acquire(&source).await;
    let broadcaster = state.broadcaster.clone();
    let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(4);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_INTERVAL);
        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let frame = stream.last_frame().await;
            if frame.is_empty() {
                continue;
            }

            let mut part = BytesMut::with_capacity(frame.len() + 96);
            part.extend_from_slice(
                format!(
                    "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    frame.len()
                )
                .as_bytes(),
            );
            part.extend_from_slice(&frame);
            part.extend_from_slice(b"\r\n");

            if tx.send(Ok(part.freeze())).await.is_err() {
                break;
            }
        }

        broadcaster.release(stream.source()).await;
        tracing::debug!(source = %stream.source(), "Video viewer disconnected");
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| Error::Internal(e.to_string()))
}

// ========================================
// Remote scale bridge
// ========================================

#[derive(Debug, Deserialize)]
struct RemoteScalePayload {
    weight: f64,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Ingest a weight reading from a remote scale sender
///
/// The station is resolved from its bridge token; the reading then takes
/// the exact path of a local serial line, so everything downstream treats
/// the two identically.
async fn remote_scale_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(payload): Json<RemoteScalePayload>,
) -> Result<Json<serde_json::Value>> {
    let token = headers
        .get("x-scale-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.token)
        .ok_or_else(|| Error::Unauthorized("Token authentication required".to_string()))?;

    let station = state
        .directory
        .find_by_token(&token)
        .await
        .ok_or_else(|| Error::Unauthorized("Invalid or inactive token".to_string()))?;

    state.scales.inject_reading(station.id, payload.weight).await;

    Ok(Json(json!({
        "status": "success",
        "station": station.name,
        "received_weight": payload.weight,
    })))
}

// ========================================
// Plate capture
// ========================================

#[derive(Debug, Deserialize)]
struct CaptureQuery {
    station_id: u32,
    camera: Option<usize>,
}

/// Trigger the plate-detection collaborator for one station's camera
///
/// Capture failure is not an operator error; the handler answers with the
/// simulated payload so the weighing flow can continue without a camera.
async fn capture_plate(
    State(state): State<AppState>,
    Query(query): Query<CaptureQuery>,
) -> Json<serde_json::Value> {
    let source = state
        .directory
        .resolve_camera(query.station_id, query.camera.unwrap_or(0))
        .await
        .unwrap_or_default();

    match state.detector.capture_and_detect(&source).await {
        Ok(capture) => Json(json!({
            "plate": capture.plate,
            "snapshot": capture.snapshot,
            "status": "success",
        })),
        Err(e) => {
            tracing::warn!(
                station_id = query.station_id,
                error = %e,
                "Plate capture failed, answering with simulated data"
            );
            Json(json!({
                "plate": "B 1234 DEMO",
                "snapshot": "/static/images/placeholder_truck.jpg",
                "status": "simulated",
            }))
        }
    }
}
