//! HTTP endpoints: device discovery, lineup, and channel streaming.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    Json,
};
use log::{error, info, warn};
use serde_json::json;

use crate::session::SessionError;
use crate::web::state::GatewayState;

/// HDHomeRun device descriptor. Plex probes this to find the "tuner".
pub async fn discover(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let identity = &state.identity;
    Json(json!({
        "FriendlyName": identity.friendly_name,
        "Manufacturer": "Silicondust",
        "ModelNumber": "HDTC-2US",
        "FirmwareName": "hdhomeruntc_atsc",
        "FirmwareVersion": "20150826",
        "TunerCount": state.tuner_pool.capacity(),
        "DeviceID": identity.device_id,
        "DeviceAuth": "tablo_proxy",
        "BaseURL": identity.base_url,
        "LineupURL": format!("{}/lineup.json", identity.base_url),
    }))
}

/// Channel lineup from the current directory snapshot.
pub async fn lineup(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let snapshot = state.directory.snapshot().await;

    let mut entries: Vec<_> = snapshot.values().collect();
    entries.sort_by(|a, b| {
        guide_number_key(&a.display_number)
            .cmp(&guide_number_key(&b.display_number))
            .then_with(|| a.display_number.cmp(&b.display_number))
    });

    let lineup: Vec<serde_json::Value> = entries
        .into_iter()
        .map(|ch| {
            json!({
                "GuideNumber": ch.display_number,
                "GuideName": ch.display_name,
                "URL": format!("{}/channel/{}", state.identity.base_url, ch.id),
            })
        })
        .collect();

    Json(lineup)
}

/// Numeric sort key for guide numbers like "5.1" or "1002", so "10.1"
/// orders after "2.1". Unparseable numbers sort last, lexicographically.
fn guide_number_key(number: &str) -> (u32, u32) {
    let mut parts = number.splitn(2, '.');
    let major = parts.next().and_then(|p| p.parse().ok()).unwrap_or(u32::MAX);
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    (major, minor)
}

/// Static scan status; the gateway never scans.
pub async fn lineup_status() -> impl IntoResponse {
    Json(json!({
        "ScanInProgress": 0,
        "ScanPossible": 1,
        "Source": "Antenna",
        "SourceList": ["Antenna"],
    }))
}

/// Admit and stream one channel until the client goes away or the
/// transcoder exits.
pub async fn channel(
    State(state): State<Arc<GatewayState>>,
    Path(channel_id): Path<String>,
) -> axum::response::Response {
    let Some(descriptor) = state.directory.get(&channel_id).await else {
        info!("Channel {} not in lineup", channel_id);
        return (StatusCode::NOT_FOUND, "channel not found").into_response();
    };

    let Some(lease) = state.tuner_pool.try_acquire() else {
        warn!(
            "Channel {} denied: all {} tuners in use",
            channel_id,
            state.tuner_pool.capacity()
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "all tuners in use").into_response();
    };

    match state.sessions.start_session(&descriptor).await {
        Ok(session) => (
            [(CONTENT_TYPE, "video/mp2t"), (axum::http::header::CACHE_CONTROL, "no-store")],
            Body::from_stream(session.into_stream(lease)),
        )
            .into_response(),
        Err(e) => {
            error!("Channel {} failed to start: {}", channel_id, e);
            lease.release();
            let status = match e {
                SessionError::SourceResolution(_) => StatusCode::BAD_GATEWAY,
                SessionError::Spawn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, "could not start stream").into_response()
        }
    }
}

/// Cached XMLTV guide, when guide refresh is enabled.
pub async fn guide(State(state): State<Arc<GatewayState>>) -> axum::response::Response {
    let Some(path) = &state.guide_path else {
        return (StatusCode::NOT_FOUND, "guide not enabled").into_response();
    };

    match tokio::fs::read(path).await {
        Ok(bytes) => ([(CONTENT_TYPE, "application/xml")], bytes).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "guide not cached yet").into_response(),
    }
}
