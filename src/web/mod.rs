//! HTTP front door: the HDHomeRun-compatible surface Plex talks to.

pub mod api;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use log::info;
use tower_http::cors::CorsLayer;

use state::GatewayState;

/// Build the gateway router. Separate from serving so tests can drive it
/// directly.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/discover.json", get(api::discover))
        .route("/lineup.json", get(api::lineup))
        .route("/lineup_status.json", get(api::lineup_status))
        .route("/channel/:id", get(api::channel))
        .route("/guide.xml", get(api::guide))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(CorsLayer::permissive())
}

/// Log every request except the ones Plex polls constantly.
async fn log_requests(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let noisy = path == "/discover.json" || path == "/lineup_status.json";
    if !noisy {
        info!("{} {}", request.method(), path);
    }
    next.run(request).await
}

/// Bind and serve the gateway until the process exits.
pub async fn start_web_server(
    listen_addr: SocketAddr,
    state: Arc<GatewayState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Gateway listening on http://{}", listen_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::device::{DeviceClient, DeviceConfig};
    use crate::directory::{ChannelDescriptor, ChannelDirectory, SourceKind};
    use crate::session::{SessionConfig, SessionManager};
    use crate::tuner::TunerPool;
    use crate::web::state::DeviceIdentity;

    fn test_state(capacity: u32) -> Arc<GatewayState> {
        let device = Arc::new(
            DeviceClient::new(DeviceConfig {
                base_url: "http://127.0.0.1:1".to_string(),
                token: "test-token".to_string(),
                request_timeout: std::time::Duration::from_millis(200),
            })
            .unwrap(),
        );
        Arc::new(GatewayState {
            directory: Arc::new(ChannelDirectory::new()),
            tuner_pool: Arc::new(TunerPool::new(capacity)),
            sessions: Arc::new(SessionManager::new(SessionConfig::default(), device)),
            identity: DeviceIdentity {
                friendly_name: "Tablo Proxy".to_string(),
                device_id: "12care11".to_string(),
                base_url: "http://192.168.1.50:8080".to_string(),
            },
            guide_path: None,
        })
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn discover_reports_identity_and_tuner_count() {
        let state = test_state(4);
        let app = build_router(state);

        let response = app
            .oneshot(Request::get("/discover.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["TunerCount"], 4);
        assert_eq!(json["DeviceID"], "12care11");
        assert_eq!(json["BaseURL"], "http://192.168.1.50:8080");
        assert_eq!(json["LineupURL"], "http://192.168.1.50:8080/lineup.json");
    }

    #[tokio::test]
    async fn lineup_reflects_the_directory_snapshot() {
        let state = test_state(2);

        let mut channels = HashMap::new();
        channels.insert(
            "ch-9".to_string(),
            ChannelDescriptor {
                id: "ch-9".to_string(),
                display_number: "9.1".to_string(),
                display_name: "Nine".to_string(),
                source: SourceKind::DeviceHosted,
                locator: "ch-9".to_string(),
            },
        );
        channels.insert(
            "ch-2".to_string(),
            ChannelDescriptor {
                id: "ch-2".to_string(),
                display_number: "2.1".to_string(),
                display_name: "Two".to_string(),
                source: SourceKind::DirectUrl,
                locator: "http://upstream/2.m3u8".to_string(),
            },
        );
        state.directory.replace(channels).await;

        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/lineup.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        let lineup = json.as_array().unwrap();
        assert_eq!(lineup.len(), 2);
        assert_eq!(lineup[0]["GuideNumber"], "2.1");
        assert_eq!(lineup[1]["GuideName"], "Nine");
        assert_eq!(
            lineup[0]["URL"],
            "http://192.168.1.50:8080/channel/ch-2"
        );
    }

    #[tokio::test]
    async fn lineup_orders_guide_numbers_numerically() {
        let state = test_state(2);

        let mut channels = HashMap::new();
        for number in ["10.1", "2.10", "2.1", "2.2"] {
            let id = format!("ch-{}", number);
            channels.insert(
                id.clone(),
                ChannelDescriptor {
                    id: id.clone(),
                    display_number: number.to_string(),
                    display_name: format!("Channel {}", number),
                    source: SourceKind::DeviceHosted,
                    locator: id,
                },
            );
        }
        state.directory.replace(channels).await;

        let app = build_router(state);
        let response = app
            .oneshot(Request::get("/lineup.json").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = body_json(response).await;
        let numbers: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["GuideNumber"].as_str().unwrap())
            .collect();
        assert_eq!(numbers, ["2.1", "2.2", "2.10", "10.1"]);
    }

    #[tokio::test]
    async fn lineup_status_never_reports_a_scan() {
        let app = build_router(test_state(2));

        let response = app
            .oneshot(
                Request::get("/lineup_status.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["ScanInProgress"], 0);
        assert_eq!(json["ScanPossible"], 1);
    }

    #[tokio::test]
    async fn unknown_channel_is_not_found() {
        let app = build_router(test_state(2));

        let response = app
            .oneshot(
                Request::get("/channel/no-such-channel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn exhausted_pool_turns_requests_away() {
        let state = test_state(0);

        let mut channels = HashMap::new();
        channels.insert(
            "ch-1".to_string(),
            ChannelDescriptor {
                id: "ch-1".to_string(),
                display_number: "1.1".to_string(),
                display_name: "One".to_string(),
                source: SourceKind::DirectUrl,
                locator: "http://upstream/1.m3u8".to_string(),
            },
        );
        state.directory.replace(channels).await;

        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(Request::get("/channel/ch-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(state.tuner_pool.in_use(), 0);
    }

    #[tokio::test]
    async fn failed_session_start_returns_the_slot() {
        let state = test_state(1);

        // Device-hosted source against an unreachable receiver: admission
        // succeeds, resolution fails, and the lease must come back.
        let mut channels = HashMap::new();
        channels.insert(
            "ch-1".to_string(),
            ChannelDescriptor {
                id: "ch-1".to_string(),
                display_number: "1.1".to_string(),
                display_name: "One".to_string(),
                source: SourceKind::DeviceHosted,
                locator: "ch-1".to_string(),
            },
        );
        state.directory.replace(channels).await;

        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(Request::get("/channel/ch-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(state.tuner_pool.in_use(), 0);
    }

    #[tokio::test]
    async fn guide_without_a_cache_is_not_found() {
        let app = build_router(test_state(2));

        let response = app
            .oneshot(Request::get("/guide.xml").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
