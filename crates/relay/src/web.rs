use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::bridge::{BridgeError, CommandSink, RelayBridge};
use crate::cache::StatusView;
use crate::config::WebSettings;
use crate::protocol::{CommandRequest, TelemetrySnapshot};

// ---------------------------------------------------------------------------
// JSON responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    pub latest_message: LatestMessage,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum LatestMessage {
    Snapshot(TelemetrySnapshot),
    NoData { message: &'static str },
}

impl From<StatusView> for StatusResponse {
    fn from(view: StatusView) -> Self {
        Self {
            connected: view.connected,
            latest_message: match view.latest {
                Some(snapshot) => LatestMessage::Snapshot(snapshot),
                None => LatestMessage::NoData {
                    message: "no status yet",
                },
            },
        }
    }
}

#[derive(Serialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<S: CommandSink>(bridge: Arc<RelayBridge<S>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/status", get(api_status::<S>))
        .route("/api/command", post(api_command::<S>))
        .route("/api/events", get(api_events::<S>))
        .with_state(bridge)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn api_status<S: CommandSink>(
    State(bridge): State<Arc<RelayBridge<S>>>,
) -> Json<StatusResponse> {
    Json(bridge.status().into())
}

async fn api_command<S: CommandSink>(
    State(bridge): State<Arc<RelayBridge<S>>>,
    Json(cmd): Json<CommandRequest>,
) -> impl IntoResponse {
    match bridge.send_command(&cmd).await {
        Ok(()) => (
            StatusCode::OK,
            Json(CommandResponse {
                success: true,
                error: None,
            }),
        ),
        Err(e) => {
            let status = match e {
                BridgeError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
                BridgeError::Publish(_) => StatusCode::BAD_GATEWAY,
                BridgeError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(CommandResponse {
                    success: false,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

async fn api_events<S: CommandSink>(
    State(bridge): State<Arc<RelayBridge<S>>>,
) -> impl IntoResponse {
    Json(bridge.recent_events().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<S: CommandSink>(bridge: Arc<RelayBridge<S>>, web: &WebSettings) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], web.port));
    let app = router(bridge);

    if let Some(tls) = &web.tls {
        #[cfg(feature = "tls")]
        {
            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .context("failed to load web TLS certificate")?;
            info!(%addr, "api listening on https");
            axum_server::bind_rustls(addr, config)
                .serve(app.into_make_service())
                .await
                .context("web server error")?;
            return Ok(());
        }

        #[cfg(not(feature = "tls"))]
        tracing::warn!(
            cert = %tls.cert_path.display(),
            "web.tls configured but built without the `tls` feature, serving plain http"
        );
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {}", web.port))?;
    info!(%addr, "api listening on http");
    axum::serve(listener, app).await.context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fake::RecordingSink;
    use crate::protocol::{decode_snapshot, Mode};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `oneshot`

    const SNAPSHOT: &str = r#"{"deviceId":"basil","moisture":42,"timestamp":"2026-05-01T08:30:00Z","threshold":30,"pumpState":"off","mode":"auto","changeThreshold":5,"uptime":3600,"signalQuality":-61}"#;

    fn bridge() -> Arc<RelayBridge<RecordingSink>> {
        Arc::new(RelayBridge::new(
            RecordingSink::default(),
            "plant/basil/control".into(),
        ))
    }

    async fn body_json(res: axum::response::Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_command(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/command")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn status_before_telemetry_says_no_status_yet() {
        let res = router(bridge()).oneshot(get("/api/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            body_json(res).await,
            json!({"connected": false, "latestMessage": {"message": "no status yet"}})
        );
    }

    #[tokio::test]
    async fn status_returns_latest_snapshot() {
        let b = bridge();
        b.record_connectivity(true).await;
        b.record_snapshot(decode_snapshot(SNAPSHOT.as_bytes()).unwrap()).await;

        let res = router(b).oneshot(get("/api/status")).await.unwrap();
        let body = body_json(res).await;
        assert_eq!(body["connected"], true);
        assert_eq!(body["latestMessage"], serde_json::from_str::<Value>(SNAPSHOT).unwrap());
    }

    #[tokio::test]
    async fn command_while_disconnected_is_503() {
        let b = bridge();
        let res = router(b.clone())
            .oneshot(post_command(json!({"command": "mode", "state": "manual"})))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(res).await,
            json!({"success": false, "error": "not connected"})
        );
        assert!(b.status().latest.is_none());
    }

    #[tokio::test]
    async fn command_while_connected_is_forwarded() {
        let b = bridge();
        b.record_connectivity(true).await;
        b.record_snapshot(decode_snapshot(SNAPSHOT.as_bytes()).unwrap()).await;

        let res = router(b.clone())
            .oneshot(post_command(json!({"command": "mode", "state": "manual"})))
            .await
            .unwrap();

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(body_json(res).await, json!({"success": true}));
        // Cached mode only changes once the node echoes.
        assert_eq!(b.status().latest.unwrap().mode, Mode::Auto);
    }

    #[tokio::test]
    async fn malformed_command_body_is_rejected() {
        let res = router(bridge())
            .oneshot(post_command(json!({"state": "on"})))
            .await
            .unwrap();
        assert!(res.status().is_client_error());
    }

    #[tokio::test]
    async fn events_endpoint_lists_newest_first() {
        let b = bridge();
        b.record_connectivity(true).await;
        b.record_error("bad status payload".into()).await;

        let res = router(b).oneshot(get("/api/events")).await.unwrap();
        let body = body_json(res).await;
        assert_eq!(body[0]["kind"], "error");
        assert_eq!(body[1]["kind"], "connectivity");
    }

    #[tokio::test]
    async fn healthz_ok() {
        let res = router(bridge()).oneshot(get("/healthz")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
