//! The captive portal's HTTP surface: the three JSON endpoints the
//! provisioning flow needs, plus UI asset delivery and the catch-all
//! redirect that trips client captive-portal detection.

use crate::frontends::UiAssetProvider;
use crate::state::MachineHandle;
use crate::types::{AccessPointRecord, Passphrase};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

pub type WebServerState = State<Arc<AppState>>;

pub struct AppState {
    pub machine: MachineHandle,
    pub frontend: Arc<dyn UiAssetProvider>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/networks", get(api_networks))
        .route("/connect", post(api_connect))
        .route("/status", get(api_status))
        .route("/{*path}", get(serve_static_asset))
        .with_state(state)
}

/// Starts the portal server on `addr` and returns its task handle.
pub fn start_web_server(
    machine: MachineHandle,
    frontend: Arc<dyn UiAssetProvider>,
    addr: SocketAddr,
) -> JoinHandle<Result<(), crate::Error>> {
    let app = router(Arc::new(AppState { machine, frontend }));
    info!(%addr, "portal listening");
    tokio::spawn(async move {
        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app.into_make_service())
            .await
            .map_err(|e| crate::Error::WebServer(e.into()))
    })
}

// --- JSON API ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NetworksResponse {
    networks: Vec<AccessPointRecord>,
    scan_failed: bool,
}

/// `GET /networks`: current scan listing. A stale cache triggers a fresh
/// scan cycle; during a credential trial the cached listing comes back.
async fn api_networks(State(state): WebServerState) -> Response {
    match state.machine.networks().await {
        Ok(reply) => (
            StatusCode::OK,
            Json(NetworksResponse {
                networks: reply.networks,
                scan_failed: reply.scan_failed,
            }),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    ssid: String,
    passphrase: String,
}

/// `POST /connect`: enqueues a credential attempt and returns its id
/// immediately. Joining can take tens of seconds; the caller polls
/// `/status` instead of holding this request open.
async fn api_connect(
    State(state): WebServerState,
    Json(payload): Json<ConnectRequest>,
) -> Response {
    let passphrase = Passphrase::new(payload.passphrase);
    match state.machine.submit(payload.ssid, passphrase).await {
        Ok(attempt_id) => (
            StatusCode::OK,
            Json(serde_json::json!({ "attemptId": attempt_id })),
        )
            .into_response(),
        Err(crate::Error::Busy) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "busy" })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    attempt_id: Option<u64>,
}

#[derive(Serialize)]
struct StatusResponse {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

/// `GET /status?attemptId=`: the provisioning state and, once resolved,
/// the attempt's outcome. Without an id, just the machine state.
async fn api_status(State(state): WebServerState, Query(query): Query<StatusQuery>) -> Response {
    let Some(attempt_id) = query.attempt_id else {
        let snapshot = state.machine.snapshot();
        return Json(StatusResponse {
            state: snapshot.state.label(),
            outcome: None,
            reason: snapshot.ap_error,
        })
        .into_response();
    };
    match state.machine.status(attempt_id).await {
        Ok(Some(status)) => Json(StatusResponse {
            state: status.state.label(),
            outcome: status.outcome.map(|o| o.label()),
            reason: status.reason,
        })
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown attempt" })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: crate::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}

// --- UI assets ---

async fn serve_index(State(state): WebServerState) -> Response {
    match state.frontend.get_asset("index.html").await {
        Ok((data, mime)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", mime)
            .body(Body::from(data))
            .unwrap(),
        Err(_) => (StatusCode::NOT_FOUND, "portal UI missing").into_response(),
    }
}

/// Serves a UI asset; anything unknown (including captive-portal probe
/// paths like `/generate_204` or `/hotspot-detect.html`) redirects to the
/// portal root, which is what makes client devices pop the portal.
async fn serve_static_asset(State(state): WebServerState, Path(path): Path<String>) -> Response {
    match state.frontend.get_asset(&path).await {
        Ok((data, mime)) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", mime)
            .body(Body::from(data))
            .unwrap(),
        Err(_) => Redirect::temporary("/").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::frontends::EmbedFrontend;
    use crate::gateway::mock::MockGateway;
    use crate::state;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn setup(gateway: Arc<MockGateway>) -> Router {
        let config = PortalConfig {
            captive_portal: false,
            submit_cooldown_ms: 0,
            ..PortalConfig::builtin()
        };
        let (machine, _task) = state::spawn(gateway, config);
        // Let the machine finish its startup transition before requests fly.
        for _ in 0..100 {
            if machine.snapshot().state != crate::types::ProvisioningState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        router(Arc::new(AppState {
            machine,
            frontend: Arc::new(EmbedFrontend::new()),
        }))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn networks_returns_portal_listing() {
        let app = setup(Arc::new(MockGateway::with_demo_networks())).await;
        let response = app
            .oneshot(Request::get("/networks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["scanFailed"], false);
        let networks = json["networks"].as_array().unwrap();
        assert!(networks.iter().any(|n| n["ssid"] == "MyHomeWiFi"));
        assert!(networks[0]["signal"].is_u64());
    }

    #[tokio::test]
    async fn scan_failure_reports_empty_listing_with_flag() {
        let gateway = Arc::new(MockGateway::new());
        gateway.fail_scans("radio busy");
        let app = setup(gateway).await;
        let response = app
            .oneshot(Request::get("/networks").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["scanFailed"], true);
        assert_eq!(json["networks"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn connect_returns_attempt_id_and_busy_conflicts() {
        let gateway = Arc::new(MockGateway::with_demo_networks());
        gateway.set_activate_delay(Duration::from_secs(2));
        let app = setup(gateway).await;

        let connect = |ssid: &str| {
            Request::post("/connect")
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    r#"{{"ssid":"{ssid}","passphrase":"pw"}}"#
                )))
                .unwrap()
        };

        let response = app.clone().oneshot(connect("MyHomeWiFi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let attempt_id = json["attemptId"].as_u64().unwrap();
        assert!(attempt_id >= 1);

        // Submission racing the in-flight trial is rejected, not queued.
        let response = app.clone().oneshot(connect("CafeGuest")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let json = body_json(response).await;
        assert_eq!(json["error"], "busy");
    }

    #[tokio::test]
    async fn status_of_unknown_attempt_is_not_found() {
        let app = setup(Arc::new(MockGateway::with_demo_networks())).await;
        let response = app
            .oneshot(Request::get("/status?attemptId=42").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_without_id_reports_machine_state() {
        let app = setup(Arc::new(MockGateway::with_demo_networks())).await;
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["state"], "ap_active");
    }

    #[tokio::test]
    async fn captive_probe_paths_redirect_to_portal_root() {
        let app = setup(Arc::new(MockGateway::with_demo_networks())).await;
        for probe in ["/generate_204", "/hotspot-detect.html", "/ncsi.txt"] {
            let response = app
                .clone()
                .oneshot(Request::get(probe).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT, "{probe}");
            assert_eq!(response.headers()["location"], "/");
        }
    }
}
