//! Plain HTTP routing and the WebSocket tunnel entry point.
//!
//! One listener serves everything: a static greeting on the root path, a
//! liveness endpoint, a connection-descriptor page on the path matching the
//! access token, and the WebSocket upgrade that hands the connection to the
//! tunnel session. Everything except the upgrade is peripheral glue.

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, State, ws::WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::net::SocketAddr;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::dns_relay::DnsRelay;
use crate::session;

/// Path that accepts the WebSocket tunnel upgrade.
pub const TUNNEL_PATH: &str = "/ws";

/// Immutable per-process state, built once at startup and shared by every
/// connection.
#[derive(Clone)]
pub struct AppState {
    pub user_id: Uuid,
    pub dns: DnsRelay,
}

impl AppState {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            user_id: config.tunnel.user_id,
            dns: DnsRelay::new(config.tunnel.doh_url.clone())?,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing))
        .route("/health", get(health))
        .route(TUNNEL_PATH, get(tunnel))
        .route("/{token}", get(subscription))
        .with_state(state)
}

async fn landing() -> &'static str {
    "Hello World!"
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Serves the connection descriptor when the path matches the access token
/// in its canonical form; any other token is indistinguishable from an
/// unknown path.
async fn subscription(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Response {
    if token != state.user_id.to_string() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let host_header = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let (host, port) = match host_header.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(443u16)),
        None => (host_header, 443),
    };
    let path = TUNNEL_PATH.replace('/', "%2F");

    format!(
        "vless://{token}@{host}:{port}?encryption=none&type=ws&host={host}&path={path}#{host}\n"
    )
    .into_response()
}

async fn tunnel(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let original_client_ip = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_original_client_ip);

    match original_client_ip {
        Some(ref ip) => {
            info!(client_ip = %ip, direct_addr = %client_addr, "WebSocket upgrade requested");
        }
        None => {
            info!(client_ip = %client_addr, "WebSocket upgrade requested");
        }
    }

    ws.on_upgrade(move |socket| session::run(socket, client_addr, state.user_id, state.dns))
}

/// Parses the original client IP from X-Forwarded-For header
/// Format: "client, proxy1, proxy2, ..." - returns the leftmost (original client) IP
#[must_use]
pub fn parse_original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::{net::TcpListener, time::sleep};

    const TOKEN: &str = "9a53bb10-73b3-4f0e-a015-0c65f0b356af";
    const SERVER_STARTUP_DELAY: Duration = Duration::from_millis(100);

    async fn start_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = AppState {
            user_id: Uuid::parse_str(TOKEN).unwrap(),
            dns: DnsRelay::new(crate::config::DEFAULT_DOH_URL).unwrap(),
        };
        let app = build_router(state);

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        sleep(SERVER_STARTUP_DELAY).await;
        port
    }

    #[tokio::test]
    async fn root_returns_greeting() {
        let port = start_server().await;
        let response = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert_eq!(response.text().await.unwrap(), "Hello World!");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let port = start_server().await;
        let response = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();

        assert!(response.status().is_success());
        assert!(response.text().await.unwrap().contains("ok"));
    }

    #[tokio::test]
    async fn subscription_returns_connection_descriptor() {
        let port = start_server().await;
        let response = reqwest::get(format!("http://127.0.0.1:{port}/{TOKEN}"))
            .await
            .unwrap();

        assert!(response.status().is_success());
        let body = response.text().await.unwrap();
        assert!(body.starts_with(&format!("vless://{TOKEN}@127.0.0.1:{port}")));
        assert!(body.contains("type=ws"));
        assert!(body.contains("path=%2Fws"));
    }

    #[tokio::test]
    async fn wrong_token_is_not_found() {
        let port = start_server().await;
        let response = reqwest::get(format!(
            "http://127.0.0.1:{port}/00000000-0000-4000-8000-000000000000"
        ))
        .await
        .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_nested_path_is_not_found() {
        let port = start_server().await;
        let response = reqwest::get(format!("http://127.0.0.1:{port}/some/other/path"))
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plain_request_on_tunnel_path_is_rejected() {
        let port = start_server().await;
        let response = reqwest::get(format!("http://127.0.0.1:{port}/ws"))
            .await
            .unwrap();

        assert!(!response.status().is_success());
    }

    mod xff_parsing {
        use super::*;

        #[test]
        fn takes_leftmost_ip() {
            assert_eq!(
                parse_original_client_ip("203.0.113.7, 10.0.0.1, 10.0.0.2"),
                Some("203.0.113.7".to_string())
            );
        }

        #[test]
        fn trims_whitespace() {
            assert_eq!(
                parse_original_client_ip("  203.0.113.7  "),
                Some("203.0.113.7".to_string())
            );
        }

        #[test]
        fn rejects_empty_header() {
            assert_eq!(parse_original_client_ip(""), None);
            assert_eq!(parse_original_client_ip("   "), None);
        }
    }
}
