// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! REST + WebSocket admin surface.
//!
//! A thin adapter over the bus: queries read the Status-fed point
//! snapshot, writes emit Status + Update envelopes on RUNTIME, and module
//! operations go through the ModuleControl/Confirmation flow. `/metrics`
//! serves the Prometheus view of the HEALTH topic.
//!
//! With a certificate and key configured the server speaks TLS; adding a
//! CA certificate additionally requires and verifies client certificates.

use super::metrics::PromRegistry;
use crate::control::{ControlClient, ControlError};
use crate::msgbus::{Envelope, Point, Pusher, Status, Update, RUNTIME_TOPIC};
use crate::util::Shutdown;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

const WS_WRITE_WAIT: Duration = Duration::from_secs(10);
const WS_PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping at 90% of the pong deadline.
const WS_PING_PERIOD: Duration = Duration::from_secs(54);
const WS_PUB_PERIOD: Duration = Duration::from_secs(5);

/// TLS material for the admin endpoint.
#[derive(Debug, Clone, Default)]
pub struct ApiTls {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
}

pub struct ApiState {
    /// Point snapshot fed by RUNTIME Status envelopes.
    pub points: DashMap<String, Point>,
    pub pusher: Arc<Pusher>,
    /// Sender identity on emitted envelopes (`<cpu-name>-api`).
    pub sender: String,
    pub control: Arc<ControlClient>,
    pub prom: Arc<PromRegistry>,
}

impl ApiState {
    fn snapshot(&self) -> Vec<Point> {
        self.points.iter().map(|entry| entry.value().clone()).collect()
    }

    fn push_write(&self, update: Update) -> Result<(), String> {
        let status = Status {
            measurements: update.updates.clone(),
        };

        let env = Envelope::new(&self.sender, &status).map_err(|e| e.to_string())?;
        self.pusher
            .push(RUNTIME_TOPIC, &env)
            .map_err(|e| e.to_string())?;

        let env = Envelope::new(&self.sender, &update).map_err(|e| e.to_string())?;
        self.pusher
            .push(RUNTIME_TOPIC, &env)
            .map_err(|e| e.to_string())?;

        Ok(())
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/query", get(query_all))
        .route("/api/v1/query/ws", get(query_ws)) // order matters here
        .route("/api/v1/query/:tag", get(query_tag))
        .route("/api/v1/write", post(write_body))
        .route("/api/v1/write/:tag/:value", post(write_path))
        .route("/api/v1/modules", get(modules_list))
        .route(
            "/api/v1/modules/:name",
            post(module_enable).delete(module_disable),
        )
        .route("/metrics", get(metrics))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn query_all(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(json!({"points": state.snapshot()}))
}

async fn query_tag(
    State(state): State<Arc<ApiState>>,
    Path(tag): Path<String>,
) -> Result<Json<Point>, StatusCode> {
    match state.points.get(&tag) {
        Some(point) => Ok(Json(point.value().clone())),
        None => Err(StatusCode::BAD_REQUEST),
    }
}

async fn write_body(
    State(state): State<Arc<ApiState>>,
    Json(mut update): Json<Update>,
) -> Result<StatusCode, (StatusCode, String)> {
    for point in &mut update.updates {
        if point.tstamp == 0 {
            point.tstamp = crate::util::epoch_secs();
        }
    }

    state
        .push_write(update)
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

async fn write_path(
    State(state): State<Arc<ApiState>>,
    Path((tag, value)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let value: f64 = value
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid value {value}")))?;

    let update = Update {
        updates: vec![Point::new(tag, value)],
        ..Default::default()
    };

    state
        .push_write(update)
        .map(|_| StatusCode::OK)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

fn control_status(e: ControlError) -> (StatusCode, String) {
    match e {
        ControlError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "request timed out".into()),
        ControlError::Send(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn modules_list(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let state = state.clone();
    let confirmation = tokio::task::spawn_blocking(move || state.control.list())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(control_status)?;

    Ok(Json(json!({"modules": confirmation.results})))
}

async fn module_enable(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    module_control(state, name, true).await
}

async fn module_disable(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    module_control(state, name, false).await
}

async fn module_control(
    state: Arc<ApiState>,
    name: String,
    enable: bool,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let request_name = name.clone();
    let confirmation = tokio::task::spawn_blocking(move || {
        if enable {
            state.control.enable(vec![request_name])
        } else {
            state.control.disable(vec![request_name])
        }
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(control_status)?;

    if let Some(error) = confirmation.errors.get(&name) {
        return Err((StatusCode::BAD_REQUEST, error.clone()));
    }

    Ok(Json(json!({"modules": confirmation.results})))
}

async fn metrics(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    state.prom.gather()
}

async fn query_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
) -> impl IntoResponse {
    // Permissive origin: the admin surface fronts lab tooling, not browsers
    // on the open internet.
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<ApiState>) {
    let (mut sender, mut receiver) = socket.split();

    let writer = async {
        let mut publish = tokio::time::interval(WS_PUB_PERIOD);
        let mut ping = tokio::time::interval(WS_PING_PERIOD);

        loop {
            let message = tokio::select! {
                _ = publish.tick() => {
                    let body = json!({"points": state.snapshot()}).to_string();
                    Message::Text(body)
                }
                _ = ping.tick() => Message::Ping(Vec::new()),
            };

            match tokio::time::timeout(WS_WRITE_WAIT, sender.send(message)).await {
                Ok(Ok(())) => {}
                // Slow or dead peer: drop the connection.
                _ => return,
            }
        }
    };

    let reader = async {
        loop {
            match tokio::time::timeout(WS_PONG_WAIT, receiver.next()).await {
                // Pongs (and any other inbound traffic) refresh the read
                // deadline by looping.
                Ok(Some(Ok(_))) => {}
                _ => return,
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }
}

/// Serve the API on a dedicated thread with its own runtime. TLS when cert
/// and key are configured; mutual TLS when a CA is configured as well.
pub fn serve(
    endpoint: String,
    tls: ApiTls,
    state: Arc<ApiState>,
    shutdown: Shutdown,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("cpu-api".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Runtime::new() {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::error!("[cpu] building API runtime: {e}");
                    return;
                }
            };

            runtime.block_on(async move {
                if let Err(e) = serve_inner(endpoint, tls, state, shutdown).await {
                    log::error!("[cpu] API server: {e}");
                }
            });
        })?;

    Ok(())
}

async fn serve_inner(
    endpoint: String,
    tls: ApiTls,
    state: Arc<ApiState>,
    shutdown: Shutdown,
) -> Result<(), String> {
    let app = router(state);

    let addr: std::net::SocketAddr = endpoint
        .parse()
        .map_err(|e| format!("parsing API endpoint {endpoint}: {e}"))?;

    log::info!("[cpu] starting API server at {endpoint}/api/v1");

    let handle = Handle::new();
    {
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            shutdown.wait();
            handle.graceful_shutdown(Some(Duration::from_secs(2)));
        });
    }

    match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => {
            let config = rustls_config(cert, key, tls.ca.as_deref()).await?;

            axum_server::bind_rustls(addr, config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
                .map_err(|e| e.to_string())
        }
        _ => axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .map_err(|e| e.to_string()),
    }
}

async fn rustls_config(
    cert: &str,
    key: &str,
    ca: Option<&str>,
) -> Result<RustlsConfig, String> {
    let Some(ca) = ca else {
        return RustlsConfig::from_pem_file(cert, key)
            .await
            .map_err(|e| format!("loading TLS certificate and key: {e}"));
    };

    // Mutual TLS: require and verify client certificates against the CA.
    let ca_bytes = std::fs::read(ca).map_err(|e| format!("reading CA certificate: {e}"))?;

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_bytes.as_slice()) {
        let cert = cert.map_err(|e| format!("parsing CA certificate: {e}"))?;
        roots
            .add(cert)
            .map_err(|e| format!("adding CA certificate: {e}"))?;
    }

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| format!("building client verifier: {e}"))?;

    let cert_bytes = std::fs::read(cert).map_err(|e| format!("reading certificate: {e}"))?;
    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("parsing certificate: {e}"))?;

    let key_bytes = std::fs::read(key).map_err(|e| format!("reading key: {e}"))?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| format!("parsing key: {e}"))?
        .ok_or_else(|| "no private key found".to_string())?;

    let config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| format!("building TLS config: {e}"))?;

    Ok(RustlsConfig::from_config(Arc::new(config)))
}
