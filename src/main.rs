//! Room orchestration server entry point.
//!
//! Wires the process-level collaborators (config, media engine, room
//! registry, drain manager) and exposes the outer HTTP/WebSocket surface.
//! The admin endpoints here (`/health`, `/rooms`, `/drain`) are named in
//! spec §6 as external collaborators whose interface this core must
//! satisfy; their authentication and operational hardening live outside
//! this crate's scope.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use confero_core::dispatcher::{ws_handler, AppState};
use confero_core::drain::DrainManager;
use confero_core::media::MediaEngine;
use confero_core::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confero_core=debug,tower_http=debug".into()),
        )
        .json()
        .init();

    dotenvy::dotenv().ok();
    let config = Arc::new(Config::from_env()?);

    info!(
        version = %config.version,
        instance_id = %config.instance_id,
        "starting room orchestration core"
    );

    let media_engine = MediaEngine::new(
        &config.stun_server,
        config.turn_server.as_deref(),
        config.turn_username.as_deref(),
        config.turn_credential.as_deref(),
    )?;

    let drain = Arc::new(DrainManager::new(config.instance_id.clone(), config.version.clone()));
    let state = AppState::new(config.clone(), media_engine, drain);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/rooms", get(list_rooms))
        .route("/drain", post(trigger_drain))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    info!(address = %config.bind_address, "listening");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C signal handler");
        info!("received shutdown signal");
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    instance_id: String,
    version: String,
    room_count: usize,
    draining: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.drain.is_draining() { "draining" } else { "ok" },
        instance_id: state.config.instance_id.clone(),
        version: state.config.version.clone(),
        room_count: state.registry.room_count().await,
        draining: state.drain.is_draining(),
    })
}

#[derive(Serialize)]
struct RoomSummary {
    channel_id: String,
    member_count: usize,
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomSummary>> {
    let mut out = Vec::new();
    for room in state.registry.all_rooms().await {
        out.push(RoomSummary {
            channel_id: room.channel_id.clone(),
            member_count: room.member_count().await,
        });
    }
    Json(out)
}

#[derive(Deserialize)]
struct DrainRequest {
    draining: bool,
    #[serde(default)]
    force: bool,
    #[serde(default = "default_notice")]
    notice: String,
    #[serde(default = "default_notice_ms")]
    notice_ms: u64,
}

fn default_notice() -> String {
    "Server is restarting".to_string()
}

fn default_notice_ms() -> u64 {
    5_000
}

async fn trigger_drain(State(state): State<AppState>, Json(req): Json<DrainRequest>) -> Json<serde_json::Value> {
    if !req.draining {
        state.drain.cancel();
        return Json(serde_json::json!({ "draining": false }));
    }
    if req.force {
        let registry = state.registry.clone();
        let drain = state.drain.clone();
        let notice = req.notice.clone();
        tokio::spawn(async move {
            drain.force_drain(registry, &notice, req.notice_ms).await;
        });
    } else {
        state.drain.flag().store(true, std::sync::atomic::Ordering::SeqCst);
    }
    Json(serde_json::json!({ "draining": true }))
}
