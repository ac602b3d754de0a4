use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::db::Db;
use crate::manual::Command;
use crate::state::SharedState;
use crate::store::StoreView;

#[derive(Clone)]
pub struct AppState {
    pub status: SharedState,
    pub store: watch::Receiver<StoreView>,
    pub commands: mpsc::Sender<Command>,
    pub db: Db,
}

#[derive(Debug, Deserialize)]
struct Limit {
    limit: Option<i64>,
}

impl Limit {
    fn get(&self) -> i64 {
        self.limit.unwrap_or(100).clamp(1, 1000)
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/command", post(api_command))
        .route("/api/readings/{sensor}", get(api_readings))
        .route("/api/waterings", get(api_waterings))
        .with_state(state)
}

fn error_json(code: StatusCode, msg: String) -> Response {
    (code, Json(json!({ "error": msg }))).into_response()
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let store = app.store.borrow().clone();
    let st = app.status.read().await;
    Json(st.to_status(store))
}

/// Same command shapes as the MQTT command topic.
async fn api_command(State(app): State<AppState>, Json(body): Json<Value>) -> Response {
    let cmd = match Command::parse(&body) {
        Ok(cmd) => cmd,
        Err(e) => return error_json(StatusCode::BAD_REQUEST, format!("{e:#}")),
    };

    match app.commands.try_send(cmd.clone()) {
        Ok(()) => {
            info!(?cmd, "command via http");
            app.status.write().await.record_command(format!("http: {cmd:?}"));
            (StatusCode::ACCEPTED, Json(json!({ "accepted": format!("{cmd:?}") }))).into_response()
        }
        Err(TrySendError::Full(_)) => {
            error_json(StatusCode::SERVICE_UNAVAILABLE, "command queue full".to_string())
        }
        Err(TrySendError::Closed(_)) => {
            error_json(StatusCode::SERVICE_UNAVAILABLE, "coordinator stopped".to_string())
        }
    }
}

async fn api_readings(
    State(app): State<AppState>,
    Path(sensor): Path<String>,
    Query(limit): Query<Limit>,
) -> Response {
    match app.db.recent_readings(&sensor, limit.get()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("api readings: {e:#}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

async fn api_waterings(State(app): State<AppState>, Query(limit): Query<Limit>) -> Response {
    match app.db.recent_waterings(limit.get()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("api waterings: {e:#}");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("status api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
