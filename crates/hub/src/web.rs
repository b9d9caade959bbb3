//! HTTP surface: device control, settings, and the aggregated dashboard
//! payload. Every response body is JSON; every response carries permissive
//! CORS headers for the dashboard front end.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;

use crate::db::{Db, LightIntensity, LightSchedule, PumpSchedule, WarningThresholds};
use crate::device::{Device, DeviceState};
use crate::error::ApiError;
use crate::gateway::Gateway;
use crate::scheduler::SchedulerHandle;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub scheduler: SchedulerHandle,
    pub gateway: Gateway,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/device-states", get(get_device_states))
        .route("/api/update-device-state", post(update_device_state))
        .route("/api/light-schedule", get(get_light_schedule).post(post_light_schedule))
        .route("/api/pump-schedule", get(get_pump_schedule).post(post_pump_schedule))
        .route(
            "/api/warning-thresholds",
            get(get_warning_thresholds).post(post_warning_thresholds),
        )
        .route("/api/light-intensity", get(get_light_intensity).post(post_light_intensity))
        .route("/api/data", get(get_data))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Permissive CORS on every response; preflights are answered here and
/// never reach the routes.
async fn cors(req: Request, next: Next) -> Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Origin, X-Requested-With, Content-Type, Accept"),
    );
    if preflight {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, OPTIONS"),
        );
    }
    response
}

// ---------------------------------------------------------------------------
// Device control
// ---------------------------------------------------------------------------

async fn get_device_states(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<String, DeviceState>>, ApiError> {
    Ok(Json(state.db.device_states().await?))
}

/// Writes one device state. Flipping `automation` to ON (from anything
/// else) is the sole arming trigger; OFF performs no synchronous cancel,
/// the scheduler observes it on its next wake.
async fn update_device_state(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let device: Device = body
        .get("device")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or(ApiError::InvalidDevice)?;
    let requested: DeviceState = body
        .get("state")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .ok_or(ApiError::InvalidState)?;

    let previous = state.db.set_device_state(device, requested).await?;

    if device == Device::Automation
        && requested == DeviceState::On
        && previous != Some(DeviceState::On)
    {
        state.scheduler.arm();
    }

    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn parse_payload<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

async fn get_light_schedule(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.db.latest_light_schedule().await?)))
}

async fn post_light_schedule(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let schedule: LightSchedule = parse_payload(body)?;
    schedule.validate().map_err(ApiError::InvalidRequest)?;
    state.db.insert_light_schedule(&schedule).await?;
    Ok(Json(json!({ "success": true })))
}

/// The pump schedule always reads back as something runnable: the stored
/// row, or the built-in default the scheduler would use anyway.
async fn get_pump_schedule(State(state): State<AppState>) -> Result<Json<PumpSchedule>, ApiError> {
    Ok(Json(state.db.effective_pump_schedule().await?))
}

async fn post_pump_schedule(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let schedule: PumpSchedule = parse_payload(body)?;
    schedule.validate().map_err(ApiError::InvalidRequest)?;
    state.db.insert_pump_schedule(&schedule).await?;
    Ok(Json(json!({ "success": true })))
}

async fn get_warning_thresholds(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.db.latest_warning_thresholds().await?)))
}

async fn post_warning_thresholds(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let thresholds: WarningThresholds = parse_payload(body)?;
    thresholds.validate().map_err(ApiError::InvalidRequest)?;
    state.db.insert_warning_thresholds(&thresholds).await?;
    Ok(Json(json!({ "success": true })))
}

async fn get_light_intensity(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!(state.db.latest_light_intensity().await?)))
}

async fn post_light_intensity(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let intensity: LightIntensity = parse_payload(body)?;
    intensity.validate().map_err(ApiError::InvalidRequest)?;
    state.db.insert_light_intensity(&intensity).await?;
    Ok(Json(json!({ "success": true })))
}

// ---------------------------------------------------------------------------
// Aggregated dashboard data
// ---------------------------------------------------------------------------

async fn get_data(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.gateway.fetch_dashboard().await?))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind port {port}"))?;

    info!(%addr, "api listening");

    axum::serve(listener, router(state))
        .await
        .context("server error")?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
