//! Fan-out client for the sensor cloud and camera APIs behind `GET /api/data`.
//!
//! One parametrized client replaces per-sensor copies of the same fetch:
//! every configured sensor id gets a last-measurement call plus one history
//! call per configured metric id, all in flight concurrently. Sensor
//! failures fail the whole aggregate; a camera failure only drops that field
//! to `null`.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::warn;

use crate::config::Config;
use crate::error::ApiError;

/// Bound on every outbound call, applied client-wide.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("malformed upstream body: {0}")]
    Malformed(String),

    #[error("upstream fetch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Upstream(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Normalized history readings
// ---------------------------------------------------------------------------

/// One history entry, reduced to the two fields the dashboard plots. Extra
/// upstream fields are dropped; `time` and `value` pass through untyped
/// since the cloud API mixes epoch and string timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub time: Value,
    pub value: Value,
}

/// Accepts either a plain array of readings or an object wrapping one under
/// `"readings"`; anything else is a malformed body.
fn normalize_history(body: Value) -> Result<Vec<Reading>, GatewayError> {
    let entries = match body {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => match obj.remove("readings") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(GatewayError::Malformed(
                    "history body has no readings array".to_string(),
                ))
            }
        },
        other => {
            return Err(GatewayError::Malformed(format!(
                "history body is not an array or object: {other}"
            )))
        }
    };

    serde_json::from_value(Value::Array(entries))
        .map_err(|e| GatewayError::Malformed(format!("history entry: {e}")))
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Gateway {
    client: reqwest::Client,
    sensor_api_url: String,
    sensor_api_key: Option<String>,
    sensor_ids: Vec<String>,
    metric_ids: Vec<String>,
    camera_api_url: Option<String>,
    camera_api_key: Option<String>,
}

enum Piece {
    Latest { idx: usize, body: Value },
    History { idx: usize, metric: String, readings: Vec<Reading> },
}

impl Gateway {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()
            .context("failed to build upstream http client")?;

        Ok(Self {
            client,
            sensor_api_url: cfg.sensor_api_url.clone(),
            sensor_api_key: cfg.sensor_api_key.clone(),
            sensor_ids: cfg.sensor_ids.clone(),
            metric_ids: cfg.metric_ids.clone(),
            camera_api_url: cfg.camera_api_url.clone(),
            camera_api_key: cfg.camera_api_key.clone(),
        })
    }

    /// The merged `/api/data` payload: per-sensor latest measurements keyed
    /// `sensor1..sensorN` (positional, the order of `SENSOR_IDS`), a
    /// `history` block keyed the same way, and the camera shot or `null`.
    pub async fn fetch_dashboard(&self) -> Result<Value, GatewayError> {
        let camera = tokio::spawn({
            let gw = self.clone();
            async move { gw.camera_snapshot().await }
        });

        let mut set: JoinSet<Result<Piece, GatewayError>> = JoinSet::new();
        for (idx, sensor_id) in self.sensor_ids.iter().enumerate() {
            let gw = self.clone();
            let id = sensor_id.clone();
            set.spawn(async move {
                Ok(Piece::Latest {
                    idx,
                    body: gw.latest(&id).await?,
                })
            });

            for metric_id in &self.metric_ids {
                let gw = self.clone();
                let id = sensor_id.clone();
                let metric = metric_id.clone();
                set.spawn(async move {
                    let readings = gw.history(&id, &metric).await?;
                    Ok(Piece::History { idx, metric, readings })
                });
            }
        }

        let mut payload = Map::new();
        let mut history: Map<String, Value> = Map::new();
        while let Some(joined) = set.join_next().await {
            match joined?? {
                Piece::Latest { idx, body } => {
                    payload.insert(format!("sensor{}", idx + 1), body);
                }
                Piece::History { idx, metric, readings } => {
                    let key = format!("sensor{}", idx + 1);
                    let per_sensor = history
                        .entry(key)
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Value::Object(map) = per_sensor {
                        map.insert(metric, serde_json::json!(readings));
                    }
                }
            }
        }

        payload.insert("history".to_string(), Value::Object(history));
        payload.insert(
            "camera".to_string(),
            camera.await.unwrap_or(None).unwrap_or(Value::Null),
        );
        Ok(Value::Object(payload))
    }

    /// Last measurement for one sensor, body passed through as-is.
    async fn latest(&self, sensor_id: &str) -> Result<Value, GatewayError> {
        let url = format!("{}/api/v1/measurements/last", self.sensor_api_url);
        self.get_json(&url, &[("sensor", sensor_id)], self.sensor_api_key.as_deref())
            .await
    }

    /// Measurement history for one sensor/metric pair, normalized.
    async fn history(&self, sensor_id: &str, metric_id: &str) -> Result<Vec<Reading>, GatewayError> {
        let url = format!("{}/api/v1/measurements/history", self.sensor_api_url);
        let body = self
            .get_json(
                &url,
                &[("sensor", sensor_id), ("metric", metric_id)],
                self.sensor_api_key.as_deref(),
            )
            .await?;
        normalize_history(body)
    }

    /// Latest camera shot; `None` when unconfigured or on any failure.
    async fn camera_snapshot(&self) -> Option<Value> {
        let base = self.camera_api_url.as_ref()?;
        let url = format!("{base}/latest");
        match self.get_json(&url, &[], self.camera_api_key.as_deref()).await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("camera fetch failed, dropping field: {e}");
                None
            }
        }
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        api_key: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let mut request = self.client.get(url).query(query);
        if let Some(key) = api_key {
            request = request.header("ApiKey", key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GatewayError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
