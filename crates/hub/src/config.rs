//! Environment-driven runtime configuration.
//!
//! Every variable has a default except the optional API keys, so a bare
//! `greenhouse-hub` starts against a local SQLite file. Validation reports
//! every bad variable at once, not just the first one.

use anyhow::{bail, Result};
use time::UtcOffset;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

pub const DEFAULT_DB_URL: &str = "sqlite:greenhouse.db?mode=rwc";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SENSOR_API_URL: &str = "https://aranet.cloud";
/// Sensor ids polled when `SENSOR_IDS` is unset.
pub const DEFAULT_SENSOR_IDS: &str = "1061612,6305245";
/// Metric ids fetched for the history block when `METRIC_IDS` is unset.
pub const DEFAULT_METRIC_IDS: &str = "1,2,3,4";

// ---------------------------------------------------------------------------
// Config structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub port: u16,
    /// Base URL of the sensor cloud API, without a trailing slash.
    pub sensor_api_url: String,
    pub sensor_api_key: Option<String>,
    pub sensor_ids: Vec<String>,
    pub metric_ids: Vec<String>,
    /// Camera endpoint; unset disables the camera field in `/api/data`.
    pub camera_api_url: Option<String>,
    pub camera_api_key: Option<String>,
    /// Fixed offset applied to UTC when deriving irrigation trigger times.
    pub utc_offset: UtcOffset,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from a variable lookup. Returns `Ok` or an error
    /// describing every violation found (not just the first one).
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut errors: Vec<String> = Vec::new();

        let db_url = get("DB_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DB_URL.to_string());

        let port = match get("PORT") {
            Some(raw) => parse_port(&raw).unwrap_or_else(|e| {
                errors.push(format!("PORT: {e}"));
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };

        let sensor_api_url = base_url(
            &get("SENSOR_API_URL").unwrap_or_else(|| DEFAULT_SENSOR_API_URL.to_string()),
        )
        .unwrap_or_else(|e| {
            errors.push(format!("SENSOR_API_URL: {e}"));
            DEFAULT_SENSOR_API_URL.to_string()
        });

        let sensor_ids = parse_id_list(
            &get("SENSOR_IDS").unwrap_or_else(|| DEFAULT_SENSOR_IDS.to_string()),
        )
        .unwrap_or_else(|e| {
            errors.push(format!("SENSOR_IDS: {e}"));
            Vec::new()
        });

        let metric_ids = parse_id_list(
            &get("METRIC_IDS").unwrap_or_else(|| DEFAULT_METRIC_IDS.to_string()),
        )
        .unwrap_or_else(|e| {
            errors.push(format!("METRIC_IDS: {e}"));
            Vec::new()
        });

        let camera_api_url = match get("CAMERA_API_URL").filter(|v| !v.trim().is_empty()) {
            Some(raw) => match base_url(&raw) {
                Ok(url) => Some(url),
                Err(e) => {
                    errors.push(format!("CAMERA_API_URL: {e}"));
                    None
                }
            },
            None => None,
        };

        let utc_offset = match get("TZ_OFFSET").filter(|v| !v.trim().is_empty()) {
            Some(raw) => parse_utc_offset(&raw).unwrap_or_else(|e| {
                errors.push(format!("TZ_OFFSET: {e}"));
                UtcOffset::UTC
            }),
            None => UtcOffset::UTC,
        };

        if !errors.is_empty() {
            bail!(
                "environment validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }

        Ok(Config {
            db_url,
            port,
            sensor_api_url,
            sensor_api_key: get("SENSOR_API_KEY").filter(|v| !v.trim().is_empty()),
            sensor_ids,
            metric_ids,
            camera_api_url,
            camera_api_key: get("CAMERA_API_KEY").filter(|v| !v.trim().is_empty()),
            utc_offset,
        })
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.trim().parse::<u16>() {
        Ok(0) => Err("port 0 is not listenable".to_string()),
        Ok(p) => Ok(p),
        Err(_) => Err(format!("{raw:?} is not a port number")),
    }
}

/// Comma-separated id list; blank entries are dropped, an all-blank list is
/// an error.
fn parse_id_list(raw: &str) -> Result<Vec<String>, String> {
    let ids: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if ids.is_empty() {
        Err(format!("{raw:?} contains no ids"))
    } else {
        Ok(ids)
    }
}

/// Normalize a base URL: require an http(s) scheme, strip trailing slashes
/// so path concatenation stays predictable.
fn base_url(raw: &str) -> Result<String, String> {
    let url = raw.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Err(format!("{raw:?} is not an http(s) URL"))
    }
}

/// Parse a `+HH:MM` / `-HH:MM` offset string.
fn parse_utc_offset(raw: &str) -> Result<UtcOffset, String> {
    let s = raw.trim();
    let (negative, rest) = if let Some(r) = s.strip_prefix('+') {
        (false, r)
    } else if let Some(r) = s.strip_prefix('-') {
        (true, r)
    } else {
        return Err(format!("{s:?} must start with '+' or '-'"));
    };

    let (h, m) = rest
        .split_once(':')
        .ok_or_else(|| format!("{s:?} is not in +HH:MM form"))?;
    let hours: i8 = h
        .parse()
        .map_err(|_| format!("offset hours {h:?} are not a number"))?;
    let minutes: i8 = m
        .parse()
        .map_err(|_| format!("offset minutes {m:?} are not a number"))?;

    if !(0..=23).contains(&hours) {
        return Err(format!("offset hours {hours} out of range [0, 23]"));
    }
    if !(0..=59).contains(&minutes) {
        return Err(format!("offset minutes {minutes} out of range [0, 59]"));
    }

    let (hours, minutes) = if negative {
        (-hours, -minutes)
    } else {
        (hours, minutes)
    };
    UtcOffset::from_hms(hours, minutes, 0).map_err(|e| e.to_string())
}

// ===========================================================================
// Tests
// ===========================================================================
