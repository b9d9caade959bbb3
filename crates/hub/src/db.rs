use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::device::{Device, DeviceState};

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

// ---------------------------------------------------------------------------
// Settings rows (wire payloads and stored rows share these shapes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightSchedule {
    pub start_hour: i64,
    pub start_minute: i64,
    pub end_hour: i64,
    pub end_minute: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpSchedule {
    pub first_irrigation_hour: i64,
    pub first_irrigation_minute: i64,
    pub second_irrigation_hour: i64,
    pub second_irrigation_minute: i64,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningThresholds {
    pub temperature_low: f64,
    pub temperature_high: f64,
    pub humidity_low: f64,
    pub humidity_high: f64,
    pub co2_low: f64,
    pub co2_high: f64,
    pub soil_moisture_low: f64,
    pub soil_moisture_high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightIntensity {
    pub intensity: i64,
}

impl Default for PumpSchedule {
    /// The built-in schedule used until an operator stores one: 07:00 and
    /// 19:00, pump held on for 60 seconds.
    fn default() -> Self {
        PumpSchedule {
            first_irrigation_hour: 7,
            first_irrigation_minute: 0,
            second_irrigation_hour: 19,
            second_irrigation_minute: 0,
            duration_seconds: 60,
        }
    }
}

impl PumpSchedule {
    /// How long the pump is held on per trigger.
    pub fn run_for(&self) -> Duration {
        Duration::from_secs(self.duration_seconds.max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Payload validation
// ---------------------------------------------------------------------------

fn check_range(errors: &mut Vec<String>, field: &str, value: i64, min: i64, max: i64) {
    if !(min..=max).contains(&value) {
        errors.push(format!("{field} {value} out of range [{min}, {max}]"));
    }
}

fn check_pair(errors: &mut Vec<String>, low_field: &str, high_field: &str, low: f64, high: f64) {
    if low > high {
        errors.push(format!("{low_field} ({low}) exceeds {high_field} ({high})"));
    }
}

fn collect(errors: Vec<String>) -> Result<(), String> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

impl LightSchedule {
    /// Range-check every field; reports all violations, not just the first.
    /// An end before the start is legal: overnight grow-light spans wrap
    /// past midnight.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        check_range(&mut errors, "startHour", self.start_hour, 0, 23);
        check_range(&mut errors, "startMinute", self.start_minute, 0, 59);
        check_range(&mut errors, "endHour", self.end_hour, 0, 23);
        check_range(&mut errors, "endMinute", self.end_minute, 0, 59);
        collect(errors)
    }
}

impl PumpSchedule {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        check_range(&mut errors, "firstIrrigationHour", self.first_irrigation_hour, 0, 23);
        check_range(&mut errors, "firstIrrigationMinute", self.first_irrigation_minute, 0, 59);
        check_range(&mut errors, "secondIrrigationHour", self.second_irrigation_hour, 0, 23);
        check_range(&mut errors, "secondIrrigationMinute", self.second_irrigation_minute, 0, 59);
        check_range(&mut errors, "durationSeconds", self.duration_seconds, 1, 3600);
        collect(errors)
    }
}

impl WarningThresholds {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        check_pair(&mut errors, "temperatureLow", "temperatureHigh", self.temperature_low, self.temperature_high);
        check_pair(&mut errors, "humidityLow", "humidityHigh", self.humidity_low, self.humidity_high);
        check_pair(&mut errors, "co2Low", "co2High", self.co2_low, self.co2_high);
        check_pair(&mut errors, "soilMoistureLow", "soilMoistureHigh", self.soil_moisture_low, self.soil_moisture_high);
        collect(errors)
    }
}

impl LightIntensity {
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();
        check_range(&mut errors, "intensity", self.intensity, 0, 100);
        collect(errors)
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

impl Db {
    /// db_url examples:
    /// - "sqlite:greenhouse.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    ///
    /// The pool holds exactly one connection: concurrent read-modify-write
    /// upserts serialize on it, and a `sqlite::memory:` database stays
    /// visible to every caller.
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device states
    // ----------------------------

    /// Insert an OFF row for any device that has none yet; existing states
    /// are left alone.
    pub async fn seed_devices(&self) -> Result<()> {
        for device in Device::ALL {
            sqlx::query(
                r#"
                INSERT INTO devices (name, state) VALUES (?, ?)
                ON CONFLICT(name) DO NOTHING
                "#,
            )
            .bind(device.as_str())
            .bind(DeviceState::Off.as_str())
            .execute(&self.pool)
            .await
            .context("seed_devices failed")?;
        }
        Ok(())
    }

    /// Every known device and its current state.
    pub async fn device_states(&self) -> Result<BTreeMap<String, DeviceState>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT name, state FROM devices ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("device_states failed")?;

        rows.into_iter()
            .map(|(name, state)| {
                let parsed = state
                    .parse::<DeviceState>()
                    .map_err(|()| anyhow!("corrupt state {state:?} for device {name:?}"))?;
                Ok((name, parsed))
            })
            .collect()
    }

    /// Atomically set a device's state, returning the previous one (`None`
    /// if the row did not exist). A state *change* emits one log line; a
    /// same-state write is silent.
    pub async fn set_device_state(
        &self,
        device: Device,
        state: DeviceState,
    ) -> Result<Option<DeviceState>> {
        let mut tx = self.pool.begin().await.context("set_device_state begin failed")?;

        let previous: Option<String> =
            sqlx::query_scalar("SELECT state FROM devices WHERE name = ?")
                .bind(device.as_str())
                .fetch_optional(&mut *tx)
                .await
                .context("set_device_state read failed")?;

        sqlx::query(
            r#"
            INSERT INTO devices (name, state) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET state = excluded.state
            "#,
        )
        .bind(device.as_str())
        .bind(state.as_str())
        .execute(&mut *tx)
        .await
        .context("set_device_state write failed")?;

        tx.commit().await.context("set_device_state commit failed")?;

        let previous = previous
            .map(|s| {
                s.parse::<DeviceState>()
                    .map_err(|()| anyhow!("corrupt state {s:?} for device {device}"))
            })
            .transpose()?;

        if previous != Some(state) {
            info!(device = %device, state = %state, "device state changed");
        }
        Ok(previous)
    }

    /// Current state of one device, `None` if never seeded.
    pub async fn device_state(&self, device: Device) -> Result<Option<DeviceState>> {
        let row: Option<String> = sqlx::query_scalar("SELECT state FROM devices WHERE name = ?")
            .bind(device.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("device_state failed")?;

        row.map(|s| {
            s.parse::<DeviceState>()
                .map_err(|()| anyhow!("corrupt state {s:?} for device {device}"))
        })
        .transpose()
    }

    // ----------------------------
    // Light schedule (latest row wins)
    // ----------------------------

    pub async fn insert_light_schedule(&self, s: &LightSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO light_schedules (start_hour, start_minute, end_hour, end_minute)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(s.start_hour)
        .bind(s.start_minute)
        .bind(s.end_hour)
        .bind(s.end_minute)
        .execute(&self.pool)
        .await
        .context("insert_light_schedule failed")?;
        Ok(())
    }

    pub async fn latest_light_schedule(&self) -> Result<Option<LightSchedule>> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            r#"
            SELECT start_hour, start_minute, end_hour, end_minute
            FROM light_schedules
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_light_schedule failed")?;

        Ok(row.map(|(start_hour, start_minute, end_hour, end_minute)| LightSchedule {
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        }))
    }

    // ----------------------------
    // Pump schedule (latest row wins)
    // ----------------------------

    pub async fn insert_pump_schedule(&self, s: &PumpSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pump_schedules (
              first_irrigation_hour, first_irrigation_minute,
              second_irrigation_hour, second_irrigation_minute,
              duration_seconds
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(s.first_irrigation_hour)
        .bind(s.first_irrigation_minute)
        .bind(s.second_irrigation_hour)
        .bind(s.second_irrigation_minute)
        .bind(s.duration_seconds)
        .execute(&self.pool)
        .await
        .context("insert_pump_schedule failed")?;
        Ok(())
    }

    pub async fn latest_pump_schedule(&self) -> Result<Option<PumpSchedule>> {
        let row = sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
            r#"
            SELECT first_irrigation_hour, first_irrigation_minute,
                   second_irrigation_hour, second_irrigation_minute,
                   duration_seconds
            FROM pump_schedules
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_pump_schedule failed")?;

        Ok(row.map(
            |(
                first_irrigation_hour,
                first_irrigation_minute,
                second_irrigation_hour,
                second_irrigation_minute,
                duration_seconds,
            )| PumpSchedule {
                first_irrigation_hour,
                first_irrigation_minute,
                second_irrigation_hour,
                second_irrigation_minute,
                duration_seconds,
            },
        ))
    }

    /// The schedule the scheduler runs: the latest stored row, or the
    /// built-in default when none has ever been written.
    pub async fn effective_pump_schedule(&self) -> Result<PumpSchedule> {
        Ok(self.latest_pump_schedule().await?.unwrap_or_default())
    }

    // ----------------------------
    // Warning thresholds (latest row wins)
    // ----------------------------

    pub async fn insert_warning_thresholds(&self, t: &WarningThresholds) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO warning_thresholds (
              temperature_low, temperature_high,
              humidity_low, humidity_high,
              co2_low, co2_high,
              soil_moisture_low, soil_moisture_high
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(t.temperature_low)
        .bind(t.temperature_high)
        .bind(t.humidity_low)
        .bind(t.humidity_high)
        .bind(t.co2_low)
        .bind(t.co2_high)
        .bind(t.soil_moisture_low)
        .bind(t.soil_moisture_high)
        .execute(&self.pool)
        .await
        .context("insert_warning_thresholds failed")?;
        Ok(())
    }

    pub async fn latest_warning_thresholds(&self) -> Result<Option<WarningThresholds>> {
        let row = sqlx::query_as::<_, (f64, f64, f64, f64, f64, f64, f64, f64)>(
            r#"
            SELECT temperature_low, temperature_high,
                   humidity_low, humidity_high,
                   co2_low, co2_high,
                   soil_moisture_low, soil_moisture_high
            FROM warning_thresholds
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_warning_thresholds failed")?;

        Ok(row.map(
            |(
                temperature_low,
                temperature_high,
                humidity_low,
                humidity_high,
                co2_low,
                co2_high,
                soil_moisture_low,
                soil_moisture_high,
            )| WarningThresholds {
                temperature_low,
                temperature_high,
                humidity_low,
                humidity_high,
                co2_low,
                co2_high,
                soil_moisture_low,
                soil_moisture_high,
            },
        ))
    }

    // ----------------------------
    // Light intensity (latest row wins)
    // ----------------------------

    pub async fn insert_light_intensity(&self, i: &LightIntensity) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO light_intensity (intensity) VALUES (?)
            "#,
        )
        .bind(i.intensity)
        .execute(&self.pool)
        .await
        .context("insert_light_intensity failed")?;
        Ok(())
    }

    pub async fn latest_light_intensity(&self) -> Result<Option<LightIntensity>> {
        let row: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT intensity FROM light_intensity ORDER BY id DESC LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("latest_light_intensity failed")?;

        Ok(row.map(|intensity| LightIntensity { intensity }))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
