//! Irrigation scheduler: runs the pump twice a day while the `automation`
//! device is ON.
//!
//! One task owns the whole loop; the API never talks to it directly except
//! through [`SchedulerHandle::arm`], which nudges a `Notify`. Arming while
//! already armed is a no-op, and a stale wake permit is harmless: every wake
//! re-reads the store and acts on what it finds there. Disarming is likewise
//! observed, not delivered — a pending wake may fire once after `automation`
//! goes OFF, sees OFF, and stops.
//!
//! ## State machine
//!
//! ```text
//! Disarmed ──arm──▶ Rearming ──▶ Waiting ──wake, ON──▶ Watering
//!    ▲                 ▲            │                     │
//!    │                 └──pump OFF──┼─────────────────────┘
//!    └─────wake, not ON─────────────┘
//! ```
//!
//! Storage failures never kill the loop: the step is logged and retried
//! after a fixed backoff. A failure while arming or starting the pump
//! restarts the whole arm cycle (the missed trigger is skipped); a failure
//! while writing pump OFF retries the OFF write itself so a running pump is
//! never abandoned until the next cycle.

use std::sync::Arc;
use std::time::Duration;

use time::{OffsetDateTime, Time, UtcOffset};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::db::{Db, PumpSchedule};
use crate::device::{Device, DeviceState};

/// How long the scheduler waits after a storage failure before retrying.
const RETRY_BACKOFF: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Shared with the API: lets a handler wake a disarmed scheduler.
#[derive(Clone, Default)]
pub struct SchedulerHandle {
    notify: Arc<Notify>,
}

impl SchedulerHandle {
    /// Wake the scheduler so it re-reads the `automation` flag. Safe to call
    /// at any time; redundant calls collapse into a single pending wake.
    pub fn arm(&self) {
        self.notify.notify_one();
    }

    /// Resolves on the next arm request; consumed by the scheduler loop.
    pub(crate) async fn wait_armed(&self) {
        self.notify.notified().await;
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Phase {
    /// Automation is off; block until the API arms us.
    Disarmed,
    /// Compute the next trigger instant at `at` (delayed after a failure).
    Rearming { at: OffsetDateTime },
    /// Armed; sleep until the trigger instant, then re-check automation.
    Waiting {
        until: OffsetDateTime,
        run_for: Duration,
    },
    /// Pump is on; turn it off at `until`.
    Watering { until: OffsetDateTime },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main,
/// exactly once.
pub async fn run(db: Db, handle: SchedulerHandle, offset: UtcOffset) {
    let mut phase = startup_phase(&db).await;
    info!(armed = !matches!(phase, Phase::Disarmed), "scheduler started");

    loop {
        phase = match phase {
            Phase::Disarmed => {
                handle.wait_armed().await;
                check_armed(&db).await
            }
            Phase::Rearming { at } => {
                sleep_until(at).await;
                arm(&db, offset).await
            }
            Phase::Waiting { until, run_for } => {
                sleep_until(until).await;
                wake_and_check(&db, run_for).await
            }
            Phase::Watering { until } => {
                sleep_until(until).await;
                finish_watering(&db).await
            }
        };
    }
}

/// Initial phase from the stored `automation` flag.
async fn startup_phase(db: &Db) -> Phase {
    match db.device_state(Device::Automation).await {
        Ok(Some(DeviceState::On)) => {
            info!("automation on at startup, arming");
            Phase::Rearming {
                at: OffsetDateTime::now_utc(),
            }
        }
        Ok(_) => Phase::Disarmed,
        Err(e) => {
            error!("scheduler: startup automation read failed: {e:#}");
            Phase::Rearming {
                at: OffsetDateTime::now_utc() + RETRY_BACKOFF,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Phase handlers
// ---------------------------------------------------------------------------

/// Disarmed wake: only a stored ON actually arms; anything else means the
/// permit was stale and we keep waiting.
async fn check_armed(db: &Db) -> Phase {
    match db.device_state(Device::Automation).await {
        Ok(Some(DeviceState::On)) => Phase::Rearming {
            at: OffsetDateTime::now_utc(),
        },
        Ok(_) => Phase::Disarmed,
        Err(e) => {
            error!("scheduler: automation read failed: {e:#}");
            Phase::Rearming {
                at: OffsetDateTime::now_utc() + RETRY_BACKOFF,
            }
        }
    }
}

/// Rearming: pick the next trigger from the stored pump schedule (or the
/// built-in default) and start waiting for it.
async fn arm(db: &Db, offset: UtcOffset) -> Phase {
    let schedule = match db.effective_pump_schedule().await {
        Ok(s) => s,
        Err(e) => {
            error!("scheduler: pump schedule read failed: {e:#}");
            return Phase::Rearming {
                at: OffsetDateTime::now_utc() + RETRY_BACKOFF,
            };
        }
    };

    // A stored row predates validation only if the database was edited by
    // hand; never let it produce an absurd pump run.
    let schedule = if schedule.validate().is_ok() {
        schedule
    } else {
        warn!(?schedule, "stored pump schedule invalid, using default");
        PumpSchedule::default()
    };

    let now = OffsetDateTime::now_utc().to_offset(offset);
    let until = next_trigger(now, &schedule);
    let run_for = schedule.run_for();

    info!(trigger = %until, run_sec = run_for.as_secs(), "irrigation trigger scheduled");
    Phase::Waiting { until, run_for }
}

/// Trigger fired: re-check the automation flag before touching the pump.
async fn wake_and_check(db: &Db, run_for: Duration) -> Phase {
    match db.device_state(Device::Automation).await {
        Ok(Some(DeviceState::On)) => {}
        Ok(_) => {
            info!("automation disabled, scheduler disarming");
            return Phase::Disarmed;
        }
        Err(e) => {
            error!("scheduler: automation re-check failed: {e:#}");
            return Phase::Rearming {
                at: OffsetDateTime::now_utc() + RETRY_BACKOFF,
            };
        }
    }

    match db.set_device_state(Device::Pump, DeviceState::On).await {
        Ok(_) => {
            info!(run_sec = run_for.as_secs(), "irrigation started");
            Phase::Watering {
                until: OffsetDateTime::now_utc() + run_for,
            }
        }
        Err(e) => {
            // The missed trigger is skipped; the next one is recomputed.
            error!("scheduler: pump ON write failed: {e:#}");
            Phase::Rearming {
                at: OffsetDateTime::now_utc() + RETRY_BACKOFF,
            }
        }
    }
}

/// Run duration elapsed: write pump OFF and recompute the next trigger.
async fn finish_watering(db: &Db) -> Phase {
    match db.set_device_state(Device::Pump, DeviceState::Off).await {
        Ok(_) => {
            info!("irrigation finished, rearming");
            Phase::Rearming {
                at: OffsetDateTime::now_utc(),
            }
        }
        Err(e) => {
            // Keep retrying the OFF write; the pump must not stay on until
            // the next cycle.
            error!("scheduler: pump OFF write failed: {e:#}");
            Phase::Watering {
                until: OffsetDateTime::now_utc() + RETRY_BACKOFF,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger arithmetic
// ---------------------------------------------------------------------------

/// Hours/minutes are validated before storage; clamping keeps a corrupt row
/// from panicking here.
fn schedule_time(hour: i64, minute: i64) -> Time {
    Time::from_hms(hour.clamp(0, 23) as u8, minute.clamp(0, 59) as u8, 0)
        .unwrap_or(Time::MIDNIGHT)
}

fn next_occurrence(now: OffsetDateTime, at: Time) -> OffsetDateTime {
    let candidate = now.replace_time(at);
    if candidate > now {
        candidate
    } else {
        candidate + time::Duration::days(1)
    }
}

/// The next occurrence of either irrigation time strictly in the future of
/// `now`. A trigger landing exactly on `now` counts as passed.
fn next_trigger(now: OffsetDateTime, schedule: &PumpSchedule) -> OffsetDateTime {
    let first = schedule_time(schedule.first_irrigation_hour, schedule.first_irrigation_minute);
    let second = schedule_time(schedule.second_irrigation_hour, schedule.second_irrigation_minute);
    next_occurrence(now, first).min(next_occurrence(now, second))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Sleep until a wall-clock instant; already-passed instants return at once.
async fn sleep_until(at: OffsetDateTime) {
    let remaining = Duration::try_from(at - OffsetDateTime::now_utc()).unwrap_or_default();
    tokio::time::sleep(remaining).await;
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sched(h1: i64, m1: i64, h2: i64, m2: i64, duration: i64) -> PumpSchedule {
        PumpSchedule {
            first_irrigation_hour: h1,
            first_irrigation_minute: m1,
            second_irrigation_hour: h2,
            second_irrigation_minute: m2,
            duration_seconds: duration,
        }
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.seed_devices().await.unwrap();
        db
    }

    async fn armed_db() -> Db {
        let db = test_db().await;
        db.set_device_state(Device::Automation, DeviceState::On)
            .await
            .unwrap();
        db
    }

    // -- Trigger derivation ------------------------------------------------

    #[test]
    fn trigger_before_first_fires_same_morning() {
        let now = datetime!(2024-03-15 5:00 UTC);
        let next = next_trigger(now, &PumpSchedule::default());
        assert_eq!(next, datetime!(2024-03-15 7:00 UTC));
    }

    #[test]
    fn trigger_midday_picks_the_evening_run() {
        let now = datetime!(2024-03-15 12:00 UTC);
        let next = next_trigger(now, &PumpSchedule::default());
        assert_eq!(next, datetime!(2024-03-15 19:00 UTC));
    }

    #[test]
    fn trigger_after_second_rolls_to_next_morning() {
        let now = datetime!(2024-03-15 20:00 UTC);
        let next = next_trigger(now, &PumpSchedule::default());
        assert_eq!(next, datetime!(2024-03-16 7:00 UTC));
    }

    #[test]
    fn trigger_exactly_on_first_counts_as_passed() {
        let now = datetime!(2024-03-15 7:00 UTC);
        let next = next_trigger(now, &PumpSchedule::default());
        assert_eq!(next, datetime!(2024-03-15 19:00 UTC));
    }

    #[test]
    fn trigger_one_minute_before_second_still_fires_it() {
        let now = datetime!(2024-03-15 18:59 UTC);
        let next = next_trigger(now, &PumpSchedule::default());
        assert_eq!(next, datetime!(2024-03-15 19:00 UTC));
    }

    #[test]
    fn trigger_honors_custom_times() {
        let custom = sched(6, 30, 18, 45, 120);
        let now = datetime!(2024-03-15 10:00 UTC);
        assert_eq!(next_trigger(now, &custom), datetime!(2024-03-15 18:45 UTC));

        let now = datetime!(2024-03-15 19:00 UTC);
        assert_eq!(next_trigger(now, &custom), datetime!(2024-03-16 6:30 UTC));
    }

    #[test]
    fn trigger_order_of_times_does_not_matter() {
        let swapped = sched(19, 0, 7, 0, 60);
        let now = datetime!(2024-03-15 5:00 UTC);
        assert_eq!(next_trigger(now, &swapped), datetime!(2024-03-15 7:00 UTC));
    }

    #[test]
    fn trigger_rolls_over_month_and_year() {
        let now = datetime!(2024-01-31 20:00 UTC);
        assert_eq!(
            next_trigger(now, &PumpSchedule::default()),
            datetime!(2024-02-01 7:00 UTC)
        );

        let now = datetime!(2024-12-31 20:00 UTC);
        assert_eq!(
            next_trigger(now, &PumpSchedule::default()),
            datetime!(2025-01-01 7:00 UTC)
        );
    }

    #[test]
    fn trigger_keeps_the_local_offset() {
        let now = datetime!(2024-06-10 5:00 +2);
        let next = next_trigger(now, &PumpSchedule::default());
        assert_eq!(next, datetime!(2024-06-10 7:00 +2));
    }

    // -- Startup -----------------------------------------------------------

    #[tokio::test]
    async fn startup_arms_when_automation_on() {
        let db = armed_db().await;
        assert!(matches!(startup_phase(&db).await, Phase::Rearming { .. }));
    }

    #[tokio::test]
    async fn startup_disarmed_when_automation_off() {
        let db = test_db().await;
        assert!(matches!(startup_phase(&db).await, Phase::Disarmed));
    }

    #[tokio::test]
    async fn startup_disarmed_when_automation_never_seeded() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        assert!(matches!(startup_phase(&db).await, Phase::Disarmed));
    }

    // -- Disarmed wake -----------------------------------------------------

    #[tokio::test]
    async fn wake_with_automation_on_starts_the_arm_cycle() {
        let db = armed_db().await;
        assert!(matches!(check_armed(&db).await, Phase::Rearming { .. }));
    }

    #[tokio::test]
    async fn stale_wake_permit_stays_disarmed() {
        let db = test_db().await;
        assert!(matches!(check_armed(&db).await, Phase::Disarmed));
    }

    // -- Arming ------------------------------------------------------------

    #[tokio::test]
    async fn arm_uses_the_default_schedule_when_none_stored() {
        let db = armed_db().await;
        let before = OffsetDateTime::now_utc();

        let Phase::Waiting { until, run_for } = arm(&db, UtcOffset::UTC).await else {
            panic!("expected Waiting");
        };
        assert_eq!(run_for, Duration::from_secs(60));
        assert!(until > before);
        assert!([7, 19].contains(&until.hour()), "got {until}");
        assert_eq!(until.minute(), 0);
    }

    #[tokio::test]
    async fn arm_honors_the_stored_schedule() {
        let db = armed_db().await;
        db.insert_pump_schedule(&sched(6, 30, 18, 45, 120)).await.unwrap();

        let Phase::Waiting { until, run_for } = arm(&db, UtcOffset::UTC).await else {
            panic!("expected Waiting");
        };
        assert_eq!(run_for, Duration::from_secs(120));
        assert!(
            (until.hour() == 6 && until.minute() == 30)
                || (until.hour() == 18 && until.minute() == 45),
            "got {until}"
        );
    }

    #[tokio::test]
    async fn arm_falls_back_to_default_on_corrupt_schedule() {
        let db = armed_db().await;
        // Bypasses API validation, as a hand-edited database row would.
        db.insert_pump_schedule(&sched(7, 0, 19, 0, 99_999)).await.unwrap();

        let Phase::Waiting { run_for, .. } = arm(&db, UtcOffset::UTC).await else {
            panic!("expected Waiting");
        };
        assert_eq!(run_for, Duration::from_secs(60));
    }

    // -- Trigger wake ------------------------------------------------------

    #[tokio::test]
    async fn wake_with_automation_on_runs_the_pump() {
        let db = armed_db().await;
        let run_for = Duration::from_secs(60);
        let before = OffsetDateTime::now_utc();

        let Phase::Watering { until } = wake_and_check(&db, run_for).await else {
            panic!("expected Watering");
        };
        assert!(until >= before + run_for);
        assert_eq!(
            db.device_state(Device::Pump).await.unwrap(),
            Some(DeviceState::On)
        );
    }

    #[tokio::test]
    async fn wake_observing_disarm_touches_nothing() {
        let db = test_db().await;
        // Manual pump override stays in place: a disarm wake writes no state.
        db.set_device_state(Device::Pump, DeviceState::On).await.unwrap();

        let phase = wake_and_check(&db, Duration::from_secs(60)).await;

        assert!(matches!(phase, Phase::Disarmed));
        assert_eq!(
            db.device_state(Device::Pump).await.unwrap(),
            Some(DeviceState::On)
        );
    }

    #[tokio::test]
    async fn wake_with_unseeded_automation_disarms() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let phase = wake_and_check(&db, Duration::from_secs(60)).await;

        assert!(matches!(phase, Phase::Disarmed));
        assert_eq!(db.device_state(Device::Pump).await.unwrap(), None);
    }

    // -- Finishing ---------------------------------------------------------

    #[tokio::test]
    async fn finish_turns_pump_off_and_rearms_at_once() {
        let db = armed_db().await;
        db.set_device_state(Device::Pump, DeviceState::On).await.unwrap();

        let Phase::Rearming { at } = finish_watering(&db).await else {
            panic!("expected Rearming");
        };
        assert!(at <= OffsetDateTime::now_utc());
        assert_eq!(
            db.device_state(Device::Pump).await.unwrap(),
            Some(DeviceState::Off)
        );
    }

    #[tokio::test]
    async fn fired_trigger_cycles_pump_once_and_rearms() {
        let db = armed_db().await;

        // Trigger fires: pump goes on.
        let phase = wake_and_check(&db, Duration::from_secs(60)).await;
        assert!(matches!(phase, Phase::Watering { .. }));
        assert_eq!(
            db.device_state(Device::Pump).await.unwrap(),
            Some(DeviceState::On)
        );

        // Run duration elapses: pump goes off exactly once.
        let phase = finish_watering(&db).await;
        assert!(matches!(phase, Phase::Rearming { .. }));
        assert_eq!(
            db.device_state(Device::Pump).await.unwrap(),
            Some(DeviceState::Off)
        );

        // And the cycle re-arms without any intervention.
        let phase = arm(&db, UtcOffset::UTC).await;
        assert!(matches!(phase, Phase::Waiting { .. }));
    }
}
