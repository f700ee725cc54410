//! The full monitoring cycle: wake if needed, classify the situation, and
//! either reconcile schedules (Condition A) or open a monitoring case
//! (Condition B).

use std::time::Duration;

use chrono::{Timelike, Utc};
use chrono_tz::Europe::Warsaw;
use serde::Serialize;

use super::reconcile::{reconcile, ReconcileOutcome};
use super::WorkerContext;
use crate::pricing::PricingApi;
use crate::schedule;
use crate::snapshot::VehicleSnapshot;
use crate::store::{ActiveCase, StateStore};
use crate::tesla::{ApiError, VehicleApi};

/// Give a just-woken vehicle a moment before asking for full state.
const WAKE_SETTLE: Duration = Duration::from_secs(5);

#[derive(Serialize, Debug)]
pub struct CycleOutcome {
    pub result: String,
    pub action: String,
    /// The one mandatory log line per cycle.
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

/// Run one cycle. `forced_wake` is the midnight-wake variant: wake first no
/// matter what, then evaluate as usual.
pub async fn run_cycle(ctx: &WorkerContext, reason: &str, forced_wake: bool) -> CycleOutcome {
    tracing::info!(reason, forced_wake, "starting monitoring cycle");
    let vin = ctx.config.charging.vin.clone();

    // A worker invocation is rare and expensive; spending it on a sleeping
    // vehicle is strictly worse than always waking first.
    let probe = match ctx.vehicle.get_snapshot(false).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::error!(error = %err, "initial snapshot failed");
            return emit(&vin, "failed", "none", None, None);
        }
    };

    let mut woke = false;
    if !probe.online || forced_wake {
        woke = true;
        match ctx.vehicle.wake_up().await {
            Ok(()) => {}
            Err(ApiError::WakeTimeout) => {
                tracing::warn!("wake timed out, proceeding with last known state")
            }
            Err(err) => tracing::warn!(error = %err, "wake failed, proceeding"),
        }
        tokio::time::sleep(WAKE_SETTLE).await;
    }

    let snapshot = match ctx.vehicle.get_snapshot(true).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            tracing::error!(error = %err, "full snapshot failed");
            return emit(&vin, "failed", "none", None, None);
        }
    };

    metrics::gauge!("vehicle_battery_percent", snapshot.battery_percent as f64);
    metrics::gauge!(
        "vehicle_charging_ready",
        if snapshot.is_charging_ready { 1.0 } else { 0.0 }
    );
    metrics::gauge!("vehicle_at_home", if snapshot.at_home() { 1.0 } else { 0.0 });

    // A special-charging session in its window owns the vehicle; the regular
    // engine stays out until cleanup has run.
    let now = Utc::now();
    let blocking_session = match ctx.store.list_sessions().await {
        Ok(sessions) => sessions.into_iter().any(|s| {
            s.vin == vin
                && (s.status == crate::store::SessionStatus::Active
                    || (!s.status.is_terminal()
                        && s.planned_charge_start <= now
                        && now <= s.planned_charge_end))
        }),
        Err(err) => {
            tracing::error!(error = %err, "listing sessions failed");
            return emit(&vin, "failed", "none", Some(&snapshot), None);
        }
    };
    if blocking_session {
        return emit(
            &vin,
            "skipped",
            if woke { "woken" } else { "none" },
            Some(&snapshot),
            Some("special charging in progress"),
        );
    }

    if snapshot.online && snapshot.at_home() && snapshot.is_charging_ready {
        return condition_a(ctx, &vin, &snapshot, woke).await;
    }

    if snapshot.online && snapshot.at_home() && !snapshot.is_charging_ready {
        match ctx.store.load_active_case(&vin).await {
            Ok(None) => {
                let case = ActiveCase {
                    vin: vin.clone(),
                    start_timestamp: now,
                    last_battery: snapshot.battery_percent,
                    last_ready: false,
                };
                if let Err(err) = ctx.store.save_active_case(&case).await {
                    tracing::error!(error = %err, "persisting monitoring case failed");
                    return emit(&vin, "failed", "none", Some(&snapshot), None);
                }
                tracing::info!("vehicle home but not ready, monitoring case opened");
                return emit(&vin, "ok", "condition_b_started", Some(&snapshot), None);
            }
            Ok(Some(_)) => {
                tracing::debug!("monitoring case already open");
            }
            Err(err) => {
                tracing::error!(error = %err, "loading monitoring case failed");
                return emit(&vin, "failed", "none", Some(&snapshot), None);
            }
        }
    }

    // A wake-driven re-check that ends with the vehicle away, asleep again
    // or ready settles any open monitoring case; the not-ready branch above
    // keeps its case open instead.
    if woke && !(snapshot.online && snapshot.at_home() && !snapshot.is_charging_ready) {
        if let Err(err) = ctx.store.clear_active_case(&vin).await {
            tracing::warn!(error = %err, "clearing monitoring case failed");
        }
    }

    emit(
        &vin,
        "ok",
        if woke { "woken" } else { "none" },
        Some(&snapshot),
        None,
    )
}

async fn condition_a(
    ctx: &WorkerContext,
    vin: &str,
    snapshot: &VehicleSnapshot,
    woke: bool,
) -> CycleOutcome {
    let windows = match ctx.pricing.fetch_windows(snapshot.battery_percent).await {
        Ok(windows) => windows,
        Err(err) => {
            tracing::error!(error = %err, "pricing service unavailable");
            return emit(vin, "failed", "none", Some(snapshot), None);
        }
    };

    let cached = match ctx.store.load_fingerprint(vin).await {
        Ok(cached) => cached,
        Err(err) => {
            tracing::error!(error = %err, "loading fingerprint failed");
            return emit(vin, "failed", "none", Some(snapshot), None);
        }
    };

    // "No charging recommended" never means "remove everything": an empty
    // answer keeps whatever the vehicle already has.
    let empty_fingerprint = schedule::fingerprint_specs(&[]);
    if windows.is_empty() && cached.as_deref() != Some(empty_fingerprint.as_str()) {
        tracing::info!("pricing returned no windows; keeping existing schedules");
        let _ = ctx.store.clear_active_case(vin).await;
        return emit(
            vin,
            "ok",
            if woke { "woken" } else { "none" },
            Some(snapshot),
            None,
        );
    }

    let action = match reconcile(
        ctx.vehicle.as_ref(),
        ctx.store.as_ref(),
        &ctx.config.home,
        vin,
        &windows,
    )
    .await
    {
        Ok(ReconcileOutcome::Applied {
            added,
            removed,
            dropped_overlaps,
        }) => {
            tracing::info!(added, removed, dropped_overlaps, "schedules reconciled");
            "reconciled"
        }
        Ok(ReconcileOutcome::Unchanged) => {
            if woke {
                "woken"
            } else {
                "none"
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "reconciliation failed");
            return emit(vin, "failed", "none", Some(snapshot), None);
        }
    };

    // The vehicle proved it can charge; any open not-ready case is stale.
    if let Err(err) = ctx.store.clear_active_case(vin).await {
        tracing::warn!(error = %err, "clearing monitoring case failed");
    }

    emit(vin, "ok", action, Some(snapshot), None)
}

/// Build the outcome and emit the mandatory per-cycle summary line.
fn emit(
    vin: &str,
    result: &str,
    action: &str,
    snapshot: Option<&VehicleSnapshot>,
    skipped: Option<&str>,
) -> CycleOutcome {
    let local = Utc::now().with_timezone(&Warsaw);
    let tail = &vin[vin.len().saturating_sub(4)..];
    let (battery, ready, location) = match snapshot {
        Some(s) => (
            s.battery_percent,
            if s.is_charging_ready { "y" } else { "n" },
            s.location_status.to_string(),
        ),
        None => (0, "n", "UNKNOWN".to_string()),
    };

    let summary = format!(
        "[{:02}:{:02} local] result={} VIN={} battery={}% ready={} location={} action={}",
        local.hour(),
        local.minute(),
        result,
        tail,
        battery,
        ready,
        location,
        action
    );
    tracing::info!("{}", summary);

    CycleOutcome {
        result: result.to_string(),
        action: action.to_string(),
        summary,
        skipped: skipped.map(String::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::DesiredWindow;
    use crate::store::{Session, SessionStatus, StateStore};
    use crate::worker::testing::{harness_with, FakeVehicle, Op};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::Ordering;

    fn window(h1: u32, h2: u32) -> DesiredWindow {
        DesiredWindow {
            start: Warsaw
                .with_ymd_and_hms(2025, 1, 22, h1, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
            end: Warsaw
                .with_ymd_and_hms(2025, 1, 22, h2, 0, 0)
                .unwrap()
                .with_timezone(&Utc),
            charge_amount_kwh: 5.0,
        }
    }

    fn active_session(vin: &str) -> Session {
        let now = Utc::now();
        Session {
            session_id: "special_2_20250122_0700".to_string(),
            vin: vin.to_string(),
            target_percent: 85,
            target_datetime: now + ChronoDuration::hours(6),
            planned_charge_start: now - ChronoDuration::hours(1),
            planned_charge_end: now + ChronoDuration::hours(2),
            send_at: now - ChronoDuration::hours(2),
            original_charge_limit: Some(80),
            send_job_name: "special-charging-x".to_string(),
            cleanup_job_name: "special-cleanup-x".to_string(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn offline_vehicle_is_woken_before_anything_else() {
        let mut vehicle = FakeVehicle::default();
        vehicle.online = false.into();
        let h = harness_with(vehicle);
        h.pricing.set_windows(vec![window(1, 3)]);

        let outcome = run_cycle(&h.ctx, "test", false).await;

        let ops = h.vehicle.ops();
        assert_eq!(ops[0], Op::Wake);
        assert_eq!(ops.iter().filter(|op| **op == Op::Wake).count(), 1);
        // Woken and ready at home: the cycle continues into reconciliation.
        assert_eq!(outcome.action, "reconciled");
    }

    #[tokio::test(start_paused = true)]
    async fn condition_a_reconciles_then_holds_steady() {
        let h = harness_with(FakeVehicle::default());
        h.pricing.set_windows(vec![window(22, 23), window(1, 3)]);

        let first = run_cycle(&h.ctx, "Condition A ready", false).await;
        assert_eq!(first.result, "ok");
        assert_eq!(first.action, "reconciled");
        assert_eq!(h.vehicle.schedules.lock().unwrap().len(), 2);

        // Same pricing answer: fingerprint short-circuits, zero writes.
        let ops_before = h.vehicle.ops().len();
        let second = run_cycle(&h.ctx, "Condition A ready", false).await;
        assert_eq!(second.action, "none");
        assert_eq!(h.vehicle.ops().len(), ops_before);
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_skips_reconciliation() {
        let h = harness_with(FakeVehicle::default());
        h.pricing.set_windows(vec![window(1, 3)]);
        h.store
            .save_session(&active_session(&h.ctx.config.charging.vin))
            .await
            .unwrap();

        let outcome = run_cycle(&h.ctx, "Condition A ready", false).await;

        assert_eq!(outcome.result, "skipped");
        assert_eq!(outcome.skipped.as_deref(), Some("special charging in progress"));
        assert!(h.vehicle.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_opens_one_case() {
        let mut vehicle = FakeVehicle::default();
        vehicle.ready = false.into();
        let h = harness_with(vehicle);
        let vin = h.ctx.config.charging.vin.clone();

        let first = run_cycle(&h.ctx, "scout", false).await;
        assert_eq!(first.action, "condition_b_started");
        assert!(h.store.load_active_case(&vin).await.unwrap().is_some());

        let second = run_cycle(&h.ctx, "scout", false).await;
        assert_eq!(second.action, "none");
    }

    #[tokio::test(start_paused = true)]
    async fn becoming_ready_clears_case() {
        let mut vehicle = FakeVehicle::default();
        vehicle.ready = false.into();
        let h = harness_with(vehicle);
        let vin = h.ctx.config.charging.vin.clone();
        h.pricing.set_windows(vec![window(1, 3)]);

        run_cycle(&h.ctx, "scout", false).await;
        assert!(h.store.load_active_case(&vin).await.unwrap().is_some());

        h.vehicle.ready.store(true, Ordering::SeqCst);
        let outcome = run_cycle(&h.ctx, "Condition A ready", false).await;
        assert_eq!(outcome.action, "reconciled");
        assert!(h.store.load_active_case(&vin).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pricing_keeps_existing_schedules() {
        let h = harness_with(FakeVehicle::default());
        let vin = h.ctx.config.charging.vin.clone();
        h.pricing.set_windows(vec![window(22, 23)]);
        run_cycle(&h.ctx, "Condition A ready", false).await;
        let fingerprint = h.store.load_fingerprint(&vin).await.unwrap();

        h.pricing.set_windows(vec![]);
        let outcome = run_cycle(&h.ctx, "Condition A ready", false).await;

        assert_eq!(outcome.result, "ok");
        assert_eq!(outcome.action, "none");
        assert_eq!(h.vehicle.schedules.lock().unwrap().len(), 1);
        assert_eq!(h.store.load_fingerprint(&vin).await.unwrap(), fingerprint);
    }

    #[tokio::test(start_paused = true)]
    async fn pricing_failure_fails_cycle_without_touching_vehicle() {
        let h = harness_with(FakeVehicle::default());
        h.pricing.fail.store(true, Ordering::SeqCst);

        let outcome = run_cycle(&h.ctx, "Condition A ready", false).await;

        assert_eq!(outcome.result, "failed");
        assert!(h.vehicle.ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_timeout_still_completes_cycle() {
        let mut vehicle = FakeVehicle::default();
        vehicle.online = false.into();
        vehicle.wake_times_out = true;
        let h = harness_with(vehicle);

        let outcome = run_cycle(&h.ctx, "midnight", true).await;

        assert_eq!(outcome.result, "ok");
        assert_eq!(outcome.action, "woken");
    }

    #[tokio::test(start_paused = true)]
    async fn summary_line_has_the_mandated_shape() {
        let h = harness_with(FakeVehicle::default());
        h.pricing.set_windows(vec![window(1, 3)]);

        let outcome = run_cycle(&h.ctx, "test", false).await;

        assert!(outcome.summary.contains("result=ok"));
        assert!(outcome.summary.contains("VIN=0000"));
        assert!(outcome.summary.contains("battery=65%"));
        assert!(outcome.summary.contains("ready=y"));
        assert!(outcome.summary.contains("location=HOME"));
        assert!(outcome.summary.contains("action=reconciled"));
        assert!(outcome.summary.starts_with('['));
    }
}
