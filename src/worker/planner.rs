//! Daily planner for ad-hoc "reach X% by T" requests: picks a charging slot
//! around peak hours, persists a session, and materialises the two one-shot
//! jobs that will dispatch and clean it up.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Europe::Warsaw;
use serde::Serialize;

use super::WorkerContext;
use crate::intervals;
use crate::scheduler::{JobSpec, SchedulerClient};
use crate::sheet::{RequestStatus, SheetClient};
use crate::store::{Session, SessionStatus, StateStore};
use crate::tesla::VehicleApi;

/// Margin added to the computed charging time.
const SAFETY_BUFFER_HOURS: f64 = 1.5;
/// The fallback strategy trades most of the margin for feasibility.
const REDUCED_BUFFER_HOURS: f64 = 0.5;
/// Requests further out than this are left for a later planner run.
const PLANNING_HORIZON_HOURS: i64 = 48;
/// How long past its planned end an ACTIVE session may linger before it is
/// declared failed.
const STALE_ACTIVE_GRACE_HOURS: i64 = 2;

/// Candidate slot starts sit on a quarter-hour grid.
const GRID_MINUTES: i64 = 15;

const SEND_JOB_PREFIX: &str = "special-charging-";
const CLEANUP_JOB_PREFIX: &str = "special-cleanup-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Latest peak-free slot that still leaves the full margin.
    Optimal,
    /// An earlier peak-free slot.
    Earlier,
    /// A slot overlapping peaks for at most half its length.
    MinimalCollision,
    /// Start immediately; completion feasible only with the reduced margin.
    Fallback,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Optimal => write!(f, "S1-optimal"),
            Strategy::Earlier => write!(f, "S2-earlier"),
            Strategy::MinimalCollision => write!(f, "S3-minimal-collision"),
            Strategy::Fallback => write!(f, "S4-fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub strategy: Strategy,
    pub peak_collision: f64,
}

/// Pick a charging slot for `required_hours` of charging (full margin
/// included) completing before `target`.
///
/// The cascade: S1 takes the latest grid slot that still finishes by the
/// target, if it is peak-free; S2 walks earlier grid slots looking for a
/// peak-free one; S3 re-walks them accepting up to 50 % peak overlap; S4
/// starts immediately and is accepted if completion is feasible with the
/// reduced margin. `None` means even S4 cannot finish in time.
pub fn select_slot(
    now: DateTime<Utc>,
    target: DateTime<Utc>,
    required_hours: f64,
    reduced_required_hours: f64,
    peaks: &[(NaiveTime, NaiveTime)],
) -> Option<PlannedSlot> {
    let duration = Duration::minutes((required_hours * 60.0).round() as i64);
    let reduced = Duration::minutes((reduced_required_hours * 60.0).round() as i64);
    let latest_start = target - duration;

    let slot = |start: DateTime<Utc>, strategy: Strategy| {
        let range = start..(start + duration);
        PlannedSlot {
            start,
            end: start + duration,
            strategy,
            peak_collision: intervals::collision_fraction(peaks, &range),
        }
    };

    let candidates = || {
        let first = snap_down_quarter(latest_start);
        std::iter::successors(Some(first), |prev| {
            Some(*prev - Duration::minutes(GRID_MINUTES))
        })
        .take_while(move |start| *start >= now)
    };

    if let Some(first) = candidates().next() {
        let candidate = slot(first, Strategy::Optimal);
        if candidate.peak_collision == 0.0 {
            return Some(candidate);
        }
    }

    for start in candidates().skip(1) {
        let candidate = slot(start, Strategy::Earlier);
        if candidate.peak_collision == 0.0 {
            return Some(candidate);
        }
    }

    for start in candidates() {
        let candidate = slot(start, Strategy::MinimalCollision);
        if candidate.peak_collision <= 0.5 {
            return Some(candidate);
        }
    }

    if now + reduced <= target {
        let end = std::cmp::min(now + reduced, target);
        let range = now..end;
        return Some(PlannedSlot {
            start: now,
            end,
            strategy: Strategy::Fallback,
            peak_collision: intervals::collision_fraction(peaks, &range),
        });
    }

    None
}

fn snap_down_quarter(at: DateTime<Utc>) -> DateTime<Utc> {
    let local = at.with_timezone(&Warsaw);
    let trimmed = local
        - Duration::minutes((local.minute() % GRID_MINUTES as u32) as i64)
        - Duration::seconds(local.second() as i64);
    trimmed.with_timezone(&Utc)
}

pub fn session_id_for(row: u32, target_local: chrono::NaiveDateTime) -> String {
    format!("special_{}_{}", row, target_local.format("%Y%m%d_%H%M"))
}

#[derive(Serialize, Debug, Default)]
pub struct PlannerOutcome {
    pub planned: Vec<String>,
    pub completed_rows: Vec<u32>,
    pub stale_failed: Vec<String>,
    pub orphan_jobs_removed: Vec<String>,
}

pub async fn run_daily_check(ctx: &WorkerContext) -> anyhow::Result<PlannerOutcome> {
    run_daily_check_at(ctx, Utc::now()).await
}

pub async fn run_daily_check_at(
    ctx: &WorkerContext,
    now: DateTime<Utc>,
) -> anyhow::Result<PlannerOutcome> {
    let mut outcome = PlannerOutcome::default();

    sweep_stale_sessions(ctx, now, &mut outcome).await?;
    sweep_orphan_jobs(ctx, &mut outcome).await;

    let snapshot = match ctx.vehicle.get_snapshot(false).await {
        Ok(snapshot) if snapshot.online => snapshot,
        _ => {
            // The planner needs battery and charge limit; wake once and retry.
            if let Err(err) = ctx.vehicle.wake_up().await {
                tracing::warn!(error = %err, "wake for planning failed");
            }
            ctx.vehicle.get_snapshot(false).await?
        }
    };

    let requests = ctx.sheet.list_requests().await?;
    for request in requests {
        if request.status != RequestStatus::Active {
            continue;
        }
        let Some(target) = Warsaw
            .from_local_datetime(&request.target_local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
        else {
            tracing::warn!(row = request.row, "target falls into a DST gap, skipping");
            continue;
        };
        if target < now || target > now + Duration::hours(PLANNING_HORIZON_HOURS) {
            continue;
        }

        let session_id = session_id_for(request.row, request.target_local);
        if ctx.store.load_session(&session_id).await?.is_some() {
            tracing::debug!(session_id, "session already planned");
            continue;
        }

        let required_kwh = (request.target_percent as f64 - snapshot.battery_percent as f64)
            / 100.0
            * ctx.config.charging.battery_capacity_kwh;
        if required_kwh <= 0.0 {
            tracing::info!(
                row = request.row,
                battery = snapshot.battery_percent,
                target = request.target_percent,
                "already above target"
            );
            ctx.sheet
                .update_status(request.row, RequestStatus::Completed)
                .await?;
            outcome.completed_rows.push(request.row);
            continue;
        }

        let charge_hours = required_kwh / ctx.config.charging.charging_rate_kw;
        let Some(slot) = select_slot(
            now,
            target,
            charge_hours + SAFETY_BUFFER_HOURS,
            charge_hours + REDUCED_BUFFER_HOURS,
            &ctx.config.charging.peak_intervals,
        ) else {
            tracing::error!(
                row = request.row,
                target = %target,
                required_hours = charge_hours + REDUCED_BUFFER_HOURS,
                "no slot can finish before the target; leaving request for the operator"
            );
            continue;
        };

        tracing::info!(
            row = request.row,
            strategy = %slot.strategy,
            start = %slot.start,
            end = %slot.end,
            peak_collision = slot.peak_collision,
            "charging slot selected"
        );
        if slot.strategy == Strategy::Fallback {
            tracing::warn!(
                peak_collision = slot.peak_collision,
                "fallback slot accepted; margin reduced and peaks may be hit"
            );
        }

        let send_at = std::cmp::max(slot.start - Duration::minutes(30), now + Duration::minutes(2));
        let mut session = Session {
            session_id: session_id.clone(),
            vin: ctx.config.charging.vin.clone(),
            target_percent: request.target_percent,
            target_datetime: target,
            planned_charge_start: slot.start,
            planned_charge_end: slot.end,
            send_at,
            original_charge_limit: Some(snapshot.current_charge_limit),
            send_job_name: format!("{}{}", SEND_JOB_PREFIX, session_id),
            cleanup_job_name: format!("{}{}", CLEANUP_JOB_PREFIX, session_id),
            status: SessionStatus::Scheduled,
            created_at: now,
            updated_at: now,
        };
        ctx.store.save_session(&session).await?;

        if let Err(err) = create_session_jobs(ctx, &session).await {
            tracing::error!(error = %err, session_id, "creating scheduler jobs failed");
            session.transition(SessionStatus::Failed, now)?;
            ctx.store.save_session(&session).await?;
            continue;
        }

        ctx.sheet
            .update_status(request.row, RequestStatus::Planned)
            .await?;
        outcome.planned.push(session_id);
    }

    tracing::info!(
        planned = outcome.planned.len(),
        completed = outcome.completed_rows.len(),
        stale = outcome.stale_failed.len(),
        orphans = outcome.orphan_jobs_removed.len(),
        "daily special-charging check done"
    );
    Ok(outcome)
}

async fn create_session_jobs(ctx: &WorkerContext, session: &Session) -> anyhow::Result<()> {
    let worker = &ctx.config.worker.url;
    let audience = ctx.config.scheduler.oidc_audience.clone();
    let body = serde_json::json!({ "session_id": session.session_id });

    ctx.scheduler
        .create_job(&JobSpec::one_shot(
            session.send_job_name.clone(),
            session.send_at.with_timezone(&Warsaw),
            format!("{}/send-special-schedule", worker),
            body.clone(),
            audience.clone(),
        ))
        .await?;

    ctx.scheduler
        .create_job(&JobSpec::one_shot(
            session.cleanup_job_name.clone(),
            (session.planned_charge_end + Duration::minutes(30)).with_timezone(&Warsaw),
            format!("{}/cleanup-single-session", worker),
            body,
            audience,
        ))
        .await?;

    Ok(())
}

/// An ACTIVE session well past its planned end means dispatch or cleanup
/// retries were exhausted; record the failure so the vehicle's charge limit
/// anomaly has an owner in the logs.
async fn sweep_stale_sessions(
    ctx: &WorkerContext,
    now: DateTime<Utc>,
    outcome: &mut PlannerOutcome,
) -> anyhow::Result<()> {
    for mut session in ctx.store.list_sessions().await? {
        if session.status == SessionStatus::Active
            && now > session.planned_charge_end + Duration::hours(STALE_ACTIVE_GRACE_HOURS)
        {
            tracing::error!(
                session_id = %session.session_id,
                planned_end = %session.planned_charge_end,
                "ACTIVE session is stale, marking FAILED"
            );
            session.transition(SessionStatus::Failed, now)?;
            ctx.store.save_session(&session).await?;
            outcome.stale_failed.push(session.session_id);
        }
    }
    Ok(())
}

/// Jobs that failed to self-delete are removed here by name, keeping the
/// live job set bounded to pending sessions.
async fn sweep_orphan_jobs(ctx: &WorkerContext, outcome: &mut PlannerOutcome) {
    let jobs = match ctx.scheduler.list_jobs().await {
        Ok(jobs) => jobs,
        Err(err) => {
            tracing::warn!(error = %err, "listing scheduler jobs failed, skipping orphan sweep");
            return;
        }
    };

    for name in jobs {
        let session_id = match name
            .strip_prefix(SEND_JOB_PREFIX)
            .or_else(|| name.strip_prefix(CLEANUP_JOB_PREFIX))
        {
            Some(session_id) => session_id,
            None => continue,
        };

        let live = matches!(
            ctx.store.load_session(session_id).await,
            Ok(Some(session)) if !session.status.is_terminal()
        );
        if !live {
            tracing::warn!(job = %name, "removing orphaned scheduler job");
            if ctx.scheduler.delete_job(&name).await.is_ok() {
                outcome.orphan_jobs_removed.push(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheet::SpecialRequest;
    use crate::worker::testing::{harness_with, harness_with_sheet, FakeVehicle};
    use chrono::NaiveDate;

    fn peaks() -> Vec<(NaiveTime, NaiveTime)> {
        vec![
            (
                NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ),
            (
                NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            ),
        ]
    }

    fn warsaw(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Warsaw
            .with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn local_minutes(at: DateTime<Utc>) -> (u32, u32) {
        let local = at.with_timezone(&Warsaw);
        (local.hour(), local.minute())
    }

    #[test]
    fn optimal_slot_is_the_latest_grid_slot() {
        // Two hours needed by 05:00: the latest grid start finishing in time
        // is 03:00, and 03:00–05:00 is peak-free.
        let now = warsaw(2025, 1, 21, 23, 0);
        let target = warsaw(2025, 1, 22, 5, 0);

        let slot = select_slot(now, target, 2.0, 1.0, &peaks()).unwrap();

        assert_eq!(slot.strategy, Strategy::Optimal);
        assert_eq!(local_minutes(slot.start), (3, 0));
        assert_eq!(local_minutes(slot.end), (5, 0));
        assert_eq!(slot.peak_collision, 0.0);
    }

    #[test]
    fn cascade_walks_back_past_the_morning_peak() {
        // Battery 60 → 85 at 75 kWh / 11 kW: 1.70 h of charging, 3.20 h with
        // margin; the latest grid slot 03:45–06:57 grazes the morning peak,
        // so the cascade walks back to 02:45–05:57.
        let now = warsaw(2025, 1, 21, 23, 0);
        let target = warsaw(2025, 1, 22, 7, 0);
        let charge_hours = (85.0 - 60.0) / 100.0 * 75.0 / 11.0;

        let slot = select_slot(
            now,
            target,
            charge_hours + SAFETY_BUFFER_HOURS,
            charge_hours + REDUCED_BUFFER_HOURS,
            &peaks(),
        )
        .unwrap();

        assert_eq!(slot.strategy, Strategy::Earlier);
        assert_eq!(local_minutes(slot.start), (2, 45));
        assert_eq!(local_minutes(slot.end), (5, 57));
        assert_eq!(slot.peak_collision, 0.0);
    }

    #[test]
    fn earlier_slot_dodges_the_evening_peak() {
        // Two hours needed by 23:00: the latest slot 21:00–23:00 overlaps
        // the evening peak, so the cascade walks back to 17:00–19:00.
        let now = warsaw(2025, 1, 22, 10, 0);
        let target = warsaw(2025, 1, 22, 23, 0);

        let slot = select_slot(now, target, 2.0, 1.0, &peaks()).unwrap();

        assert_eq!(slot.strategy, Strategy::Earlier);
        assert_eq!(local_minutes(slot.start), (17, 0));
        assert_eq!(local_minutes(slot.end), (19, 0));
        assert_eq!(slot.peak_collision, 0.0);
    }

    #[test]
    fn half_collision_slot_accepted_when_nothing_clean_fits() {
        // Four hours by midnight, planning at 15:30: a clean slot would have
        // to end by 19:00 and so start in the past, but the latest slot
        // 20:00–24:00 spends exactly half its length in the evening peak.
        let now = warsaw(2025, 1, 22, 15, 30);
        let target = warsaw(2025, 1, 23, 0, 0);

        let slot = select_slot(now, target, 4.0, 3.0, &peaks()).unwrap();

        assert_eq!(slot.strategy, Strategy::MinimalCollision);
        assert_eq!(local_minutes(slot.start), (20, 0));
        assert_eq!(local_minutes(slot.end), (0, 0));
        assert!((slot.peak_collision - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fallback_starts_immediately() {
        // Battery 20 → 85 needs 5:56 with the full margin, but the latest
        // viable start (22:04) is already gone at 23:00: start now, with the
        // window sized by the reduced margin (4:56).
        let now = warsaw(2025, 1, 21, 23, 0);
        let target = warsaw(2025, 1, 22, 4, 0);
        let charge_hours = (85.0 - 20.0) / 100.0 * 75.0 / 11.0;

        let slot = select_slot(
            now,
            target,
            charge_hours + SAFETY_BUFFER_HOURS,
            charge_hours + REDUCED_BUFFER_HOURS,
            &peaks(),
        )
        .unwrap();

        assert_eq!(slot.strategy, Strategy::Fallback);
        assert_eq!(slot.start, now);
        assert_eq!(local_minutes(slot.end), (3, 56));
        assert_eq!(slot.peak_collision, 0.0);
    }

    #[test]
    fn impossible_target_yields_no_slot() {
        let now = warsaw(2025, 1, 22, 4, 0);
        let target = warsaw(2025, 1, 22, 5, 0);
        assert!(select_slot(now, target, 6.4, 5.4, &peaks()).is_none());
    }

    fn request(row: u32, day: u32, h: u32, target: u32) -> SpecialRequest {
        SpecialRequest {
            row,
            target_local: NaiveDate::from_ymd_opt(2025, 1, day)
                .unwrap()
                .and_hms_opt(h, 0, 0)
                .unwrap(),
            target_percent: target,
            status: RequestStatus::Active,
        }
    }

    #[tokio::test]
    async fn plans_session_and_creates_both_jobs() {
        let mut vehicle = FakeVehicle::default();
        vehicle.battery = 60.into();
        let h = harness_with_sheet(vehicle, vec![request(2, 22, 7, 85)]);
        let now = warsaw(2025, 1, 21, 23, 0);

        let outcome = run_daily_check_at(&h.ctx, now).await.unwrap();

        assert_eq!(outcome.planned, vec!["special_2_20250122_0700".to_string()]);
        let session = h
            .store
            .load_session("special_2_20250122_0700")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Scheduled);
        assert_eq!(local_minutes(session.planned_charge_start), (2, 45));
        assert_eq!(local_minutes(session.planned_charge_end), (5, 57));
        assert_eq!(local_minutes(session.send_at), (2, 15));
        assert_eq!(session.original_charge_limit, Some(80));

        let created = h.scheduler.created.read().await.clone();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].name, "special-charging-special_2_20250122_0700");
        assert_eq!(created[0].schedule, "15 2 22 1 *");
        assert_eq!(created[1].name, "special-cleanup-special_2_20250122_0700");
        assert_eq!(created[1].schedule, "27 6 22 1 *");

        let updates = h.sheet.updates.read().await.clone();
        assert_eq!(updates, vec![(2, RequestStatus::Planned)]);
    }

    #[tokio::test]
    async fn replanning_is_idempotent() {
        let mut vehicle = FakeVehicle::default();
        vehicle.battery = 60.into();
        let h = harness_with_sheet(vehicle, vec![request(2, 22, 7, 85)]);
        let now = warsaw(2025, 1, 21, 23, 0);

        run_daily_check_at(&h.ctx, now).await.unwrap();
        let second = run_daily_check_at(&h.ctx, now + Duration::minutes(5))
            .await
            .unwrap();

        assert!(second.planned.is_empty());
        assert_eq!(h.scheduler.created.read().await.len(), 2);
    }

    #[tokio::test]
    async fn already_charged_rows_complete_without_session() {
        let mut vehicle = FakeVehicle::default();
        vehicle.battery = 90.into();
        let h = harness_with_sheet(vehicle, vec![request(2, 22, 7, 85)]);

        let outcome = run_daily_check_at(&h.ctx, warsaw(2025, 1, 21, 23, 0))
            .await
            .unwrap();

        assert_eq!(outcome.completed_rows, vec![2]);
        assert!(outcome.planned.is_empty());
        let updates = h.sheet.updates.read().await.clone();
        assert_eq!(updates, vec![(2, RequestStatus::Completed)]);
    }

    #[tokio::test]
    async fn far_future_rows_wait_for_a_later_run() {
        let mut vehicle = FakeVehicle::default();
        vehicle.battery = 60.into();
        let h = harness_with_sheet(vehicle, vec![request(2, 27, 7, 85)]);

        let outcome = run_daily_check_at(&h.ctx, warsaw(2025, 1, 21, 23, 0))
            .await
            .unwrap();

        assert!(outcome.planned.is_empty());
        assert!(h.scheduler.created.read().await.is_empty());
    }

    #[tokio::test]
    async fn stale_active_sessions_fail() {
        let h = harness_with(FakeVehicle::default());
        let now = warsaw(2025, 1, 21, 23, 0);
        let mut session = Session {
            session_id: "special_9_20250120_0700".to_string(),
            vin: h.ctx.config.charging.vin.clone(),
            target_percent: 85,
            target_datetime: now - Duration::hours(30),
            planned_charge_start: now - Duration::hours(36),
            planned_charge_end: now - Duration::hours(33),
            send_at: now - Duration::hours(37),
            original_charge_limit: Some(80),
            send_job_name: "special-charging-special_9_20250120_0700".to_string(),
            cleanup_job_name: "special-cleanup-special_9_20250120_0700".to_string(),
            status: SessionStatus::Scheduled,
            created_at: now - Duration::hours(40),
            updated_at: now - Duration::hours(40),
        };
        session.status = SessionStatus::Active;
        h.store.save_session(&session).await.unwrap();

        let outcome = run_daily_check_at(&h.ctx, now).await.unwrap();

        assert_eq!(outcome.stale_failed, vec![session.session_id.clone()]);
        let stored = h
            .store
            .load_session(&session.session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn orphan_jobs_are_swept() {
        let h = harness_with(FakeVehicle::default());
        h.scheduler
            .create_job(&JobSpec::one_shot(
                "special-charging-special_9_20250120_0700".to_string(),
                warsaw(2025, 1, 20, 0, 0).with_timezone(&Warsaw),
                "https://worker/send-special-schedule".to_string(),
                serde_json::json!({}),
                "aud".to_string(),
            ))
            .await
            .unwrap();

        let outcome = run_daily_check_at(&h.ctx, warsaw(2025, 1, 21, 23, 0))
            .await
            .unwrap();

        assert_eq!(
            outcome.orphan_jobs_removed,
            vec!["special-charging-special_9_20250120_0700".to_string()]
        );
        assert!(h.scheduler.live_jobs().await.is_empty());
    }
}
