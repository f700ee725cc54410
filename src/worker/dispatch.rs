//! One-shot session execution, driven by the dynamic scheduler: dispatch
//! writes the planned window to the vehicle, cleanup restores the charge
//! limit afterwards. Both delete their own trigger job on success.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use super::WorkerContext;
use crate::schedule::{self, DesiredWindow};
use crate::scheduler::SchedulerClient;
use crate::store::{SessionStatus, StateStore};
use crate::tesla::VehicleApi;

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Dispatched,
    /// The session already moved on; answering OK keeps retries quiet.
    AlreadyHandled,
    NotFound,
}

#[derive(Serialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Cleaned,
    AlreadyHandled,
    NotFound,
}

/// Put the planned window on the vehicle and mark the session ACTIVE.
///
/// Other home schedules are left in place: while the session is ACTIVE the
/// monitoring cycle refuses to reconcile, so nothing fights over them, and
/// the first cycle after cleanup converges the set again.
pub async fn send_special_schedule(
    ctx: &WorkerContext,
    session_id: &str,
) -> Result<DispatchOutcome> {
    let lock = ctx.session_lock(session_id).await;
    let _guard = lock.lock().await;

    let mut session = match ctx.store.load_session(session_id).await? {
        Some(session) => session,
        None => {
            tracing::warn!(session_id, "dispatch for unknown session");
            return Ok(DispatchOutcome::NotFound);
        }
    };
    if session.status != SessionStatus::Scheduled {
        tracing::info!(session_id, status = %session.status, "dispatch already handled");
        return Ok(DispatchOutcome::AlreadyHandled);
    }

    // Commands bounce off a sleeping vehicle, so wake before anything else.
    ctx.vehicle.wake_up().await.context("waking vehicle")?;

    let snapshot = ctx
        .vehicle
        .get_snapshot(false)
        .await
        .context("reading charge limit")?;
    if session.target_percent > snapshot.current_charge_limit {
        if session.original_charge_limit.is_none() {
            session.original_charge_limit = Some(snapshot.current_charge_limit);
        }
        ctx.vehicle
            .set_charge_limit(session.target_percent)
            .await
            .context("raising charge limit")?;
        tracing::info!(
            session_id,
            from = snapshot.current_charge_limit,
            to = session.target_percent,
            "charge limit raised"
        );
    }

    let spec = schedule::to_schedule_spec(
        &DesiredWindow {
            start: session.planned_charge_start,
            end: session.planned_charge_end,
            charge_amount_kwh: 0.0,
        },
        &ctx.config.home,
    );
    let schedule_id = ctx
        .vehicle
        .add_charge_schedule(&spec)
        .await
        .context("writing special charge schedule")?;
    tracing::info!(session_id, schedule_id, "special schedule written");

    session.transition(SessionStatus::Active, Utc::now())?;
    ctx.store.save_session(&session).await?;

    // From here the work is done; a failed self-delete only leaves an orphan
    // for the planner sweep.
    if let Err(err) = ctx.scheduler.delete_job(&session.send_job_name).await {
        tracing::warn!(error = %err, job = %session.send_job_name, "send job self-delete failed");
    }

    Ok(DispatchOutcome::Dispatched)
}

/// Restore the charge limit and close the session out.
pub async fn cleanup_single_session(
    ctx: &WorkerContext,
    session_id: &str,
) -> Result<CleanupOutcome> {
    let lock = ctx.session_lock(session_id).await;
    let _guard = lock.lock().await;

    let mut session = match ctx.store.load_session(session_id).await? {
        Some(session) => session,
        None => {
            tracing::warn!(session_id, "cleanup for unknown session");
            return Ok(CleanupOutcome::NotFound);
        }
    };
    if session.status != SessionStatus::Active {
        tracing::info!(session_id, status = %session.status, "cleanup already handled");
        return Ok(CleanupOutcome::AlreadyHandled);
    }

    match session.original_charge_limit {
        Some(limit) => {
            ctx.vehicle
                .set_charge_limit(limit)
                .await
                .context("restoring charge limit")?;
            tracing::info!(session_id, limit, "charge limit restored");
        }
        None => {
            tracing::warn!(session_id, "no original charge limit recorded, leaving as is");
        }
    }

    session.transition(SessionStatus::Completed, Utc::now())?;
    ctx.store.save_session(&session).await?;

    if let Err(err) = ctx.scheduler.delete_job(&session.cleanup_job_name).await {
        tracing::warn!(error = %err, job = %session.cleanup_job_name, "cleanup job self-delete failed");
    }

    Ok(CleanupOutcome::Cleaned)
}
