//! Makes the vehicle's home charge schedules equal to the desired window
//! set, with the minimum number of vehicle writes and a safe ordering.

use anyhow::{anyhow, Result};

use crate::config;
use crate::schedule::{self, DesiredWindow};
use crate::store::StateStore;
use crate::tesla::{ApiError, VehicleApi};

#[derive(Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Desired set matches the cached fingerprint; the vehicle was not touched.
    Unchanged,
    Applied {
        added: usize,
        removed: usize,
        dropped_overlaps: usize,
    },
}

/// Apply the desired windows to the vehicle.
///
/// Adds strictly precede removes: removing first can make the vehicle stop a
/// charging session in progress that the new set would have preserved. No
/// charge start/stop commands are issued anywhere in this path; the vehicle
/// acts on its own schedule set.
pub async fn reconcile(
    vehicle: &dyn VehicleApi,
    store: &dyn StateStore,
    home: &config::Home,
    vin: &str,
    desired: &[DesiredWindow],
) -> Result<ReconcileOutcome> {
    let specs: Vec<_> = desired
        .iter()
        .map(|window| schedule::to_schedule_spec(window, home))
        .collect();
    let (accepted, dropped) = schedule::resolve_overlaps(specs);

    let fingerprint = schedule::fingerprint_specs(&accepted);
    if store.load_fingerprint(vin).await?.as_deref() == Some(fingerprint.as_str()) {
        tracing::debug!("desired schedule set unchanged, skipping");
        return Ok(ReconcileOutcome::Unchanged);
    }

    let all_schedules = vehicle.list_charge_schedules().await?;
    let on_vehicle = schedule::ChargeScheduleData {
        charge_schedules: all_schedules,
    };
    // Schedules pinned elsewhere belong to someone else and are never touched.
    let (prior_home, foreign) = schedule::partition_home(&on_vehicle, home);
    if !foreign.is_empty() {
        tracing::debug!(count = foreign.len(), "leaving non-home schedules alone");
    }

    let mut added = 0;
    for spec in &accepted {
        match vehicle.add_charge_schedule(spec).await {
            Ok(id) => {
                tracing::info!(
                    id,
                    start = spec.start_time,
                    end = spec.end_time,
                    "added charge schedule"
                );
                added += 1;
            }
            Err(err) => {
                // Nothing has been removed yet, so the vehicle still holds
                // its previous complete set.
                return Err(anyhow!(
                    "adding schedule {}–{} failed after {} adds: {}",
                    spec.start_time,
                    spec.end_time,
                    added,
                    err
                ));
            }
        }
    }

    let mut removed = 0;
    for prior in &prior_home {
        match vehicle.remove_charge_schedule(prior.id).await {
            Ok(()) => removed += 1,
            Err(ApiError::NotSupported(msg)) => {
                tracing::warn!(
                    id = prior.id,
                    msg,
                    "firmware refused schedule removal; extra schedule stays until a later cycle"
                );
            }
            Err(err) => {
                tracing::warn!(id = prior.id, error = %err, "schedule removal failed");
            }
        }
    }

    store.save_fingerprint(vin, &fingerprint).await?;

    Ok(ReconcileOutcome::Applied {
        added,
        removed,
        dropped_overlaps: dropped.len(),
    })
}
