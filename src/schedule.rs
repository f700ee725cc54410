//! Charging windows as the vehicle understands them: minutes from local
//! midnight, recurring daily, pinned to the home coordinates.

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Europe::Warsaw;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config;
use crate::snapshot::{classify_location, LocationStatus};
pub use crate::tesla::{ChargeSchedule, ChargeScheduleData};

pub const MINUTES_PER_DAY: u32 = 1440;

/// A desired charging window from the pricing service. Input order is
/// priority order: the first window wins any overlap.
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub charge_amount_kwh: f64,
}

/// Creation payload for a schedule; the vehicle assigns the id.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ScheduleSpec {
    pub enabled: bool,
    pub start_enabled: bool,
    /// Minutes from local midnight, 0–1439.
    pub start_time: u32,
    pub end_enabled: bool,
    pub end_time: u32,
    pub days_of_week: String,
    pub lat: f64,
    pub lon: f64,
    pub one_time: bool,
}

impl ScheduleSpec {
    /// Both ends enabled, every day, at home. These invariants are what make
    /// a schedule ours to manage.
    pub fn daily_window(start_time: u32, end_time: u32, home: &config::Home) -> Self {
        ScheduleSpec {
            enabled: true,
            start_enabled: true,
            start_time: start_time % MINUTES_PER_DAY,
            end_enabled: true,
            end_time: end_time % MINUTES_PER_DAY,
            days_of_week: "All".to_string(),
            lat: home.latitude,
            lon: home.longitude,
            one_time: false,
        }
    }
}

/// Convert a desired window to vehicle-local minutes from midnight.
pub fn to_schedule_spec(window: &DesiredWindow, home: &config::Home) -> ScheduleSpec {
    let start = window.start.with_timezone(&Warsaw);
    let end = window.end.with_timezone(&Warsaw);
    ScheduleSpec::daily_window(
        start.hour() * 60 + start.minute(),
        end.hour() * 60 + end.minute(),
        home,
    )
}

/// Whether two `[start, end)` windows intersect on the circular 0–1439 axis.
/// A window with `end < start` wraps past midnight and is treated as
/// `[start, 1440) ∪ [0, end)`.
pub fn windows_overlap(a: (u32, u32), b: (u32, u32)) -> bool {
    segments(a).iter().any(|sa| {
        segments(b)
            .iter()
            .any(|sb| sa.start < sb.end && sb.start < sa.end)
    })
}

fn segments((start, end): (u32, u32)) -> Vec<std::ops::Range<u32>> {
    if start <= end {
        vec![start..end]
    } else {
        vec![start..MINUTES_PER_DAY, 0..end]
    }
}

/// Keep windows in priority order, dropping any window that intersects an
/// already-accepted one. Returns the accepted set and the dropped windows.
pub fn resolve_overlaps(specs: Vec<ScheduleSpec>) -> (Vec<ScheduleSpec>, Vec<ScheduleSpec>) {
    let mut accepted: Vec<ScheduleSpec> = Vec::new();
    let mut dropped = Vec::new();

    for spec in specs {
        let collides = accepted.iter().any(|kept| {
            windows_overlap(
                (kept.start_time, kept.end_time),
                (spec.start_time, spec.end_time),
            )
        });
        if collides {
            tracing::info!(
                start = spec.start_time,
                end = spec.end_time,
                "dropping lower-priority window overlapping an accepted one"
            );
            dropped.push(spec);
        } else {
            accepted.push(spec);
        }
    }

    (accepted, dropped)
}

/// A schedule is a home schedule iff its coordinates fall inside the home
/// radius. Schedules elsewhere belong to someone else and are never touched.
pub fn is_home_schedule(schedule: &ChargeSchedule, home: &config::Home) -> bool {
    classify_location(Some(schedule.latitude), Some(schedule.longitude), home)
        == LocationStatus::Home
}

pub fn partition_home(
    data: &ChargeScheduleData,
    home: &config::Home,
) -> (Vec<ChargeSchedule>, Vec<ChargeSchedule>) {
    data.charge_schedules
        .iter()
        .cloned()
        .partition(|s| is_home_schedule(s, home))
}

/// One schedule reduced to the fields that matter for change detection.
/// Coordinates are rounded to 1e-4 degrees (~11 m) so float jitter from the
/// vehicle cannot force a spurious reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CanonicalEntry {
    start_enabled: bool,
    start_time: u32,
    end_enabled: bool,
    end_time: u32,
    lat_e4: i64,
    lon_e4: i64,
    days_of_week: String,
}

impl CanonicalEntry {
    pub fn from_spec(spec: &ScheduleSpec) -> Self {
        CanonicalEntry {
            start_enabled: spec.start_enabled,
            start_time: spec.start_time,
            end_enabled: spec.end_enabled,
            end_time: spec.end_time,
            lat_e4: round_e4(spec.lat),
            lon_e4: round_e4(spec.lon),
            days_of_week: spec.days_of_week.clone(),
        }
    }

    pub fn from_vehicle(schedule: &ChargeSchedule) -> Self {
        CanonicalEntry {
            start_enabled: schedule.start_enabled,
            start_time: schedule.start_time,
            end_enabled: schedule.end_enabled,
            end_time: schedule.end_time,
            lat_e4: round_e4(schedule.latitude),
            lon_e4: round_e4(schedule.longitude),
            days_of_week: mask_to_days(schedule.days_of_week),
        }
    }
}

fn round_e4(degrees: f64) -> i64 {
    (degrees * 10_000.0).round() as i64
}

fn mask_to_days(mask: u32) -> String {
    if mask == 0 || mask == 127 {
        "All".to_string()
    } else {
        format!("mask:{}", mask)
    }
}

/// Stable hash of a schedule set, independent of input order.
pub fn fingerprint<I: IntoIterator<Item = CanonicalEntry>>(entries: I) -> String {
    let mut sorted: Vec<CanonicalEntry> = entries.into_iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for e in &sorted {
        hasher.update(
            format!(
                "{}|{}|{}|{}|{}|{}|{}\n",
                e.start_enabled, e.start_time, e.end_enabled, e.end_time, e.lat_e4, e.lon_e4, e.days_of_week
            )
            .as_bytes(),
        );
    }
    hex::encode(hasher.finalize())
}

pub fn fingerprint_specs(specs: &[ScheduleSpec]) -> String {
    fingerprint(specs.iter().map(CanonicalEntry::from_spec))
}

pub fn fingerprint_vehicle(schedules: &[ChargeSchedule]) -> String {
    fingerprint(schedules.iter().map(CanonicalEntry::from_vehicle))
}
