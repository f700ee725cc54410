use std::ops::Range;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Europe::Warsaw;

pub trait RangeExt: Sized {
    fn intersect(&self, other: &Self) -> Option<Self>;
}

impl<R: Ord + Clone> RangeExt for Range<R> {
    fn intersect(&self, other: &Self) -> Option<Self> {
        use std::cmp::{max, min};
        let a = self;
        let b = other;
        if b.start > a.end || a.start > b.end {
            None
        } else {
            Some(max(a.start.clone(), b.start.clone())..min(a.end.clone(), b.end.clone()))
        }
    }
}

pub type Interval = Range<DateTime<Utc>>;

const SECS_PER_HOUR: f64 = 60. * 60.;

pub fn num_hours(duration: Duration) -> f64 {
    duration.num_seconds() as f64 / SECS_PER_HOUR
}

/// Expand the configured local-time peak intervals over every vehicle-local
/// day that `range` touches, clipped to `range`.
pub fn peaks_during(peaks: &[(NaiveTime, NaiveTime)], range: &Interval) -> Vec<Interval> {
    if range.start >= range.end {
        return Vec::new();
    }

    let first_day = range.start.with_timezone(&Warsaw).date_naive();
    let last_day = range.end.with_timezone(&Warsaw).date_naive();

    let mut out = Vec::new();
    for day in first_day.iter_days() {
        if day > last_day {
            break;
        }
        for (start, end) in peaks {
            let (Some(start), Some(end)) = (local_to_utc(day, *start), local_to_utc(day, *end))
            else {
                // A DST gap swallowed the wall-clock instant; skip the peak.
                continue;
            };
            if let Some(clipped) = (start..end).intersect(range) {
                if clipped.start < clipped.end {
                    out.push(clipped);
                }
            }
        }
    }
    out
}

fn local_to_utc(day: chrono::NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    Warsaw
        .from_local_datetime(&day.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Total time `range` spends inside peak hours.
pub fn peak_overlap(peaks: &[(NaiveTime, NaiveTime)], range: &Interval) -> Duration {
    peaks_during(peaks, range)
        .into_iter()
        .fold(Duration::zero(), |acc, r| acc + (r.end - r.start))
}

/// Fraction of `range` that falls inside peak hours, in `[0, 1]`.
pub fn collision_fraction(peaks: &[(NaiveTime, NaiveTime)], range: &Interval) -> f64 {
    let total = range.end - range.start;
    if total <= Duration::zero() {
        return 0.0;
    }
    num_hours(peak_overlap(peaks, range)) / num_hours(total)
}

pub fn is_peak_free(peaks: &[(NaiveTime, NaiveTime)], range: &Interval) -> bool {
    peak_overlap(peaks, range) == Duration::zero()
}
