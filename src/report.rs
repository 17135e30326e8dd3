//! Reporting rollups over persisted count snapshots.
//!
//! Hourly rows are keyed by camera + UTC date + hour. The daily branch summary sums the
//! per-camera hourly peaks to find the busiest hour and sums each camera's highest
//! cumulative total for the day's visitor estimate.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::snapshot::CountSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourlyRollup {
    pub date: NaiveDate,
    pub hour: u32,
    pub peak_count: u32,
    pub max_total: u32,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub branch: String,
    pub date: NaiveDate,
    pub peak_hour: Option<u32>,
    pub peak_count: u32,
    pub unique_visitors: u32,
    pub snapshots: usize,
}

fn timestamp_utc(timestamp: u64) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(timestamp).map_err(|_| anyhow!("timestamp out of range"))?;
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("timestamp {} out of range", secs))
}

/// `[start, end)` of a UTC calendar day in unix seconds.
pub fn day_bounds(date: NaiveDate) -> Result<(u64, u64)> {
    let start = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow!("invalid date {}", date))?
        .and_utc()
        .timestamp();
    let start = u64::try_from(start).map_err(|_| anyhow!("date {} precedes the epoch", date))?;
    Ok((start, start + 24 * 60 * 60))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| crate::FootfallError::InvalidRequest(format!("invalid date '{}'", raw)).into())
}

/// One row per (date, hour) present in `snapshots` (single camera), in time order.
pub fn hourly_rollup(snapshots: &[CountSnapshot]) -> Result<Vec<HourlyRollup>> {
    let mut rows: BTreeMap<(NaiveDate, u32), HourlyRollup> = BTreeMap::new();
    for snapshot in snapshots {
        let at = timestamp_utc(snapshot.timestamp)?;
        let key = (at.date_naive(), at.hour());
        let row = rows.entry(key).or_insert(HourlyRollup {
            date: key.0,
            hour: key.1,
            peak_count: 0,
            max_total: 0,
            samples: 0,
        });
        row.peak_count = row.peak_count.max(snapshot.current_count);
        row.max_total = row.max_total.max(snapshot.total_unique);
        row.samples += 1;
    }
    Ok(rows.into_values().collect())
}

/// Summarise one branch for one day. `per_camera` holds each camera's snapshots for
/// that day; snapshots from other days are ignored.
pub fn daily_summary(
    branch: &str,
    date: NaiveDate,
    per_camera: &[Vec<CountSnapshot>],
) -> Result<DailySummary> {
    let mut hour_peaks: BTreeMap<u32, u32> = BTreeMap::new();
    let mut unique_visitors = 0u32;
    let mut samples = 0usize;

    for snapshots in per_camera {
        let rows: Vec<HourlyRollup> = hourly_rollup(snapshots)?
            .into_iter()
            .filter(|row| row.date == date)
            .collect();
        let mut camera_max_total = 0u32;
        for row in &rows {
            *hour_peaks.entry(row.hour).or_default() += row.peak_count;
            camera_max_total = camera_max_total.max(row.max_total);
            samples += row.samples;
        }
        unique_visitors += camera_max_total;
    }

    // Earliest hour wins ties.
    let peak = hour_peaks
        .iter()
        .fold(None, |best: Option<(u32, u32)>, (&hour, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((hour, count)),
        });

    Ok(DailySummary {
        branch: branch.to_string(),
        date,
        peak_hour: peak.map(|(hour, _)| hour),
        peak_count: peak.map(|(_, count)| count).unwrap_or(0),
        unique_visitors,
        snapshots: samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CameraId;

    fn snap(camera: &CameraId, timestamp: u64, current: u32, total: u32) -> CountSnapshot {
        CountSnapshot {
            camera_id: camera.clone(),
            current_count: current,
            total_unique: total,
            timestamp,
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn hourly_rollup_groups_by_hour() -> Result<()> {
        let cam = CameraId::from_url("stub://a")?;
        let (start, _) = day_bounds(date())?;
        let rows = hourly_rollup(&[
            snap(&cam, start + 9 * 3600 + 10, 2, 4),
            snap(&cam, start + 9 * 3600 + 310, 5, 6),
            snap(&cam, start + 10 * 3600, 1, 9),
        ])?;
        assert_eq!(rows.len(), 2);
        assert_eq!((rows[0].hour, rows[0].peak_count, rows[0].max_total, rows[0].samples), (9, 5, 6, 2));
        assert_eq!((rows[1].hour, rows[1].peak_count, rows[1].max_total), (10, 1, 9));
        Ok(())
    }

    #[test]
    fn daily_summary_sums_cameras() -> Result<()> {
        let a = CameraId::from_url("stub://a")?;
        let b = CameraId::from_url("stub://b")?;
        let (start, end) = day_bounds(date())?;
        let summary = daily_summary(
            "north",
            date(),
            &[
                vec![
                    snap(&a, start + 9 * 3600, 3, 10),
                    snap(&a, start + 14 * 3600, 4, 20),
                ],
                vec![
                    snap(&b, start + 9 * 3600, 6, 5),
                    snap(&b, end + 60, 50, 99),
                ],
            ],
        )?;
        assert_eq!(summary.peak_hour, Some(9));
        assert_eq!(summary.peak_count, 9);
        assert_eq!(summary.unique_visitors, 25);
        assert_eq!(summary.snapshots, 3);
        Ok(())
    }

    #[test]
    fn empty_day_has_no_peak() -> Result<()> {
        let summary = daily_summary("north", date(), &[])?;
        assert_eq!(summary.peak_hour, None);
        assert_eq!(summary.peak_count, 0);
        Ok(())
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("2024-03-01").is_ok());
        assert!(parse_date("yesterday").is_err());
    }
}
