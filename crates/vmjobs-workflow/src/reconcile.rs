use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    UpToDate,
    /// Nothing has been written to the sink for this date yet.
    MissingInSink,
    /// The source has newer data than the sink.
    Stale,
    /// The source could not be asked. Treated as stale rather than skipped.
    SourceUnknown,
    /// Inside the forced-reprocessing window.
    SlidingWindow,
}

impl Decision {
    pub fn needs_update(&self) -> bool {
        !matches!(self, Decision::UpToDate)
    }
}

/// Compares the newest data point at the source with the newest one already
/// in the sink for a single date.
pub fn reconcile(source: Option<DateTime<Utc>>, sink: Option<DateTime<Utc>>) -> Decision {
    match (source, sink) {
        (_, None) => Decision::MissingInSink,
        (None, Some(_)) => Decision::SourceUnknown,
        (Some(src), Some(dst)) if dst < src => Decision::Stale,
        _ => Decision::UpToDate,
    }
}

/// Per-date view of both sides, as gathered by a job.
#[derive(Debug, Default, Clone)]
pub struct Timestamps {
    pub source: BTreeMap<NaiveDate, DateTime<Utc>>,
    pub sink: BTreeMap<NaiveDate, DateTime<Utc>>,
}

/// Decides every date in `weekdays` (ascending). The last
/// `sliding_window_days` dates are always reprocessed.
pub fn plan(
    weekdays: &[NaiveDate],
    timestamps: &Timestamps,
    sliding_window_days: usize,
) -> Vec<(NaiveDate, Decision)> {
    let forced_from = weekdays.len().saturating_sub(sliding_window_days);
    weekdays
        .iter()
        .enumerate()
        .map(|(i, day)| {
            let decision = reconcile(
                timestamps.source.get(day).copied(),
                timestamps.sink.get(day).copied(),
            );
            let decision = if i >= forced_from && !decision.needs_update() {
                Decision::SlidingWindow
            } else {
                decision
            };
            (*day, decision)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn decision_table() {
        let t = ts(1_700_000_000);
        assert_eq!(reconcile(Some(t), None), Decision::MissingInSink);
        assert_eq!(reconcile(None, None), Decision::MissingInSink);
        assert_eq!(reconcile(None, Some(t)), Decision::SourceUnknown);
        assert_eq!(reconcile(Some(t), Some(t)), Decision::UpToDate);
        assert_eq!(reconcile(Some(t), Some(ts(1_600_000_000))), Decision::Stale);
        assert_eq!(reconcile(Some(ts(1_600_000_000)), Some(t)), Decision::UpToDate);
    }

    #[test]
    fn writing_source_timestamp_to_sink_settles_the_date() {
        let src = ts(1_700_000_000);
        assert!(reconcile(Some(src), None).needs_update());
        // After a commit the sink carries the source's max timestamp.
        assert!(!reconcile(Some(src), Some(src)).needs_update());
        assert!(!reconcile(Some(src), Some(src)).needs_update());
    }

    #[test]
    fn sliding_window_forces_recent_dates() {
        let days: Vec<NaiveDate> = (8..=12)
            .map(|d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap())
            .collect();
        let t = ts(1_700_000_000);
        let mut stamps = Timestamps::default();
        for day in &days {
            stamps.source.insert(*day, t);
            stamps.sink.insert(*day, t);
        }
        let planned = plan(&days, &stamps, 2);
        let flagged: Vec<_> = planned
            .iter()
            .filter(|(_, d)| d.needs_update())
            .map(|(day, _)| *day)
            .collect();
        assert_eq!(flagged, days[3..].to_vec());
        assert_eq!(planned[4].1, Decision::SlidingWindow);

        assert!(plan(&days, &stamps, 0).iter().all(|(_, d)| !d.needs_update()));
    }
}
