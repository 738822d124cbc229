use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::types::{ts_from_sql, ts_to_sql};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractRunStatus {
    Running,
    Completed,
    Failed,
}

impl ExtractRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractRunStatus::Running => "running",
            ExtractRunStatus::Completed => "completed",
            ExtractRunStatus::Failed => "failed",
        }
    }
}

/// One series as read from the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRecord {
    pub metric_name: String,
    /// Every label except the metric name.
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<(DateTime<Utc>, f64)>,
}

/// What a finished selector run reports back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractRunSummary {
    pub series_count: u64,
    pub metrics_saved: u64,
    /// Resume point for the next run. `None` keeps the previous one.
    pub last_timestamp: Option<DateTime<Utc>>,
    pub status: ExtractRunStatus,
}

/// Per-selector incremental extraction into the `metric_*` tables.
///
/// Samples are keyed by `(metric_id, timestamp)` and upserted, so extracting an
/// overlapping window twice leaves one row per sample.
#[derive(Clone)]
pub struct SeriesStore {
    conn: Arc<Mutex<Connection>>,
}

impl SeriesStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Opens a run row for `selector` and returns its id.
    pub fn start_run(&self, job_id: &str, selector: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metric_extract_runs (job_id, selection_value, started_at, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id, selector, ts_to_sql(Utc::now()), ExtractRunStatus::Running.as_str()],
        )?;
        let run_id = conn.last_insert_rowid();
        debug!(job_id, selector, run_id, "Extract run opened");
        Ok(run_id)
    }

    pub fn finish_run(&self, run_id: i64, summary: &ExtractRunSummary) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let started: String = conn
            .query_row(
                "SELECT started_at FROM metric_extract_runs WHERE run_id = ?1",
                params![run_id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::Corrupt(format!("extract run {run_id} not found")))?;
        let completed_at = Utc::now();
        let duration = (completed_at - ts_from_sql(&started)?).num_milliseconds().max(0) as f64 / 1000.0;
        conn.execute(
            "UPDATE metric_extract_runs
             SET completed_at = ?2, duration_seconds = ?3, series_count = ?4,
                 metrics_saved_count = ?5, last_timestamp = ?6, status = ?7
             WHERE run_id = ?1",
            params![
                run_id,
                ts_to_sql(completed_at),
                duration,
                summary.series_count as i64,
                summary.metrics_saved as i64,
                summary.last_timestamp.map(ts_to_sql),
                summary.status.as_str(),
            ],
        )?;
        Ok(())
    }

    /// Where the latest run for this selector left off.
    pub fn last_timestamp(&self, job_id: &str, selector: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_timestamp FROM metric_extract_runs
                 WHERE job_id = ?1 AND selection_value = ?2 AND last_timestamp IS NOT NULL
                 ORDER BY run_id DESC LIMIT 1",
                params![job_id, selector],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.as_deref().map(ts_from_sql).transpose()?)
    }

    /// Writes one series in a single transaction. Returns the number of
    /// samples written and the newest sample timestamp.
    pub fn save_series(
        &self,
        job_id: &str,
        run_id: i64,
        series: &SeriesRecord,
    ) -> Result<(u64, Option<DateTime<Utc>>)> {
        let labels = serde_json::to_string(&series.labels)
            .map_err(|e| StoreError::Corrupt(format!("labels of {}: {e}", series.metric_name)))?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO metric_metadata (job_id, metric_name, metric_labels)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (job_id, metric_name, metric_labels) DO NOTHING",
            params![job_id, series.metric_name, labels],
        )?;
        let metric_id: i64 = tx.query_row(
            "SELECT metric_id FROM metric_metadata
             WHERE job_id = ?1 AND metric_name = ?2 AND metric_labels = ?3",
            params![job_id, series.metric_name, labels],
            |r| r.get(0),
        )?;
        {
            let mut upsert = tx.prepare_cached(
                "INSERT INTO metric_data (metric_id, metric_timestamp, metric_value, run_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (metric_id, metric_timestamp)
                 DO UPDATE SET metric_value = excluded.metric_value, run_id = excluded.run_id",
            )?;
            for (ts, value) in &series.samples {
                upsert.execute(params![metric_id, ts_to_sql(*ts), value, run_id])?;
            }
        }
        tx.commit()?;

        let written = series.samples.len() as u64;
        let newest = series.samples.iter().map(|(ts, _)| *ts).max();
        debug!(job_id, metric = %series.metric_name, metric_id, written, "Series saved");
        Ok((written, newest))
    }

    /// Number of stored samples for `job_id`, across every series.
    pub fn sample_count(&self, job_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metric_data d
             JOIN metric_metadata m ON m.metric_id = d.metric_id
             WHERE m.job_id = ?1",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use chrono::TimeZone;

    fn store() -> SeriesStore {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        SeriesStore::new(Arc::new(Mutex::new(conn)))
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn series(desk: &str, points: &[(i64, f64)]) -> SeriesRecord {
        SeriesRecord {
            metric_name: "balance".into(),
            labels: [("desk".to_string(), desk.to_string())].into_iter().collect(),
            samples: points.iter().map(|(s, v)| (ts(*s), *v)).collect(),
        }
    }

    #[test]
    fn overlapping_windows_upsert() {
        let store = store();
        let run = store.start_run("mx", "balance").unwrap();
        let (n, newest) = store
            .save_series("mx", run, &series("rates", &[(100, 1.0), (200, 2.0)]))
            .unwrap();
        assert_eq!((n, newest), (2, Some(ts(200))));

        let run = store.start_run("mx", "balance").unwrap();
        store
            .save_series("mx", run, &series("rates", &[(200, 2.5), (300, 3.0)]))
            .unwrap();
        store.save_series("mx", run, &series("fx", &[(200, 9.0)])).unwrap();
        assert_eq!(store.sample_count("mx").unwrap(), 4);

        let conn = store.conn.lock().unwrap();
        let value: f64 = conn
            .query_row(
                "SELECT metric_value FROM metric_data WHERE metric_timestamp = ?1 AND run_id = ?2
                 AND metric_id = (SELECT metric_id FROM metric_metadata WHERE metric_labels = '{\"desk\":\"rates\"}')",
                params![ts_to_sql(ts(200)), run],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(value, 2.5);
    }

    #[test]
    fn resume_point_comes_from_latest_finished_run() {
        let store = store();
        assert_eq!(store.last_timestamp("mx", "balance").unwrap(), None);

        let run = store.start_run("mx", "balance").unwrap();
        let summary = ExtractRunSummary {
            series_count: 1,
            metrics_saved: 2,
            last_timestamp: Some(ts(200)),
            status: ExtractRunStatus::Completed,
        };
        store.finish_run(run, &summary).unwrap();

        // A failed run without a resume point does not reset it.
        let run = store.start_run("mx", "balance").unwrap();
        let failed = ExtractRunSummary {
            last_timestamp: None,
            status: ExtractRunStatus::Failed,
            ..summary
        };
        store.finish_run(run, &failed).unwrap();

        assert_eq!(store.last_timestamp("mx", "balance").unwrap(), Some(ts(200)));
        assert_eq!(store.last_timestamp("mx", "other").unwrap(), None);
        assert_eq!(store.last_timestamp("other_job", "balance").unwrap(), None);
        assert!(store.finish_run(999, &summary).is_err());
    }
}
