use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, error, info};

use crate::error::Result;
use crate::types::{date_to_sql, ts_to_sql, UnitOfWork, UnitStats};

/// Writes units of work to the relational store.
///
/// A unit's records and its run row go in one transaction: either all of it
/// is visible afterwards or none of it is.
#[derive(Clone)]
pub struct BatchWriter {
    conn: Arc<Mutex<Connection>>,
}

impl BatchWriter {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Inserts every record plus one run row carrying the batch statistics,
    /// then commits. Any failure rolls the whole unit back.
    pub fn commit_unit(&self, unit: &UnitOfWork) -> Result<UnitStats> {
        let completed_at = Utc::now();
        let stats = UnitStats {
            records_processed: unit.records.len() as u64,
            records_failed: unit.records_failed,
            max_data_timestamp: unit.records.iter().map(|r| r.timestamp).max(),
            execution_time_seconds: seconds_between(unit.started_at, completed_at),
        };

        let business_date = date_to_sql(unit.business_date);
        let execution_ts = ts_to_sql(unit.execution_timestamp);
        let extracted_at = ts_to_sql(completed_at);

        let mut conn = self.conn.lock().unwrap();
        // Dropping `tx` on an early return rolls back.
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO extracted_metrics
                    (job_id, business_date, execution_timestamp, record_key, metric_name,
                     value, timestamp, labels, extracted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for record in &unit.records {
                let labels = serde_json::to_string(&record.labels).unwrap_or_else(|_| "{}".to_string());
                insert.execute(params![
                    unit.job_id,
                    date_to_sql(record.business_date),
                    execution_ts,
                    record.record_key,
                    record.metric_name,
                    record.value,
                    ts_to_sql(record.timestamp),
                    labels,
                    extracted_at,
                ])?;
            }
        }
        insert_run_row(
            &tx,
            &unit.job_id,
            &business_date,
            &execution_ts,
            unit.started_at,
            completed_at,
            &stats,
            None,
        )?;
        tx.commit()?;

        info!(
            job_id = %unit.job_id,
            business_date = %unit.business_date,
            records = stats.records_processed,
            failed = stats.records_failed,
            "Unit committed"
        );
        Ok(stats)
    }

    /// Records a failed attempt for a unit whose data could not be written.
    /// Runs in its own transaction, after the failed one rolled back.
    pub fn record_failure(&self, unit: &UnitOfWork, message: &str) -> Result<()> {
        let completed_at = Utc::now();
        let stats = UnitStats {
            records_processed: 0,
            records_failed: unit.records.len() as u64 + unit.records_failed,
            max_data_timestamp: None,
            execution_time_seconds: seconds_between(unit.started_at, completed_at),
        };
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_run_row(
            &tx,
            &unit.job_id,
            &date_to_sql(unit.business_date),
            &ts_to_sql(unit.execution_timestamp),
            unit.started_at,
            completed_at,
            &stats,
            Some(message),
        )?;
        tx.commit()?;
        error!(job_id = %unit.job_id, business_date = %unit.business_date, error = message, "Unit failed");
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn insert_run_row(
    conn: &Connection,
    job_id: &str,
    business_date: &str,
    execution_ts: &str,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    stats: &UnitStats,
    error_message: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO job_runs
            (job_id, business_date, execution_timestamp, started_at, completed_at,
             records_processed, records_failed, execution_time_seconds,
             max_data_timestamp, error_message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            job_id,
            business_date,
            execution_ts,
            ts_to_sql(started_at),
            ts_to_sql(completed_at),
            stats.records_processed as i64,
            stats.records_failed as i64,
            stats.execution_time_seconds,
            stats.max_data_timestamp.map(ts_to_sql),
            error_message,
        ],
    )?;
    debug!(job_id, business_date, "Run row inserted");
    Ok(())
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::runs::RunQueries;
    use crate::types::ExtractedRecord;
    use chrono::{NaiveDate, TimeZone};

    fn writer() -> BatchWriter {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        BatchWriter::new(Arc::new(Mutex::new(conn)))
    }

    fn record(key: &str, secs: i64) -> ExtractedRecord {
        ExtractedRecord {
            business_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            record_key: key.to_string(),
            metric_name: "balance".to_string(),
            value: 1.5,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            labels: Default::default(),
        }
    }

    fn unit(job_id: &str, records: Vec<ExtractedRecord>) -> UnitOfWork {
        let mut unit = UnitOfWork::new(job_id, NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(), Utc::now());
        unit.records = records;
        unit
    }

    fn count(w: &BatchWriter, table: &str) -> i64 {
        let conn = w.conn.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn commit_writes_records_and_stats() {
        let w = writer();
        let stats = w
            .commit_unit(&unit("ext", vec![record("A1", 100), record("A2", 300), record("A3", 200)]))
            .unwrap();
        assert_eq!(stats.records_processed, 3);
        assert_eq!(stats.max_data_timestamp, Some(Utc.timestamp_opt(300, 0).unwrap()));
        assert_eq!(count(&w, "extracted_metrics"), 3);

        let runs = RunQueries::new(w.connection())
            .list_runs("ext", NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].records_processed, 3);
        assert!(runs[0].error_message.is_none());
    }

    #[test]
    fn empty_unit_still_records_a_run() {
        let w = writer();
        let stats = w.commit_unit(&unit("ext", vec![])).unwrap();
        assert_eq!(stats.records_processed, 0);
        assert_eq!(stats.max_data_timestamp, None);
        assert_eq!(count(&w, "job_runs"), 1);
    }

    #[test]
    fn failure_before_commit_leaves_no_rows() {
        let w = writer();
        {
            let conn = w.conn.lock().unwrap();
            conn.execute_batch(
                "CREATE TRIGGER fail_runs BEFORE INSERT ON job_runs
                 WHEN NEW.job_id = 'boom'
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
            )
            .unwrap();
        }
        let failing = unit("boom", vec![record("A1", 100), record("A2", 200)]);
        let err = w.commit_unit(&failing).unwrap_err();
        assert!(err.to_string().contains("injected failure"));
        assert_eq!(count(&w, "extracted_metrics"), 0);
        assert_eq!(count(&w, "job_runs"), 0);

        // Other units are unaffected.
        w.commit_unit(&unit("ok", vec![record("A1", 100)])).unwrap();
        assert_eq!(count(&w, "extracted_metrics"), 1);
    }

    #[test]
    fn reattempts_append_new_rows() {
        let w = writer();
        let mut first = unit("ext", vec![record("A1", 100)]);
        first.execution_timestamp = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut second = unit("ext", vec![record("A1", 200)]);
        second.execution_timestamp = Utc.timestamp_opt(2_000, 0).unwrap();

        w.record_failure(&first, "source timed out").unwrap();
        w.commit_unit(&second).unwrap();
        assert_eq!(count(&w, "job_runs"), 2);

        let runs = RunQueries::new(w.connection())
            .list_runs("ext", NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
            .unwrap();
        assert_eq!(runs[0].error_message.as_deref(), Some("source timed out"));
        assert_eq!(runs[0].records_failed, 1);
        assert!(runs[1].error_message.is_none());
    }

    #[test]
    fn attempts_in_the_same_millisecond_do_not_collide() {
        let w = writer();
        let at = Utc.timestamp_opt(1_000, 0).unwrap();
        let mut first = unit("ext", vec![record("A1", 100)]);
        first.execution_timestamp = at;
        let mut second = unit("ext", vec![record("A1", 200)]);
        second.execution_timestamp = at + chrono::Duration::microseconds(500);

        w.record_failure(&first, "source timed out").unwrap();
        w.commit_unit(&second).unwrap();
        assert_eq!(count(&w, "job_runs"), 2);
    }
}
