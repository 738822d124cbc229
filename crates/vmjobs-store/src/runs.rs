use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::types::{date_from_sql, date_to_sql, ts_from_sql, JobRunRecord};

/// Read side of the run-tracking table.
#[derive(Clone)]
pub struct RunQueries {
    conn: Arc<Mutex<Connection>>,
}

impl RunQueries {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Newest data timestamp already in the sink for one business date, taken
    /// from the most recent successful run. `None` if that run wrote nothing.
    pub fn latest_max_data_timestamp(
        &self,
        job_id: &str,
        business_date: NaiveDate,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT max_data_timestamp FROM job_runs
                 WHERE job_id = ?1 AND business_date = ?2 AND error_message IS NULL
                 ORDER BY execution_timestamp DESC
                 LIMIT 1",
                params![job_id, date_to_sql(business_date)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.flatten().map(|s| ts_from_sql(&s)).transpose()?)
    }

    pub fn latest_max_data_timestamps(
        &self,
        job_id: &str,
        dates: &[NaiveDate],
    ) -> Result<BTreeMap<NaiveDate, DateTime<Utc>>> {
        let mut out = BTreeMap::new();
        for date in dates {
            if let Some(ts) = self.latest_max_data_timestamp(job_id, *date)? {
                out.insert(*date, ts);
            }
        }
        Ok(out)
    }

    /// Every attempt for a business date, oldest first.
    pub fn list_runs(&self, job_id: &str, business_date: NaiveDate) -> Result<Vec<JobRunRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT job_id, business_date, execution_timestamp, started_at, completed_at,
                    records_processed, records_failed, execution_time_seconds,
                    max_data_timestamp, error_message
             FROM job_runs
             WHERE job_id = ?1 AND business_date = ?2
             ORDER BY execution_timestamp ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id, date_to_sql(business_date)], |row| {
                let max_ts: Option<String> = row.get(8)?;
                Ok(JobRunRecord {
                    job_id: row.get(0)?,
                    business_date: date_from_sql(&row.get::<_, String>(1)?)?,
                    execution_timestamp: ts_from_sql(&row.get::<_, String>(2)?)?,
                    started_at: ts_from_sql(&row.get::<_, String>(3)?)?,
                    completed_at: ts_from_sql(&row.get::<_, String>(4)?)?,
                    records_processed: row.get::<_, i64>(5)? as u64,
                    records_failed: row.get::<_, i64>(6)? as u64,
                    execution_time_seconds: row.get(7)?,
                    max_data_timestamp: max_ts.map(|s| ts_from_sql(&s)).transpose()?,
                    error_message: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
