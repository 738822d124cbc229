use std::path::Path;

use rusqlite::Connection;

use crate::error::Result;

/// Opens (creating parent directories) and initialises the store at `path`.
pub fn open(path: &str) -> Result<Connection> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::StoreError::Corrupt(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
    init_db(&conn)?;
    Ok(conn)
}

/// Creates the run-tracking, extracted-data and series tables. Idempotent.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- Append-only: every attempt adds a row, nothing is updated in place.
        CREATE TABLE IF NOT EXISTS job_runs (
            job_id                  TEXT    NOT NULL,
            business_date           TEXT    NOT NULL,   -- YYYY-MM-DD
            execution_timestamp     TEXT    NOT NULL,   -- RFC 3339, microsecond precision
            started_at              TEXT    NOT NULL,
            completed_at            TEXT    NOT NULL,
            records_processed       INTEGER NOT NULL DEFAULT 0,
            records_failed          INTEGER NOT NULL DEFAULT 0,
            execution_time_seconds  REAL    NOT NULL DEFAULT 0,
            max_data_timestamp      TEXT,               -- NULL when nothing was written
            error_message           TEXT,               -- NULL on success
            PRIMARY KEY (job_id, business_date, execution_timestamp)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS extracted_metrics (
            id                      INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id                  TEXT    NOT NULL,
            business_date           TEXT    NOT NULL,
            execution_timestamp     TEXT    NOT NULL,
            record_key              TEXT    NOT NULL,
            metric_name             TEXT    NOT NULL,
            value                   REAL    NOT NULL,
            timestamp               TEXT    NOT NULL,
            labels                  TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            extracted_at            TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_extracted_metrics_unit
            ON extracted_metrics (job_id, business_date, execution_timestamp);

        -- One row per selector per metrics_extract run. `last_timestamp` is
        -- where the next run for the same selector resumes.
        CREATE TABLE IF NOT EXISTS metric_extract_runs (
            run_id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id                  TEXT    NOT NULL,
            selection_value         TEXT    NOT NULL,
            started_at              TEXT    NOT NULL,
            completed_at            TEXT,
            duration_seconds        REAL,
            series_count            INTEGER NOT NULL DEFAULT 0,
            metrics_saved_count     INTEGER NOT NULL DEFAULT 0,
            last_timestamp          TEXT,
            status                  TEXT    NOT NULL    -- running | completed | failed
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_metric_extract_runs_selector
            ON metric_extract_runs (job_id, selection_value, run_id);

        CREATE TABLE IF NOT EXISTS metric_metadata (
            metric_id               INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id                  TEXT    NOT NULL,
            metric_name             TEXT    NOT NULL,
            metric_labels           TEXT    NOT NULL,   -- JSON object, keys sorted
            UNIQUE (job_id, metric_name, metric_labels)
        ) STRICT;

        -- Upserted: re-extracting a sample overwrites its value.
        CREATE TABLE IF NOT EXISTS metric_data (
            metric_id               INTEGER NOT NULL REFERENCES metric_metadata (metric_id),
            metric_timestamp        TEXT    NOT NULL,
            metric_value            REAL    NOT NULL,
            run_id                  INTEGER NOT NULL,
            PRIMARY KEY (metric_id, metric_timestamp)
        ) STRICT;
        ",
    )?;
    Ok(())
}
