use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use vmjobs_store::{BatchWriter, RunQueries, SeriesStore, WatermarkStore};
use vmjobs_tsdb::TimeSeriesStore;

use crate::source::SourceClient;

/// Collaborators shared by every job run. Cheap to clone.
#[derive(Clone)]
pub struct JobContext {
    pub tsdb: Arc<dyn TimeSeriesStore>,
    pub writer: BatchWriter,
    pub runs: RunQueries,
    pub series: SeriesStore,
    pub watermarks: WatermarkStore,
    pub source: Arc<dyn SourceClient>,
    /// `env` label on pushed gauges.
    pub env: String,
    /// Extra labels on pushed gauges.
    pub labels: BTreeMap<String, String>,
}

impl JobContext {
    pub fn new(
        tsdb: Arc<dyn TimeSeriesStore>,
        db: Arc<Mutex<Connection>>,
        source: Arc<dyn SourceClient>,
        env: impl Into<String>,
    ) -> Self {
        Self {
            watermarks: WatermarkStore::new(Arc::clone(&tsdb)),
            writer: BatchWriter::new(Arc::clone(&db)),
            series: SeriesStore::new(Arc::clone(&db)),
            runs: RunQueries::new(db),
            tsdb,
            source,
            env: env.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }
}
