use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, TsdbError};
use crate::store::TimeSeriesStore;
use crate::types::{GaugeSample, Sample, Selector, Series, NAME_LABEL};

/// In-process time-series store.
#[derive(Default)]
pub struct MemoryTimeSeries {
    series: Mutex<Vec<Series>>,
    fail_queries: AtomicBool,
    fail_pushes: AtomicBool,
}

impl MemoryTimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sample, creating the series if needed. Samples at an existing
    /// timestamp replace the old value.
    pub fn insert(&self, sample: GaugeSample) {
        let mut labels = sample.labels;
        labels.insert(NAME_LABEL.to_string(), sample.name);
        let point = Sample {
            timestamp: sample.timestamp,
            value: sample.value,
        };

        let mut all = self.series.lock().unwrap();
        match all.iter_mut().find(|s| s.labels == labels) {
            Some(series) => {
                series.samples.retain(|p| p.timestamp != point.timestamp);
                series.samples.push(point);
                series.samples.sort_by_key(|p| p.timestamp);
            }
            None => all.push(Series {
                labels,
                samples: vec![point],
            }),
        }
    }

    /// Every series whose name is `metric`.
    pub fn series_named(&self, metric: &str) -> Vec<Series> {
        let sel = Selector::metric(metric);
        self.series
            .lock()
            .unwrap()
            .iter()
            .filter(|s| sel.matches(&s.labels))
            .cloned()
            .collect()
    }

    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(TsdbError::Unavailable {
                attempts: 1,
                message: "simulated outage".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TimeSeriesStore for MemoryTimeSeries {
    async fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step: Option<Duration>,
    ) -> Result<Vec<Series>> {
        self.check(&self.fail_queries)?;
        let all = self.series.lock().unwrap();
        Ok(all
            .iter()
            .filter(|s| selector.matches(&s.labels))
            .map(|s| Series {
                labels: s.labels.clone(),
                samples: s
                    .samples
                    .iter()
                    .filter(|p| p.timestamp >= start && p.timestamp <= end)
                    .copied()
                    .collect(),
            })
            .filter(|s| !s.samples.is_empty())
            .collect())
    }

    async fn query_instant(&self, selector: &Selector) -> Result<Option<f64>> {
        self.check(&self.fail_queries)?;
        let since = selector.lookback.and_then(|lb| {
            chrono::Duration::from_std(lb)
                .ok()
                .map(|lb| Utc::now() - lb)
        });
        let all = self.series.lock().unwrap();
        Ok(all
            .iter()
            .filter(|s| selector.matches(&s.labels))
            .filter_map(Series::latest)
            .filter(|p| since.map_or(true, |since| p.timestamp >= since))
            .max_by_key(|p| p.timestamp)
            .map(|p| p.value))
    }

    async fn push(&self, samples: &[GaugeSample]) -> Result<()> {
        self.check(&self.fail_pushes)?;
        for sample in samples {
            self.insert(sample.clone());
        }
        Ok(())
    }
}
