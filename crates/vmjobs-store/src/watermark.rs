use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::{debug, info, warn};
use vmjobs_tsdb::{GaugeSample, Selector, TimeSeriesStore};

use crate::error::{Result, StoreError};

pub const DEFAULT_LOOKBACK_DAYS: u64 = 90;

/// Identifies one watermark: a gauge name plus its identifying labels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
}

impl StreamKey {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    fn selector(&self, lookback: Duration) -> Selector {
        let mut sel = Selector::metric(&self.metric).with_lookback(lookback);
        sel.matchers = self.labels.clone();
        sel
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{}{{{}}}", self.metric, labels.join(","))
    }
}

/// Per-stream "processed through" dates, kept as a gauge whose value is the
/// Unix timestamp of the date's 00:00 UTC.
///
/// Samples are written at the current time, so the most recent write wins
/// when reading, including a backfill to an earlier date.
#[derive(Clone)]
pub struct WatermarkStore {
    tsdb: Arc<dyn TimeSeriesStore>,
    lookback: Duration,
}

impl WatermarkStore {
    pub fn new(tsdb: Arc<dyn TimeSeriesStore>) -> Self {
        Self {
            tsdb,
            lookback: Duration::from_secs(DEFAULT_LOOKBACK_DAYS * 86_400),
        }
    }

    pub fn with_lookback_days(mut self, days: u64) -> Self {
        self.lookback = Duration::from_secs(days.max(1) * 86_400);
        self
    }

    /// `None` means the stream has never been processed (or the last write is
    /// older than the lookback window).
    pub async fn read(&self, key: &StreamKey) -> Result<Option<NaiveDate>> {
        let Some(value) = self.tsdb.query_instant(&key.selector(self.lookback)).await? else {
            return Ok(None);
        };
        let date = Utc
            .timestamp_opt(value as i64, 0)
            .single()
            .map(|t| t.date_naive())
            .ok_or_else(|| StoreError::Corrupt(format!("watermark value {value} for {key}")))?;
        Ok(Some(date))
    }

    /// Moves the watermark forward to `date`. A date equal to the current one
    /// is a no-op; an earlier one is refused.
    ///
    /// Returns whether a new value was written.
    pub async fn advance(&self, key: &StreamKey, date: NaiveDate) -> Result<bool> {
        if let Some(current) = self.read(key).await? {
            if date < current {
                return Err(StoreError::WatermarkBackward {
                    stream: key.to_string(),
                    current: current.to_string(),
                    requested: date.to_string(),
                });
            }
            if date == current {
                return Ok(false);
            }
        }
        self.write(key, date).await?;
        info!(stream = %key, watermark = %date, "Watermark advanced");
        Ok(true)
    }

    /// Operator override: sets the watermark to `date` regardless of its
    /// current value, re-opening later dates for processing.
    pub async fn backfill(&self, key: &StreamKey, date: NaiveDate) -> Result<Option<NaiveDate>> {
        let previous = self.read(key).await.unwrap_or_else(|e| {
            warn!(stream = %key, error = %e, "Could not read current watermark before backfill");
            None
        });
        self.write(key, date).await?;
        warn!(stream = %key, from = ?previous, to = %date, "Watermark reset for backfill");
        Ok(previous)
    }

    /// Like [`read`](Self::read) for streams tracked to the millisecond: the
    /// gauge value is a Unix timestamp in milliseconds.
    pub async fn read_instant(&self, key: &StreamKey) -> Result<Option<DateTime<Utc>>> {
        let Some(value) = self.tsdb.query_instant(&key.selector(self.lookback)).await? else {
            return Ok(None);
        };
        let at = Utc
            .timestamp_millis_opt(value as i64)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("watermark value {value} for {key}")))?;
        Ok(Some(at))
    }

    /// Forward-only, like [`advance`](Self::advance).
    pub async fn advance_instant(&self, key: &StreamKey, at: DateTime<Utc>) -> Result<bool> {
        if let Some(current) = self.read_instant(key).await? {
            if at < current {
                return Err(StoreError::WatermarkBackward {
                    stream: key.to_string(),
                    current: current.to_rfc3339(),
                    requested: at.to_rfc3339(),
                });
            }
            if at == current {
                return Ok(false);
            }
        }
        self.push_value(key, at.timestamp_millis() as f64).await?;
        debug!(stream = %key, watermark = %at, "Watermark advanced");
        Ok(true)
    }

    async fn write(&self, key: &StreamKey, date: NaiveDate) -> Result<()> {
        self.push_value(key, date_value(date)).await
    }

    async fn push_value(&self, key: &StreamKey, value: f64) -> Result<()> {
        let sample = GaugeSample::new(&key.metric, value, Utc::now()).labels(key.labels.clone());
        self.tsdb.push(&[sample]).await?;
        Ok(())
    }
}

fn date_value(date: NaiveDate) -> f64 {
    let midnight: DateTime<Utc> = Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN));
    midnight.timestamp() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmjobs_tsdb::MemoryTimeSeries;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn key() -> StreamKey {
        StreamKey::new("collector_watermark_days")
            .label("source", "apex")
            .label("job", "apex")
            .label("env", "test")
    }

    #[tokio::test]
    async fn absent_until_first_advance() {
        let store = WatermarkStore::new(Arc::new(MemoryTimeSeries::new()));
        assert_eq!(store.read(&key()).await.unwrap(), None);
        assert!(store.advance(&key(), d(10)).await.unwrap());
        assert_eq!(store.read(&key()).await.unwrap(), Some(d(10)));
    }

    #[tokio::test]
    async fn advance_is_forward_only() {
        let store = WatermarkStore::new(Arc::new(MemoryTimeSeries::new()));
        store.advance(&key(), d(10)).await.unwrap();
        assert!(!store.advance(&key(), d(10)).await.unwrap());
        let err = store.advance(&key(), d(9)).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkBackward { .. }));
        assert_eq!(store.read(&key()).await.unwrap(), Some(d(10)));
    }

    #[tokio::test]
    async fn backfill_moves_back() {
        let tsdb = Arc::new(MemoryTimeSeries::new());
        let store = WatermarkStore::new(tsdb.clone());
        store.advance(&key(), d(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let previous = store.backfill(&key(), d(2)).await.unwrap();
        assert_eq!(previous, Some(d(10)));
        assert_eq!(store.read(&key()).await.unwrap(), Some(d(2)));
    }

    #[tokio::test]
    async fn instants_keep_milliseconds() {
        let tsdb = Arc::new(MemoryTimeSeries::new());
        let store = WatermarkStore::new(tsdb.clone()).with_lookback_days(30);
        let key = StreamKey::new("business_date_converter_source_wm").label("job", "ext");
        let at = Utc.timestamp_millis_opt(1_705_312_800_123).unwrap();

        assert_eq!(store.read_instant(&key).await.unwrap(), None);
        assert!(store.advance_instant(&key, at).await.unwrap());
        assert_eq!(store.read_instant(&key).await.unwrap(), Some(at));
        assert!(!store.advance_instant(&key, at).await.unwrap());

        let earlier = at - chrono::Duration::milliseconds(1);
        let err = store.advance_instant(&key, earlier).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkBackward { .. }));
        assert_eq!(tsdb.series_named("business_date_converter_source_wm")[0].samples.len(), 1);
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let store = WatermarkStore::new(Arc::new(MemoryTimeSeries::new()));
        let other = StreamKey::new("collector_watermark_days").label("source", "other");
        store.advance(&key(), d(10)).await.unwrap();
        assert_eq!(store.read(&other).await.unwrap(), None);
    }
}
