use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;
use crate::types::{GaugeSample, Selector, Series};

/// What jobs need from a time-series store.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// Samples in `[start, end]` for every series matching `selector`.
    ///
    /// With `step = None` the raw stored samples come back with their
    /// original timestamps; with a step the store evaluates at each step.
    async fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Option<Duration>,
    ) -> Result<Vec<Series>>;

    /// Latest value for `selector`, or `None` when nothing matches. Honours
    /// `selector.lookback`.
    async fn query_instant(&self, selector: &Selector) -> Result<Option<f64>>;

    async fn push(&self, samples: &[GaugeSample]) -> Result<()>;
}
