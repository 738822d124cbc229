//! Time-series store access: a Prometheus-compatible HTTP client for
//! VictoriaMetrics, an in-memory store for tests, and the retry policy shared
//! by every outbound HTTP call.

pub mod error;
pub mod http;
pub mod memory;
pub mod retry;
pub mod store;
pub mod types;

pub use error::{Result, TsdbError};
pub use http::VictoriaMetricsClient;
pub use memory::MemoryTimeSeries;
pub use retry::{with_backoff, RetryPolicy, Transient};
pub use store::TimeSeriesStore;
pub use types::{GaugeSample, Sample, Selector, Series};
