//! Data acquisition and caching core of the station monitor.
//!
//! Decides when station data is refetched, shares in-flight requests,
//! adapts fetch concurrency to server throttling and memory pressure,
//! merges historical windows and keeps every cache inside its memory budget.

pub mod cache;
pub mod charts;
pub mod coordinator;
pub mod dedup;
pub mod fetch;
pub mod freshness;
pub mod interval;
pub mod merge;
pub mod pressure;
pub mod stats;
pub mod tasks;

pub use cache::{CacheStats, MemoryBudgetCache};
pub use charts::{ChartPoint, ChartService, ChartShape};
pub use coordinator::{BatchReport, CoordinatorSettings, HistorySpan, RequestCoordinator};
pub use fetch::{FetchError, HistoryRequest, JsonTimestampExtractor, StationFetcher, TimestampExtractor};
pub use interval::{PersistentIntervalScheduler, RefreshTrigger};
pub use merge::HistoricalMergeEngine;
pub use pressure::{MemoryPressureMonitor, PressureListener, ProcessMemorySampler};
pub use stats::{DailyStatistic, DailyStatsService, StatKind};
pub use tasks::PriorityTaskScheduler;
