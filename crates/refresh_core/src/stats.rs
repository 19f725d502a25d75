//! Daily high/low statistics.
//!
//! Extremes come from the daily window restricted to the local calendar day.
//! With no data for today a diurnal estimate derived from the current reading
//! is returned instead, flagged as estimated and never cached.

use std::f64::consts::PI;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use common::config::HistoryConfig;
use common::{HistoricalWindow, StationId, TaskPriority};
use serde::Serialize;
use tracing::debug;

use crate::cache::{DailyStatKey, DailyStatsCache};
use crate::merge::{local_midnight, station_offset};
use crate::tasks::PriorityTaskScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStatistic {
    pub kind: StatKind,
    pub value: f64,
    /// When the extreme was observed; `None` for estimates.
    pub at: Option<DateTime<Utc>>,
    pub estimated: bool,
    /// Newest point of the window the value was computed from.
    pub source_as_of: Option<DateTime<Utc>>,
}

/// Extreme of `series_name` between local midnight and `now`.
pub fn daily_extreme(
    window: &HistoricalWindow,
    series_name: &str,
    kind: StatKind,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Option<DailyStatistic> {
    let series = window.series.get(series_name)?;
    let midnight = local_midnight(now, offset);

    let mut best: Option<(DateTime<Utc>, f64)> = None;
    for (ts, value) in series.range(midnight..=now) {
        if !value.is_finite() {
            continue;
        }
        let better = match (best, kind) {
            (None, _) => true,
            (Some((_, b)), StatKind::High) => *value > b,
            (Some((_, b)), StatKind::Low) => *value < b,
        };
        if better {
            best = Some((*ts, *value));
        }
    }

    best.map(|(at, value)| DailyStatistic {
        kind,
        value,
        at: Some(at),
        estimated: false,
        source_as_of: window.latest_timestamp(),
    })
}

/// Best-effort daily extreme from a single reading, assuming a sinusoidal
/// daily cycle peaking mid-afternoon.
#[derive(Debug, Clone, Copy)]
pub struct DiurnalEstimator {
    /// Half the assumed peak-to-trough swing.
    pub amplitude: f64,
    /// Local hour of the daily maximum.
    pub peak_hour: f64,
}

impl DiurnalEstimator {
    pub fn new(amplitude: f64) -> Self {
        Self {
            amplitude: amplitude.abs(),
            peak_hour: 15.0,
        }
    }

    pub fn estimate(
        &self,
        current: f64,
        now: DateTime<Utc>,
        offset: FixedOffset,
        kind: StatKind,
    ) -> DailyStatistic {
        let local = now.with_timezone(&offset);
        let hour = local.hour() as f64 + local.minute() as f64 / 60.0;
        let phase = (2.0 * PI * (hour - self.peak_hour) / 24.0).cos();
        let mean = current - self.amplitude * phase;
        let value = match kind {
            StatKind::High => (mean + self.amplitude).max(current),
            StatKind::Low => (mean - self.amplitude).min(current),
        };
        DailyStatistic {
            kind,
            value,
            at: None,
            estimated: true,
            source_as_of: None,
        }
    }
}

/// Cached daily statistics computed through the background scheduler.
pub struct DailyStatsService {
    cache: Arc<DailyStatsCache>,
    scheduler: PriorityTaskScheduler,
    estimator: DiurnalEstimator,
    series_name: String,
    offset: FixedOffset,
}

impl DailyStatsService {
    pub fn new(
        cache: Arc<DailyStatsCache>,
        scheduler: PriorityTaskScheduler,
        series_name: impl Into<String>,
        offset: FixedOffset,
        amplitude: f64,
    ) -> Self {
        Self {
            cache,
            scheduler,
            estimator: DiurnalEstimator::new(amplitude),
            series_name: series_name.into(),
            offset,
        }
    }

    pub fn from_config(
        cache: Arc<DailyStatsCache>,
        scheduler: PriorityTaskScheduler,
        cfg: &HistoryConfig,
    ) -> Self {
        Self::new(
            cache,
            scheduler,
            cfg.temperature_series.clone(),
            station_offset(cfg.utc_offset_minutes),
            cfg.diurnal_amplitude,
        )
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Today's statistic for `station`.
    ///
    /// A cached value is reused while the daily window has no newer points.
    /// When the computation is not admitted the cached value is returned
    /// even if outdated, then the estimate.
    pub async fn statistic(
        &self,
        station: &StationId,
        kind: StatKind,
        daily: Option<Arc<HistoricalWindow>>,
        current: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<DailyStatistic> {
        let key = DailyStatKey {
            station: station.clone(),
            kind,
            day: now.with_timezone(&self.offset).date_naive(),
        };
        let cached = self.cache.get(&key);
        let window_as_of = daily.as_ref().and_then(|w| w.latest_timestamp());

        if let Some(stat) = &cached {
            if stat.source_as_of >= window_as_of {
                return Some(stat.clone());
            }
        }

        let computed = match daily {
            Some(window) => {
                let series_name = self.series_name.clone();
                let offset = self.offset;
                let work = async move { daily_extreme(&window, &series_name, kind, now, offset) };
                match self.scheduler.submit(TaskPriority::Normal, work).await {
                    Ok(result) => result,
                    Err(e) => {
                        debug!("Daily {:?} for {} not computed: {}", kind, station, e);
                        if cached.is_some() {
                            return cached;
                        }
                        None
                    }
                }
            }
            None => None,
        };

        match computed {
            Some(stat) => {
                self.cache.store(key, stat.clone());
                Some(stat)
            }
            None => cached.or_else(|| {
                current.map(|reading| self.estimator.estimate(reading, now, self.offset, kind))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::daily_stats_cache;
    use chrono::TimeZone;
    use common::{PressureLevel, WindowRole};

    use crate::pressure::PressureListener;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, h, m, 0).unwrap()
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn daily(points: Vec<(DateTime<Utc>, f64)>) -> HistoricalWindow {
        let mut w = HistoricalWindow::new(StationId::new("st-1"), WindowRole::Daily, ts(0, 0), ts(12, 0));
        w.series.insert("tempf".into(), points.into_iter().collect());
        w
    }

    #[test]
    fn test_extremes_restricted_to_today() {
        let window = daily(vec![
            (ts(0, 0) - chrono::Duration::hours(2), 99.0),
            (ts(5, 0), 58.0),
            (ts(9, 0), 71.5),
            (ts(11, 0), 66.0),
        ]);
        let high = daily_extreme(&window, "tempf", StatKind::High, ts(12, 0), utc()).unwrap();
        let low = daily_extreme(&window, "tempf", StatKind::Low, ts(12, 0), utc()).unwrap();
        assert_eq!(high.value, 71.5);
        assert_eq!(high.at, Some(ts(9, 0)));
        assert_eq!(low.value, 58.0);
        assert!(!high.estimated);
        assert!(daily_extreme(&window, "humidity", StatKind::High, ts(12, 0), utc()).is_none());
    }

    #[test]
    fn test_estimate_brackets_current_reading() {
        let estimator = DiurnalEstimator::new(6.0);
        let high = estimator.estimate(60.0, ts(15, 0), utc(), StatKind::High);
        let low = estimator.estimate(60.0, ts(15, 0), utc(), StatKind::Low);
        // At the assumed peak the current reading is the high.
        assert!((high.value - 60.0).abs() < 1e-9);
        assert!((low.value - 48.0).abs() < 1e-9);
        assert!(high.estimated && low.estimated);
        assert!(high.at.is_none());
    }

    #[tokio::test]
    async fn test_service_caches_until_window_grows() {
        let cache = Arc::new(daily_stats_cache(64 * 1024, 64));
        let service = DailyStatsService::new(cache.clone(), PriorityTaskScheduler::new(2), "tempf", utc(), 6.0);
        let station = StationId::new("st-1");

        let first = Arc::new(daily(vec![(ts(5, 0), 58.0), (ts(9, 0), 70.0)]));
        let high = service
            .statistic(&station, StatKind::High, Some(first.clone()), None, ts(10, 0))
            .await
            .unwrap();
        assert_eq!(high.value, 70.0);
        assert_eq!(cache.len(), 1);

        let grown = Arc::new(daily(vec![(ts(5, 0), 58.0), (ts(9, 0), 70.0), (ts(11, 0), 74.0)]));
        let high = service
            .statistic(&station, StatKind::High, Some(grown), None, ts(11, 30))
            .await
            .unwrap();
        assert_eq!(high.value, 74.0);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_service_estimates_without_data_and_does_not_cache() {
        let cache = Arc::new(daily_stats_cache(64 * 1024, 64));
        let service = DailyStatsService::new(cache.clone(), PriorityTaskScheduler::new(1), "tempf", utc(), 6.0);

        let stat = service
            .statistic(&StationId::new("st-1"), StatKind::Low, None, Some(55.0), ts(6, 0))
            .await
            .unwrap();
        assert!(stat.estimated);
        assert!(stat.value <= 55.0);
        assert!(cache.is_empty());

        let none = service
            .statistic(&StationId::new("st-1"), StatKind::Low, None, None, ts(6, 0))
            .await;
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_rejected_computation_falls_back_to_estimate() {
        let cache = Arc::new(daily_stats_cache(64 * 1024, 64));
        let scheduler = PriorityTaskScheduler::new(1);
        scheduler.on_pressure_change(PressureLevel::Normal, PressureLevel::Critical);
        let service = DailyStatsService::new(cache.clone(), scheduler, "tempf", utc(), 6.0);

        let window = Arc::new(daily(vec![(ts(5, 0), 58.0)]));
        let stat = service
            .statistic(&StationId::new("st-1"), StatKind::High, Some(window), Some(61.0), ts(7, 0))
            .await
            .unwrap();
        assert!(stat.estimated);
        assert!(cache.is_empty());
    }
}
