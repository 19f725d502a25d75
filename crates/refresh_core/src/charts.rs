//! Chart-ready point series derived from historical windows.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common::{HistoricalWindow, Series, TaskPriority};
use serde::Serialize;
use tracing::debug;

use crate::cache::{ChartKey, ChartPointCache};
use crate::tasks::PriorityTaskScheduler;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// What a chart displays: a trailing range ending at `until`, drawn with at
/// most `max_points` points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChartShape {
    pub range_secs: i64,
    pub max_points: usize,
    pub until: DateTime<Utc>,
}

impl ChartShape {
    pub fn new(range: Duration, max_points: usize, until: DateTime<Utc>) -> Self {
        Self {
            range_secs: range.num_seconds(),
            max_points,
            until,
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.until - Duration::seconds(self.range_secs)
    }

    pub fn shape_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Average `series` over `[start, end]` into at most `max_points` equal-width
/// time buckets. Empty buckets produce no point.
pub fn downsample(
    series: &Series,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_points: usize,
) -> Vec<ChartPoint> {
    if max_points == 0 || end < start {
        return Vec::new();
    }
    let in_range: Vec<(DateTime<Utc>, f64)> = series
        .range(start..=end)
        .filter(|(_, v)| v.is_finite())
        .map(|(ts, v)| (*ts, *v))
        .collect();
    if in_range.len() <= max_points {
        return in_range
            .into_iter()
            .map(|(at, value)| ChartPoint { at, value })
            .collect();
    }

    let span_ms = (end - start).num_milliseconds().max(1) as i128;
    let buckets = max_points as i128;
    // (sum of values, sum of offsets in ms, count)
    let mut acc = vec![(0.0f64, 0i128, 0u32); max_points];
    for (ts, value) in in_range {
        let offset = (ts - start).num_milliseconds() as i128;
        let idx = ((offset * buckets) / span_ms).clamp(0, buckets - 1) as usize;
        let slot = &mut acc[idx];
        slot.0 += value;
        slot.1 += offset;
        slot.2 += 1;
    }

    acc.into_iter()
        .filter(|(_, _, count)| *count > 0)
        .map(|(sum, offset_sum, count)| {
            let mean_offset = (offset_sum / count as i128) as i64;
            ChartPoint {
                at: start + Duration::milliseconds(mean_offset),
                value: sum / count as f64,
            }
        })
        .collect()
}

/// Degraded result: the newest `max_points` raw points in range.
pub fn truncated_tail(
    series: &Series,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_points: usize,
) -> Vec<ChartPoint> {
    let mut tail: Vec<ChartPoint> = series
        .range(start..=end)
        .rev()
        .take(max_points)
        .map(|(at, value)| ChartPoint { at: *at, value: *value })
        .collect();
    tail.reverse();
    tail
}

/// Chart points cached per station, measurement and shape.
pub struct ChartService {
    cache: Arc<ChartPointCache>,
    scheduler: PriorityTaskScheduler,
}

impl ChartService {
    pub fn new(cache: Arc<ChartPointCache>, scheduler: PriorityTaskScheduler) -> Self {
        Self { cache, scheduler }
    }

    /// Points for `measurement` drawn in `shape`.
    ///
    /// Downsampling runs at `priority`; when not admitted the truncated tail
    /// is returned and not cached.
    pub async fn points(
        &self,
        window: Arc<HistoricalWindow>,
        measurement: &str,
        shape: ChartShape,
        priority: TaskPriority,
    ) -> Arc<Vec<ChartPoint>> {
        let key = ChartKey {
            station: window.station.clone(),
            measurement: measurement.to_string(),
            shape_hash: shape.shape_hash(),
        };
        if let Some(points) = self.cache.get(&key) {
            return points;
        }

        let name = measurement.to_string();
        let source = window.clone();
        let work = async move {
            source
                .series
                .get(&name)
                .map(|series| downsample(series, shape.start(), shape.until, shape.max_points))
                .unwrap_or_default()
        };

        match self.scheduler.submit(priority, work).await {
            Ok(points) => {
                let points = Arc::new(points);
                self.cache.store(key, points.clone());
                points
            }
            Err(e) => {
                debug!("Chart for {} {} degraded: {}", window.station, measurement, e);
                let tail = window
                    .series
                    .get(measurement)
                    .map(|series| truncated_tail(series, shape.start(), shape.until, shape.max_points))
                    .unwrap_or_default();
                Arc::new(tail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::chart_point_cache;
    use crate::pressure::PressureListener;
    use chrono::TimeZone;
    use common::{PressureLevel, StationId, WindowRole};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    fn minute_series(n: i64) -> Series {
        (0..n)
            .map(|i| (t0() + Duration::minutes(i), i as f64))
            .collect()
    }

    fn window_with(series: Series) -> Arc<HistoricalWindow> {
        let mut w = HistoricalWindow::new(
            StationId::new("st-1"),
            WindowRole::Interactive,
            t0(),
            t0() + Duration::hours(1),
        );
        w.series.insert("tempf".into(), series);
        Arc::new(w)
    }

    #[test]
    fn test_downsample_respects_point_budget() {
        let series = minute_series(60);
        let points = downsample(&series, t0(), t0() + Duration::minutes(60), 6);
        assert_eq!(points.len(), 6);
        // First bucket covers minutes 0..=9.
        assert!((points[0].value - 4.5).abs() < 1e-9);
        assert!(points.windows(2).all(|w| w[0].at < w[1].at));
    }

    #[test]
    fn test_downsample_keeps_small_series_verbatim() {
        let series = minute_series(5);
        let points = downsample(&series, t0(), t0() + Duration::minutes(10), 10);
        assert_eq!(points.len(), 5);
        assert_eq!(points[4].value, 4.0);
    }

    #[test]
    fn test_truncated_tail_is_newest_points() {
        let series = minute_series(30);
        let tail = truncated_tail(&series, t0(), t0() + Duration::minutes(30), 3);
        let values: Vec<f64> = tail.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![27.0, 28.0, 29.0]);
    }

    #[test]
    fn test_shape_hash_distinguishes_shapes() {
        let a = ChartShape::new(Duration::hours(1), 60, t0());
        let b = ChartShape::new(Duration::hours(6), 60, t0());
        assert_ne!(a.shape_hash(), b.shape_hash());
        assert_eq!(a.shape_hash(), ChartShape::new(Duration::hours(1), 60, t0()).shape_hash());
    }

    #[tokio::test]
    async fn test_chart_service_caches_and_degrades() {
        let cache = Arc::new(chart_point_cache(1024 * 1024, 16));
        let scheduler = PriorityTaskScheduler::new(2);
        let service = ChartService::new(cache.clone(), scheduler.clone());
        let window = window_with(minute_series(60));
        let shape = ChartShape::new(Duration::hours(1), 12, t0() + Duration::minutes(59));

        let points = service.points(window.clone(), "tempf", shape, TaskPriority::Low).await;
        assert_eq!(points.len(), 12);
        assert_eq!(cache.len(), 1);

        // Cached result is shared.
        let again = service.points(window.clone(), "tempf", shape, TaskPriority::Low).await;
        assert!(Arc::ptr_eq(&points, &again));

        scheduler.on_pressure_change(PressureLevel::Normal, PressureLevel::Urgent);
        let other = ChartShape::new(Duration::minutes(30), 5, t0() + Duration::minutes(59));
        let degraded = service.points(window, "tempf", other, TaskPriority::Low).await;
        assert_eq!(degraded.len(), 5);
        assert_eq!(degraded.last().map(|p| p.value), Some(59.0));
        assert_eq!(cache.len(), 1);
    }
}
