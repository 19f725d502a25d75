//! Historical window merging.
//!
//! Windows are merged preserve-and-overlay: the union of timestamps per
//! series, new values winning on collision. This keeps a short interactive
//! fetch from erasing the midnight-to-now daily series. The auxiliary
//! long-retention series is carried forward untouched by every general merge
//! and is only replaced by its own extended-range fetch.
//!
//! Every window remembers the gap-free range backed by its last daily fetch
//! and any fetches contiguous with it. A daily window is only reused when that
//! range starts at or before today's local midnight. Points of ordinary
//! series older than the retention horizon are dropped on merge.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use common::config::HistoryConfig;
use common::{Coverage, HistoricalWindow, Series, WindowRole};
use tracing::debug;

const DEFAULT_RETENTION_HOURS: i64 = 48;

#[derive(Debug, Clone)]
pub struct HistoricalMergeEngine {
    auxiliary_series: String,
    retention: Duration,
}

impl HistoricalMergeEngine {
    pub fn new(auxiliary_series: impl Into<String>) -> Self {
        Self {
            auxiliary_series: auxiliary_series.into(),
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
        }
    }

    pub fn from_config(cfg: &HistoryConfig) -> Self {
        Self::new(cfg.auxiliary_series.clone()).with_retention(Duration::hours(cfg.retention_hours))
    }

    /// Retention horizon for non-auxiliary points, at least one day.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention.max(Duration::hours(24));
        self
    }

    pub fn auxiliary_series(&self) -> &str {
        &self.auxiliary_series
    }

    /// Merge a freshly fetched window over the cached one.
    pub fn merge(
        &self,
        existing: Option<&HistoricalWindow>,
        mut incoming: HistoricalWindow,
    ) -> HistoricalWindow {
        let fetched = Coverage {
            start: incoming.start,
            end: incoming.end,
        };
        let is_daily = incoming.role == WindowRole::Daily;

        let Some(existing) = existing else {
            incoming.daily_coverage = is_daily.then_some(fetched);
            self.prune(&mut incoming);
            return incoming;
        };

        let mut merged = existing.clone();
        merged.role = merged_role(existing.role, incoming.role);
        merged.start = existing.start.min(incoming.start);
        merged.end = existing.end.max(incoming.end);
        merged.daily_coverage = extend_coverage(existing.daily_coverage, fetched, is_daily);

        let mut overlaid = 0usize;
        for (name, series) in incoming.series {
            if name == self.auxiliary_series {
                // Seed only; an existing auxiliary series is never replaced here.
                merged.series.entry(name).or_insert(series);
                continue;
            }
            overlaid += series.len();
            overlay(merged.series.entry(name).or_default(), series);
        }
        let pruned = self.prune(&mut merged);

        debug!(
            "Merged {:?} window for {}: overlaid {} points, pruned {}, {} total",
            incoming.role,
            merged.station,
            overlaid,
            pruned,
            merged.point_count()
        );
        merged
    }

    /// Drop non-auxiliary points older than the retention horizon.
    /// Returns the number of points removed.
    fn prune(&self, window: &mut HistoricalWindow) -> usize {
        let horizon = window.end - self.retention;
        let mut removed = 0;
        for (name, series) in window.series.iter_mut() {
            if *name == self.auxiliary_series {
                continue;
            }
            let kept = series.split_off(&horizon);
            removed += series.len();
            *series = kept;
        }
        let auxiliary = &self.auxiliary_series;
        window
            .series
            .retain(|name, series| name == auxiliary || !series.is_empty());

        if window.start < horizon {
            window.start = horizon;
        }
        window.daily_coverage = window.daily_coverage.and_then(|c| {
            (c.end >= horizon).then(|| Coverage {
                start: c.start.max(horizon),
                end: c.end,
            })
        });
        removed
    }

    /// Apply the dedicated extended-range fetch: replace only the auxiliary series.
    pub fn replace_auxiliary(
        &self,
        existing: Option<&HistoricalWindow>,
        mut fetched: HistoricalWindow,
    ) -> HistoricalWindow {
        let auxiliary = fetched.series.remove(&self.auxiliary_series);
        let mut merged = match existing {
            Some(window) => window.clone(),
            None => HistoricalWindow::new(
                fetched.station.clone(),
                WindowRole::Daily,
                fetched.start,
                fetched.end,
            ),
        };
        match auxiliary {
            Some(series) => {
                merged.series.insert(self.auxiliary_series.clone(), series);
            }
            None => {
                merged.series.remove(&self.auxiliary_series);
            }
        }
        merged
    }

    /// Whether a cached daily window must be refetched.
    ///
    /// The window must be covered without gaps from today's local midnight
    /// up to less than `max_age` ago, and the newest point dated today must
    /// also be younger than `max_age`.
    pub fn daily_needs_refetch(
        &self,
        window: &HistoricalWindow,
        now: DateTime<Utc>,
        offset: FixedOffset,
        max_age: Duration,
    ) -> bool {
        let midnight = local_midnight(now, offset);
        let covered = window
            .daily_coverage
            .is_some_and(|c| c.contains(midnight) && now.signed_duration_since(c.end) < max_age);
        if !covered {
            return true;
        }

        let newest_today = window
            .series
            .iter()
            .filter(|(name, _)| **name != self.auxiliary_series)
            .filter_map(|(_, series)| series.range(midnight..=now).next_back().map(|(ts, _)| *ts))
            .max();

        match newest_today {
            Some(ts) => now.signed_duration_since(ts) >= max_age,
            None => true,
        }
    }
}

fn merged_role(existing: WindowRole, incoming: WindowRole) -> WindowRole {
    if existing == WindowRole::Daily || incoming == WindowRole::Daily {
        WindowRole::Daily
    } else {
        WindowRole::Interactive
    }
}

/// Grow `existing` by a fetched range that touches it. A daily fetch that
/// does not touch it starts a new coverage; other fetches leave it as is.
fn extend_coverage(existing: Option<Coverage>, fetched: Coverage, is_daily: bool) -> Option<Coverage> {
    match existing {
        Some(c) if fetched.start <= c.end && fetched.end >= c.start => Some(Coverage {
            start: c.start.min(fetched.start),
            end: c.end.max(fetched.end),
        }),
        _ if is_daily => Some(fetched),
        other => other,
    }
}

/// Union `incoming` into `base`, incoming values winning on timestamp collision.
pub fn overlay(base: &mut Series, incoming: Series) {
    base.extend(incoming);
}

/// Fixed station-local offset; out-of-range values fall back to UTC.
pub fn station_offset(utc_offset_minutes: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix())
}

/// Start of the local calendar day containing `now`, as UTC.
pub fn local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    let midnight = local.date_naive().and_time(NaiveTime::MIN);
    offset
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::StationId;

    const AUX: &str = "lightning_day";

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    fn window(role: WindowRole, series: Vec<(&str, Vec<(DateTime<Utc>, f64)>)>) -> HistoricalWindow {
        let mut w = HistoricalWindow::new(StationId::new("st-1"), role, ts(0, 0), ts(12, 0));
        for (name, points) in series {
            w.series.insert(name.to_string(), points.into_iter().collect());
        }
        if role == WindowRole::Daily {
            w.daily_coverage = Some(Coverage {
                start: w.start,
                end: w.end,
            });
        }
        w
    }

    #[test]
    fn test_interactive_fetch_does_not_erase_daily_series() {
        let engine = HistoricalMergeEngine::new(AUX);
        let daily = window(
            WindowRole::Daily,
            vec![("tempf", vec![(ts(1, 0), 50.0), (ts(6, 0), 55.0), (ts(11, 0), 60.0)])],
        );
        let recent = window(
            WindowRole::Interactive,
            vec![("tempf", vec![(ts(11, 0), 61.0), (ts(11, 30), 62.0)])],
        );

        let merged = engine.merge(Some(&daily), recent);
        let temps = &merged.series["tempf"];
        assert_eq!(temps.len(), 4);
        assert_eq!(temps[&ts(1, 0)], 50.0);
        assert_eq!(temps[&ts(11, 0)], 61.0, "new value wins on collision");
        assert_eq!(temps[&ts(11, 30)], 62.0);
        assert_eq!(merged.role, WindowRole::Daily);
    }

    #[test]
    fn test_series_missing_from_incoming_is_preserved() {
        let engine = HistoricalMergeEngine::new(AUX);
        let existing = window(
            WindowRole::Daily,
            vec![("tempf", vec![(ts(1, 0), 50.0)]), ("humidity", vec![(ts(1, 0), 80.0)])],
        );
        let incoming = window(WindowRole::Daily, vec![("tempf", vec![(ts(2, 0), 51.0)])]);
        let merged = engine.merge(Some(&existing), incoming);
        assert_eq!(merged.series["humidity"].len(), 1);
        assert_eq!(merged.series["tempf"].len(), 2);
    }

    #[test]
    fn test_merge_preserves_auxiliary_series_when_omitted() {
        let engine = HistoricalMergeEngine::new(AUX);
        let existing = window(
            WindowRole::Daily,
            vec![("tempf", vec![(ts(1, 0), 50.0)]), (AUX, vec![(ts(0, 0), 3.0)])],
        );
        let incoming = window(WindowRole::Daily, vec![("tempf", vec![(ts(2, 0), 51.0)])]);

        let merged = engine.merge(Some(&existing), incoming);
        assert_eq!(merged.series[AUX], existing.series[AUX]);
    }

    #[test]
    fn test_general_merge_never_overwrites_auxiliary_series() {
        let engine = HistoricalMergeEngine::new(AUX);
        let existing = window(WindowRole::Daily, vec![(AUX, vec![(ts(0, 0), 3.0)])]);
        let incoming = window(WindowRole::Daily, vec![(AUX, vec![(ts(0, 0), 0.0), (ts(1, 0), 1.0)])]);

        let merged = engine.merge(Some(&existing), incoming);
        assert_eq!(merged.series[AUX].len(), 1);
        assert_eq!(merged.series[AUX][&ts(0, 0)], 3.0);
    }

    #[test]
    fn test_replace_auxiliary_only_touches_auxiliary() {
        let engine = HistoricalMergeEngine::new(AUX);
        let existing = window(
            WindowRole::Daily,
            vec![("tempf", vec![(ts(1, 0), 50.0)]), (AUX, vec![(ts(0, 0), 3.0)])],
        );
        let fetched = window(
            WindowRole::Daily,
            vec![(AUX, vec![(ts(0, 0), 4.0), (ts(1, 0), 1.0)]), ("tempf", vec![(ts(1, 0), 99.0)])],
        );

        let merged = engine.replace_auxiliary(Some(&existing), fetched);
        assert_eq!(merged.series[AUX].len(), 2);
        assert_eq!(merged.series[AUX][&ts(0, 0)], 4.0);
        assert_eq!(merged.series["tempf"][&ts(1, 0)], 50.0);
    }

    #[test]
    fn test_daily_staleness_check() {
        let engine = HistoricalMergeEngine::new(AUX);
        let utc = FixedOffset::east_opt(0).unwrap();
        let max_age = Duration::minutes(10);
        let now = ts(12, 0);

        let recent = window(WindowRole::Daily, vec![("tempf", vec![(ts(11, 55), 60.0)])]);
        assert!(!engine.daily_needs_refetch(&recent, now, utc, max_age));

        let old_today = window(WindowRole::Daily, vec![("tempf", vec![(ts(9, 0), 60.0)])]);
        assert!(engine.daily_needs_refetch(&old_today, now, utc, max_age));

        let yesterday = window(
            WindowRole::Daily,
            vec![("tempf", vec![(ts(0, 0) - Duration::minutes(5), 60.0)])],
        );
        assert!(engine.daily_needs_refetch(&yesterday, now, utc, max_age));

        // A fresh auxiliary point does not make the window valid.
        let aux_only = window(WindowRole::Daily, vec![(AUX, vec![(ts(11, 58), 1.0)])]);
        assert!(engine.daily_needs_refetch(&aux_only, now, utc, max_age));
    }

    #[test]
    fn test_interactive_window_alone_never_satisfies_daily() {
        let engine = HistoricalMergeEngine::new(AUX);
        let utc = FixedOffset::east_opt(0).unwrap();
        let recent = window(WindowRole::Interactive, vec![("tempf", vec![(ts(11, 59), 60.0)])]);
        let merged = engine.merge(None, recent);
        assert_eq!(merged.daily_coverage, None);
        assert!(engine.daily_needs_refetch(&merged, ts(12, 0), utc, Duration::minutes(10)));
    }

    #[test]
    fn test_interactive_after_gap_does_not_revalidate_yesterday() {
        let engine = HistoricalMergeEngine::new(AUX);
        let utc = FixedOffset::east_opt(0).unwrap();
        let yesterday = ts(0, 0) - Duration::days(1);
        let mut daily = window(
            WindowRole::Daily,
            vec![("tempf", vec![(yesterday + Duration::hours(20), 48.0)])],
        );
        daily.start = yesterday;
        daily.end = yesterday + Duration::hours(20);
        daily.daily_coverage = Some(Coverage {
            start: daily.start,
            end: daily.end,
        });

        let mut recent = window(WindowRole::Interactive, vec![("tempf", vec![(ts(11, 58), 61.0)])]);
        recent.start = ts(11, 0);

        let merged = engine.merge(Some(&daily), recent);
        assert_eq!(merged.role, WindowRole::Daily);
        assert_eq!(merged.daily_coverage, daily.daily_coverage);
        assert!(engine.daily_needs_refetch(&merged, ts(12, 0), utc, Duration::minutes(10)));
    }

    #[test]
    fn test_contiguous_interactive_extends_daily_coverage() {
        let engine = HistoricalMergeEngine::new(AUX);
        let utc = FixedOffset::east_opt(0).unwrap();
        let mut daily = window(WindowRole::Daily, vec![("tempf", vec![(ts(8, 0), 55.0)])]);
        daily.end = ts(8, 0);
        daily.daily_coverage = Some(Coverage {
            start: ts(0, 0),
            end: ts(8, 0),
        });
        let mut recent = window(WindowRole::Interactive, vec![("tempf", vec![(ts(13, 55), 61.0)])]);
        recent.start = ts(7, 0);
        recent.end = ts(14, 0);

        let merged = engine.merge(Some(&daily), recent);
        assert_eq!(
            merged.daily_coverage,
            Some(Coverage {
                start: ts(0, 0),
                end: ts(14, 0),
            })
        );
        assert!(!engine.daily_needs_refetch(&merged, ts(14, 0), utc, Duration::minutes(10)));
    }

    #[test]
    fn test_disjoint_daily_fetch_restarts_coverage() {
        let engine = HistoricalMergeEngine::new(AUX);
        let mut old = window(WindowRole::Daily, vec![("tempf", vec![(ts(1, 0), 50.0)])]);
        old.end = ts(2, 0);
        old.daily_coverage = Some(Coverage {
            start: ts(0, 0),
            end: ts(2, 0),
        });
        let mut incoming = window(WindowRole::Daily, vec![("tempf", vec![(ts(11, 0), 60.0)])]);
        incoming.start = ts(6, 0);

        let merged = engine.merge(Some(&old), incoming);
        assert_eq!(
            merged.daily_coverage,
            Some(Coverage {
                start: ts(6, 0),
                end: ts(12, 0),
            })
        );
    }

    #[test]
    fn test_merge_across_days_prunes_old_points_and_keeps_auxiliary() {
        let engine = HistoricalMergeEngine::new(AUX).with_retention(Duration::hours(24));
        let existing = window(
            WindowRole::Daily,
            vec![
                ("tempf", vec![(ts(1, 0), 50.0), (ts(11, 0), 58.0)]),
                ("humidity", vec![(ts(2, 0), 80.0)]),
                (AUX, vec![(ts(0, 0) - Duration::days(5), 2.0), (ts(0, 0), 3.0)]),
            ],
        );
        let next_day = ts(0, 0) + Duration::days(1);
        let mut incoming = window(
            WindowRole::Daily,
            vec![("tempf", vec![(next_day + Duration::hours(11), 62.0)])],
        );
        incoming.start = next_day;
        incoming.end = next_day + Duration::hours(12);

        let merged = engine.merge(Some(&existing), incoming);
        let horizon = next_day + Duration::hours(12) - Duration::hours(24);
        let temps = &merged.series["tempf"];
        assert_eq!(temps.len(), 1);
        assert!(temps.keys().all(|t| *t >= horizon));
        assert!(!merged.series.contains_key("humidity"));
        assert_eq!(merged.series[AUX].len(), 2, "auxiliary series is never pruned");
        assert_eq!(merged.start, horizon);
    }

    #[test]
    fn test_retention_is_at_least_one_day() {
        let engine = HistoricalMergeEngine::new(AUX).with_retention(Duration::hours(2));
        let existing = window(WindowRole::Daily, vec![("tempf", vec![(ts(1, 0), 50.0)])]);
        let incoming = window(WindowRole::Daily, vec![("tempf", vec![(ts(11, 0), 60.0)])]);
        let merged = engine.merge(Some(&existing), incoming);
        assert_eq!(merged.series["tempf"].len(), 2);
    }

    #[test]
    fn test_local_midnight_with_offset() {
        let pacific = FixedOffset::west_opt(8 * 3600).unwrap();
        // 03:00 UTC on the 14th is 19:00 on the 13th in UTC-8.
        let midnight = local_midnight(ts(3, 0), pacific);
        assert_eq!(midnight, Utc.with_ymd_and_hms(2026, 3, 13, 8, 0, 0).unwrap());
    }
}
