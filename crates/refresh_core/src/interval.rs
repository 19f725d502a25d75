//! Per-station refresh timers.
//!
//! Every tracked station owns two tasks: a refresh timer that triggers a
//! scheduled (non-forced) refresh each interval, and a 1 Hz countdown that
//! keeps the remaining time current for display. The scheduler holds the
//! task handles; stopping a station or shutting down aborts them, so no
//! timer outlives its station.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::config::ScheduleConfig;
use common::StationId;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::RequestCoordinator;

const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// What the timers drive.
#[async_trait]
pub trait RefreshTrigger: Send + Sync {
    async fn refresh(&self, station: &StationId, force: bool);
}

#[async_trait]
impl RefreshTrigger for RequestCoordinator {
    async fn refresh(&self, station: &StationId, force: bool) {
        let report = self.refresh_batch(std::slice::from_ref(station), force).await;
        if let Some((_, error)) = report.failed.first() {
            debug!("{}: scheduled refresh failed: {}", station, error);
        }
    }
}

struct Tracked {
    interval: Duration,
    next_due: Instant,
    remaining: Duration,
    refreshing: bool,
    refresh_task: Option<JoinHandle<()>>,
    countdown_task: Option<JoinHandle<()>>,
    manual_task: Option<JoinHandle<()>>,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        for handle in [
            self.refresh_task.take(),
            self.countdown_task.take(),
            self.manual_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    trigger: Arc<dyn RefreshTrigger>,
    interval: Mutex<Duration>,
    settle_delay: Duration,
    tracked: Mutex<HashMap<StationId, Tracked>>,
    closed: CancellationToken,
}

impl Inner {
    fn spawn_refresh_timer(self: &Arc<Self>, id: StationId, interval: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !inner.reset_countdown(&id) {
                    return;
                }
                debug!("{}: scheduled refresh", id);
                inner.trigger.refresh(&id, false).await;
            }
        })
    }

    fn spawn_countdown(self: &Arc<Self>, id: StationId) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + COUNTDOWN_PERIOD, COUNTDOWN_PERIOD);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if inner.countdown_tick(&id, Instant::now()).is_none() {
                    return;
                }
            }
        })
    }

    /// Start a new full interval. False if `id` is no longer tracked.
    fn reset_countdown(&self, id: &StationId) -> bool {
        let mut tracked = self.tracked.lock();
        match tracked.get_mut(id) {
            Some(entry) => {
                entry.next_due = Instant::now() + entry.interval;
                entry.remaining = entry.interval;
                true
            }
            None => false,
        }
    }

    fn countdown_tick(&self, id: &StationId, now: Instant) -> Option<Duration> {
        let mut tracked = self.tracked.lock();
        let entry = tracked.get_mut(id)?;
        if now < entry.next_due {
            entry.remaining = entry.next_due - now;
        } else if entry.refreshing {
            entry.remaining = Duration::ZERO;
        } else {
            // Overdue while idle: the timer was suspended or drifted.
            debug!("{}: countdown overdue, resetting to full interval", id);
            entry.next_due = now + entry.interval;
            entry.remaining = entry.interval;
        }
        Some(entry.remaining)
    }
}

#[derive(Clone)]
pub struct PersistentIntervalScheduler {
    inner: Arc<Inner>,
}

impl PersistentIntervalScheduler {
    pub fn new(trigger: Arc<dyn RefreshTrigger>, interval: Duration, settle_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                trigger,
                interval: Mutex::new(interval.max(MIN_INTERVAL)),
                settle_delay,
                tracked: Mutex::new(HashMap::new()),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(trigger: Arc<dyn RefreshTrigger>, cfg: &ScheduleConfig) -> Self {
        Self::new(
            trigger,
            Duration::from_secs(cfg.refresh_interval_secs),
            Duration::from_millis(cfg.settle_delay_ms),
        )
    }

    /// Global refresh interval.
    pub fn interval(&self) -> Duration {
        *self.inner.interval.lock()
    }

    /// Begin supervising `id`. No-op if already tracked; returns whether
    /// tracking started.
    pub fn start_tracking(&self, id: StationId, interval: Option<Duration>) -> bool {
        if self.inner.closed.is_cancelled() {
            debug!("{}: scheduler shut down, not tracking", id);
            return false;
        }
        let interval = interval.unwrap_or_else(|| self.interval()).max(MIN_INTERVAL);
        let mut tracked = self.inner.tracked.lock();
        if tracked.contains_key(&id) {
            return false;
        }

        let entry = Tracked {
            interval,
            next_due: Instant::now() + interval,
            remaining: interval,
            refreshing: false,
            refresh_task: Some(self.inner.spawn_refresh_timer(id.clone(), interval)),
            countdown_task: Some(self.inner.spawn_countdown(id.clone())),
            manual_task: None,
        };
        debug!("{}: tracking every {:?}", id, interval);
        tracked.insert(id, entry);
        true
    }

    /// Stop supervising `id`, cancelling both timers.
    pub fn stop_tracking(&self, id: &StationId) -> bool {
        let removed = self.inner.tracked.lock().remove(id);
        if removed.is_some() {
            debug!("{}: tracking stopped", id);
        }
        removed.is_some()
    }

    /// Manual refresh: flag the station as refreshing, restart its refresh
    /// timer with a full interval and run a forced refresh. The flag clears
    /// after the settle delay.
    pub fn trigger_refresh(&self, id: &StationId) -> bool {
        let mut tracked = self.inner.tracked.lock();
        let Some(entry) = tracked.get_mut(id) else {
            return false;
        };

        entry.refreshing = true;
        entry.next_due = Instant::now() + entry.interval;
        entry.remaining = entry.interval;
        if let Some(old) = entry
            .refresh_task
            .replace(self.inner.spawn_refresh_timer(id.clone(), entry.interval))
        {
            old.abort();
        }

        let inner = Arc::clone(&self.inner);
        let station = id.clone();
        let manual = tokio::spawn(async move {
            inner.trigger.refresh(&station, true).await;
            tokio::time::sleep(inner.settle_delay).await;
            if let Some(entry) = inner.tracked.lock().get_mut(&station) {
                entry.refreshing = false;
            }
        });
        if let Some(old) = entry.manual_task.replace(manual) {
            old.abort();
        }
        true
    }

    /// Apply a new interval to every tracked station, restarting each
    /// refresh timer and resetting its remaining time.
    pub fn set_interval(&self, interval: Duration) {
        let interval = interval.max(MIN_INTERVAL);
        *self.inner.interval.lock() = interval;

        let mut tracked = self.inner.tracked.lock();
        let now = Instant::now();
        for (id, entry) in tracked.iter_mut() {
            entry.interval = interval;
            entry.next_due = now + interval;
            entry.remaining = interval;
            if let Some(old) = entry
                .refresh_task
                .replace(self.inner.spawn_refresh_timer(id.clone(), interval))
            {
                old.abort();
            }
        }
        info!("Refresh interval set to {:?} for {} stations", interval, tracked.len());
    }

    /// Recompute the remaining time of `id` as of `now`.
    pub fn countdown_tick(&self, id: &StationId, now: Instant) -> Option<Duration> {
        self.inner.countdown_tick(id, now)
    }

    pub fn remaining(&self, id: &StationId) -> Option<Duration> {
        self.inner.tracked.lock().get(id).map(|e| e.remaining)
    }

    pub fn is_refreshing(&self, id: &StationId) -> bool {
        self.inner
            .tracked
            .lock()
            .get(id)
            .map(|e| e.refreshing)
            .unwrap_or(false)
    }

    pub fn tracked(&self) -> Vec<StationId> {
        let mut ids: Vec<StationId> = self.inner.tracked.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every timer and refuse further tracking.
    pub fn shutdown(&self) {
        self.inner.closed.cancel();
        let drained: Vec<_> = self.inner.tracked.lock().drain().collect();
        info!("Interval scheduler stopped ({} stations)", drained.len());
    }
}
