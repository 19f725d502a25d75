//! Request coordinator.
//!
//! Fetches fresh data for batches of stations with bounded concurrency and
//! request sharing:
//! - stations inside the freshness window, or already being fetched, are
//!   skipped unless the batch is forced;
//! - equal request identities share one network call;
//! - every network call holds a slot of the fetch gate, whose limit is the
//!   adaptive ceiling (+1 per success, -1 per HTTP 429, within `1..=max`);
//! - successive fetch starts in a batch are spaced by a polite delay.
//!
//! Failures are scoped to one station and never abort a batch. The latest
//! error per station is kept until a success or a newer error replaces it.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use common::config::StationConfig;
use common::{
    CredentialSet, FetchKind, HistoricalWindow, MonitorConfig, PressureLevel, RequestIdentity,
    StationId, StationObservation, WindowRole,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, HistoryCache, ObservationCache};
use crate::dedup::SharedFetchRegistry;
use crate::fetch::{FetchError, HistoryRequest, StationFetcher, TimestampExtractor};
use crate::freshness::is_fresh;
use crate::merge::{local_midnight, station_offset, HistoricalMergeEngine};
use crate::pressure::PressureListener;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub credentials: CredentialSet,
    /// Upper bound of the adaptive ceiling.
    pub max_concurrency: usize,
    pub freshness_window: Duration,
    pub polite_delay: Duration,
    /// A daily window whose newest point today is older than this is refetched.
    pub daily_max_age: chrono::Duration,
    pub auxiliary_days: i64,
    pub utc_offset: FixedOffset,
}

impl CoordinatorSettings {
    pub fn from_config(cfg: &MonitorConfig) -> Self {
        Self {
            credentials: cfg.credentials.clone(),
            max_concurrency: cfg.fetch.max_concurrency.max(1),
            freshness_window: Duration::from_secs(cfg.fetch.freshness_window_secs),
            polite_delay: Duration::from_millis(cfg.fetch.polite_delay_ms),
            daily_max_age: chrono::Duration::seconds(cfg.history.daily_max_age_secs as i64),
            auxiliary_days: cfg.history.auxiliary_days.max(1),
            utc_offset: station_offset(cfg.history.utc_offset_minutes),
        }
    }
}

/// Per-station refresh state.
#[derive(Debug, Clone, Serialize)]
pub struct StationState {
    pub active: bool,
    /// Newest observation time seen in a payload.
    pub last_updated: Option<DateTime<Utc>>,
    /// Wall-clock time of the last successful fetch.
    pub last_refresh: Option<DateTime<Utc>>,
    /// Last current-conditions failure, cleared by the next current success.
    pub last_error: Option<String>,
    /// Last historical or auxiliary failure, cleared by the next window success.
    pub history_error: Option<String>,
}

impl Default for StationState {
    fn default() -> Self {
        Self {
            active: true,
            last_updated: None,
            last_refresh: None,
            last_error: None,
            history_error: None,
        }
    }
}

/// Which historical window to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistorySpan {
    /// Trailing range ending now.
    Interactive(chrono::Duration),
    /// Local midnight to now.
    Daily,
}

impl HistorySpan {
    pub fn role(&self) -> WindowRole {
        match self {
            Self::Interactive(_) => WindowRole::Interactive,
            Self::Daily => WindowRole::Daily,
        }
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub fetched: Vec<StationId>,
    pub failed: Vec<(StationId, String)>,
    pub skipped_fresh: Vec<StationId>,
    pub skipped_in_flight: Vec<StationId>,
    pub skipped_inactive: Vec<StationId>,
    /// The whole batch was skipped under critical memory pressure.
    pub skipped_for_pressure: bool,
    /// At least one fetch was throttled by the server.
    pub rate_limited: bool,
    /// Ceiling after the batch.
    pub ceiling: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorDiagnostics {
    /// Units waiting for a fetch slot.
    pub pending: usize,
    pub shared_requests: usize,
    pub concurrency_ceiling: usize,
    pub max_concurrency: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub pressure: PressureLevel,
    pub rate_limit_warning: Option<String>,
    pub stations: usize,
    pub caches: Vec<CacheStats>,
}

// ── Fetch gate ────────────────────────────────────────────────────────

/// Counting gate whose limit is read at acquire time, so a ceiling that
/// shrinks mid-batch takes effect for every queued unit.
struct FetchGate {
    active: Mutex<usize>,
    peak: AtomicUsize,
    released: Notify,
}

struct GateSlot<'a> {
    gate: &'a FetchGate,
}

impl FetchGate {
    fn new() -> Self {
        Self {
            active: Mutex::new(0),
            peak: AtomicUsize::new(0),
            released: Notify::new(),
        }
    }

    async fn acquire(&self, limit: impl Fn() -> usize) -> GateSlot<'_> {
        loop {
            // Register for the wakeup before checking, or a release in between is lost.
            let mut released = std::pin::pin!(self.released.notified());
            released.as_mut().enable();
            {
                let mut active = self.active.lock();
                if *active < limit().max(1) {
                    *active += 1;
                    self.peak.fetch_max(*active, Ordering::SeqCst);
                    return GateSlot { gate: self };
                }
            }
            released.await;
        }
    }

    fn in_flight(&self) -> usize {
        *self.active.lock()
    }
}

impl Drop for GateSlot<'_> {
    fn drop(&mut self) {
        *self.gate.active.lock() -= 1;
        self.gate.released.notify_waiters();
    }
}

// ── Coordinator ───────────────────────────────────────────────────────

struct Inner {
    fetcher: Arc<dyn StationFetcher>,
    extractor: Arc<dyn TimestampExtractor>,
    settings: CoordinatorSettings,
    observations: Arc<ObservationCache>,
    history: Arc<HistoryCache>,
    merge: HistoricalMergeEngine,
    current_fetches: SharedFetchRegistry<RequestIdentity, Arc<StationObservation>>,
    history_fetches: SharedFetchRegistry<RequestIdentity, Arc<HistoricalWindow>>,
    stations: DashMap<StationId, StationState>,
    ceiling: AtomicUsize,
    pressure: AtomicU8,
    gate: FetchGate,
    queued: AtomicUsize,
    rate_limit_warning: Mutex<Option<String>>,
    /// Serializes read-merge-store on the history cache.
    merge_lock: Mutex<()>,
}

/// Decrements the queued gauge when a unit gets its slot or is dropped.
struct QueuedGuard<'a>(&'a AtomicUsize);

impl Drop for QueuedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<Inner>,
}

impl RequestCoordinator {
    pub fn new(
        fetcher: Arc<dyn StationFetcher>,
        extractor: Arc<dyn TimestampExtractor>,
        settings: CoordinatorSettings,
        observations: Arc<ObservationCache>,
        history: Arc<HistoryCache>,
        merge: HistoricalMergeEngine,
    ) -> Self {
        let max = settings.max_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                extractor,
                settings,
                observations,
                history,
                merge,
                current_fetches: SharedFetchRegistry::new(),
                history_fetches: SharedFetchRegistry::new(),
                stations: DashMap::new(),
                ceiling: AtomicUsize::new(max),
                pressure: AtomicU8::new(PressureLevel::Normal.as_u8()),
                gate: FetchGate::new(),
                queued: AtomicUsize::new(0),
                rate_limit_warning: Mutex::new(None),
                merge_lock: Mutex::new(()),
            }),
        }
    }

    // ── Stations ──

    /// Track `id`, or update its active flag if already tracked.
    pub fn register_station(&self, id: StationId, active: bool) {
        self.inner.stations.entry(id).or_default().active = active;
    }

    /// Apply the configured station list. Stations no longer configured are
    /// marked inactive; their state is kept.
    pub fn sync_stations(&self, configs: &[StationConfig]) {
        for mut entry in self.inner.stations.iter_mut() {
            if !configs.iter().any(|c| &c.id == entry.key()) {
                entry.active = false;
            }
        }
        for cfg in configs {
            self.register_station(cfg.id.clone(), cfg.active);
        }
    }

    /// Seed the last-updated timestamp, e.g. from previously persisted state.
    pub fn set_last_updated(&self, id: &StationId, at: DateTime<Utc>) {
        self.inner.stations.entry(id.clone()).or_default().last_updated = Some(at);
    }

    pub fn station_state(&self, id: &StationId) -> Option<StationState> {
        self.inner.stations.get(id).map(|s| s.value().clone())
    }

    /// Most recent current-conditions error for `id`, kept until superseded.
    pub fn error_for(&self, id: &StationId) -> Option<String> {
        self.inner.stations.get(id).and_then(|s| s.last_error.clone())
    }

    /// Most recent historical window error for `id`.
    pub fn history_error_for(&self, id: &StationId) -> Option<String> {
        self.inner.stations.get(id).and_then(|s| s.history_error.clone())
    }

    pub fn last_refresh(&self, id: &StationId) -> Option<DateTime<Utc>> {
        self.inner.stations.get(id).and_then(|s| s.last_refresh)
    }

    pub fn last_updated(&self, id: &StationId) -> Option<DateTime<Utc>> {
        self.inner.stations.get(id).and_then(|s| s.last_updated)
    }

    pub fn observation(&self, id: &StationId) -> Option<Arc<StationObservation>> {
        self.inner.observations.get(id)
    }

    pub fn history_window(&self, id: &StationId) -> Option<Arc<HistoricalWindow>> {
        self.inner.history.get(id)
    }

    // ── Diagnostics ──

    pub fn concurrency_ceiling(&self) -> usize {
        self.inner.ceiling.load(Ordering::SeqCst)
    }

    pub fn pressure(&self) -> PressureLevel {
        self.inner.pressure()
    }

    /// Soft warning left by the last HTTP 429, cleared by the next success.
    pub fn rate_limit_warning(&self) -> Option<String> {
        self.inner.rate_limit_warning.lock().clone()
    }

    pub fn diagnostics(&self) -> CoordinatorDiagnostics {
        let inner = &self.inner;
        CoordinatorDiagnostics {
            pending: inner.queued.load(Ordering::SeqCst),
            shared_requests: inner.current_fetches.len() + inner.history_fetches.len(),
            concurrency_ceiling: self.concurrency_ceiling(),
            max_concurrency: inner.settings.max_concurrency,
            in_flight: inner.gate.in_flight(),
            peak_in_flight: inner.gate.peak.load(Ordering::SeqCst),
            pressure: inner.pressure(),
            rate_limit_warning: self.rate_limit_warning(),
            stations: inner.stations.len(),
            caches: vec![inner.observations.stats(), inner.history.stats()],
        }
    }

    // ── Current conditions ──

    /// Refresh current conditions for `stations`.
    pub async fn refresh_batch(&self, stations: &[StationId], force: bool) -> BatchReport {
        let inner = &self.inner;
        let level = inner.pressure();
        let mut report = BatchReport::default();

        // 1. Critical pressure: only forced batches run.
        if level == PressureLevel::Critical && !force {
            warn!(
                "Skipping batch of {} stations under {} memory pressure",
                stations.len(),
                level
            );
            report.skipped_for_pressure = true;
            report.ceiling = self.concurrency_ceiling();
            return report;
        }

        // 2. Build the work list.
        let mut work = Vec::new();
        for id in stations {
            let state = inner.stations.get(id).map(|s| s.value().clone()).unwrap_or_default();
            if !state.active {
                report.skipped_inactive.push(id.clone());
                continue;
            }
            if !force {
                if is_fresh(state.last_updated, inner.settings.freshness_window) {
                    debug!("{}: still fresh, skipping", id);
                    report.skipped_fresh.push(id.clone());
                    continue;
                }
                if inner.current_fetches.contains(&inner.current_identity(id)) {
                    debug!("{}: fetch already in flight, skipping", id);
                    report.skipped_in_flight.push(id.clone());
                    continue;
                }
            }
            work.push(id.clone());
        }

        // 3. Launch units, spaced by the polite delay.
        let delay = if level >= PressureLevel::Warning {
            inner.settings.polite_delay * 2
        } else {
            inner.settings.polite_delay
        };
        let mut units = JoinSet::new();
        for (i, id) in work.into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let this = self.clone();
            units.spawn(async move {
                let result = this.fetch_current(&id, force).await;
                (id, result)
            });
        }

        // 4. Collect; one failure never aborts the rest.
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((id, Ok(_))) => report.fetched.push(id),
                Ok((id, Err(e))) => {
                    if e == FetchError::RateLimited {
                        report.rate_limited = true;
                    }
                    report.failed.push((id, e.to_string()));
                }
                Err(e) => warn!("Fetch unit did not complete: {}", e),
            }
        }

        report.ceiling = self.concurrency_ceiling();
        info!(
            "Batch done: {} fetched, {} failed, {} fresh, {} in flight, ceiling {}",
            report.fetched.len(),
            report.failed.len(),
            report.skipped_fresh.len(),
            report.skipped_in_flight.len(),
            report.ceiling
        );
        report
    }

    /// Fetch current conditions for one station, joining an in-flight fetch
    /// for the same identity.
    pub async fn fetch_current(
        &self,
        station: &StationId,
        force: bool,
    ) -> Result<Arc<StationObservation>, FetchError> {
        let identity = self.inner.current_identity(station);
        let inner = Arc::clone(&self.inner);
        let key = identity.clone();
        self.inner
            .current_fetches
            .run(key, move || inner.fetch_current_once(identity, force))
            .await
    }

    // ── Historical windows ──

    /// Fetch a historical window, merge it over the cached one and store it.
    ///
    /// A non-forced daily refresh is skipped only while the cached window is
    /// covered from today's local midnight and holds a recent point for today.
    pub async fn refresh_history(
        &self,
        station: &StationId,
        span: HistorySpan,
        force: bool,
    ) -> Result<Arc<HistoricalWindow>, FetchError> {
        let inner = &self.inner;
        let now = Utc::now();

        if span == HistorySpan::Daily && !force {
            if let Some(existing) = inner.history.get(station) {
                let stale = inner.merge.daily_needs_refetch(
                    &existing,
                    now,
                    inner.settings.utc_offset,
                    inner.settings.daily_max_age,
                );
                if !stale {
                    debug!("{}: daily window still valid", station);
                    return Ok(existing);
                }
            }
        }

        let start = match span {
            HistorySpan::Interactive(range) => now - range,
            HistorySpan::Daily => local_midnight(now, inner.settings.utc_offset),
        };
        let request = HistoryRequest::new(span.role(), start, now);
        let identity = RequestIdentity::history(
            inner.settings.credentials.clone(),
            station.clone(),
            span.role(),
        );
        self.run_history(identity, request, force).await
    }

    /// The dedicated extended-range fetch, the only path that replaces the
    /// auxiliary series.
    pub async fn refresh_auxiliary(
        &self,
        station: &StationId,
    ) -> Result<Arc<HistoricalWindow>, FetchError> {
        let inner = &self.inner;
        let now = Utc::now();
        let mut request = HistoryRequest::new(
            WindowRole::Daily,
            now - chrono::Duration::days(inner.settings.auxiliary_days),
            now,
        );
        request.only_series = Some(inner.merge.auxiliary_series().to_string());
        let identity =
            RequestIdentity::auxiliary(inner.settings.credentials.clone(), station.clone());
        self.run_history(identity, request, true).await
    }

    async fn run_history(
        &self,
        identity: RequestIdentity,
        request: HistoryRequest,
        force: bool,
    ) -> Result<Arc<HistoricalWindow>, FetchError> {
        let inner = Arc::clone(&self.inner);
        let key = identity.clone();
        self.inner
            .history_fetches
            .run(key, move || inner.fetch_window_once(identity, request, force))
            .await
    }
}

impl Inner {
    fn pressure(&self) -> PressureLevel {
        PressureLevel::from_u8(self.pressure.load(Ordering::SeqCst))
    }

    fn current_identity(&self, station: &StationId) -> RequestIdentity {
        RequestIdentity::current(self.settings.credentials.clone(), station.clone())
    }

    /// Gate limit: the adaptive ceiling, capped at half the maximum for
    /// non-forced work under urgent pressure.
    fn gate_limit(&self, force: bool) -> usize {
        let ceiling = self.ceiling.load(Ordering::SeqCst);
        if !force && self.pressure() >= PressureLevel::Urgent {
            ceiling.min((self.settings.max_concurrency / 2).max(1))
        } else {
            ceiling
        }
    }

    async fn acquire_slot(&self, force: bool) -> GateSlot<'_> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let _queued = QueuedGuard(&self.queued);
        self.gate.acquire(|| self.gate_limit(force)).await
    }

    async fn fetch_current_once(
        self: Arc<Self>,
        identity: RequestIdentity,
        force: bool,
    ) -> Result<Arc<StationObservation>, FetchError> {
        let station = identity.station.clone();
        let outcome = {
            let _slot = self.acquire_slot(force).await;
            self.fetcher.fetch_current(&identity).await
        };

        match outcome {
            Ok(payload) => {
                self.on_success();
                let observed_at = self.observed_at(&station, &payload);
                let observation = Arc::new(StationObservation {
                    station: station.clone(),
                    observed_at,
                    payload,
                });
                self.observations.store(station.clone(), observation.clone());

                let mut state = self.stations.entry(station).or_default();
                state.last_updated = Some(observed_at);
                state.last_refresh = Some(Utc::now());
                state.last_error = None;
                Ok(observation)
            }
            Err(e) => {
                self.on_failure(&station, identity.kind, &e);
                Err(e)
            }
        }
    }

    async fn fetch_window_once(
        self: Arc<Self>,
        identity: RequestIdentity,
        request: HistoryRequest,
        force: bool,
    ) -> Result<Arc<HistoricalWindow>, FetchError> {
        let station = identity.station.clone();
        let outcome = {
            let _slot = self.acquire_slot(force).await;
            self.fetcher.fetch_history(&identity, request).await
        };

        let fetched = match outcome {
            Ok(window) => window,
            Err(e) => {
                self.on_failure(&station, identity.kind, &e);
                return Err(e);
            }
        };
        self.on_success();

        let merged = {
            let _guard = self.merge_lock.lock();
            let existing = self.history.get(&station);
            let merged = match identity.kind {
                FetchKind::Auxiliary => self.merge.replace_auxiliary(existing.as_deref(), fetched),
                _ => self.merge.merge(existing.as_deref(), fetched),
            };
            let merged = Arc::new(merged);
            self.history.store(station.clone(), merged.clone());
            merged
        };

        if let Some(mut state) = self.stations.get_mut(&station) {
            state.history_error = None;
        }
        Ok(merged)
    }

    /// Observation time: newest timestamp in the payload, then the named
    /// fallback field, then now.
    fn observed_at(&self, station: &StationId, payload: &Value) -> DateTime<Utc> {
        if let Some(ts) = self.extractor.most_recent(payload) {
            return ts;
        }
        if let Some(ts) = self.extractor.named_field(payload) {
            debug!("{}: using fallback timestamp field", station);
            return ts;
        }
        warn!("{}: no timestamp in payload, using current time", station);
        Utc::now()
    }

    fn on_success(&self) {
        let max = self.settings.max_concurrency;
        let _ = self
            .ceiling
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c < max).then(|| c + 1));
        *self.rate_limit_warning.lock() = None;
    }

    fn on_failure(&self, station: &StationId, kind: FetchKind, error: &FetchError) {
        if *error == FetchError::RateLimited {
            let previous = self
                .ceiling
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c > 1).then(|| c - 1))
                .unwrap_or(1);
            let current = self.ceiling.load(Ordering::SeqCst);
            warn!(
                "{}: rate limited, concurrency ceiling {} → {}",
                station, previous, current
            );
            *self.rate_limit_warning.lock() = Some(format!(
                "Station API is throttling requests; concurrency reduced to {}",
                current
            ));
        } else {
            warn!("{}: fetch failed: {}", station, error);
        }
        let mut state = self.stations.entry(station.clone()).or_default();
        match kind {
            FetchKind::Current => state.last_error = Some(error.to_string()),
            FetchKind::History(_) | FetchKind::Auxiliary => {
                state.history_error = Some(error.to_string())
            }
        }
    }

    fn halve_ceiling(&self) -> (usize, usize) {
        let previous = self
            .ceiling
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some((c / 2).max(1)))
            .unwrap_or(1);
        (previous, self.ceiling.load(Ordering::SeqCst))
    }

    fn step_down_ceiling(&self) -> (usize, usize) {
        let previous = self
            .ceiling
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1).max(1)))
            .unwrap_or(1);
        (previous, self.ceiling.load(Ordering::SeqCst))
    }
}

impl PressureListener for RequestCoordinator {
    fn on_pressure_change(&self, previous: PressureLevel, current: PressureLevel) {
        let inner = &self.inner;
        inner.pressure.store(current.as_u8(), Ordering::SeqCst);
        if current <= previous {
            return;
        }
        // One reaction per change, however many levels were crossed.
        let (before, after) = if current >= PressureLevel::Urgent {
            inner.halve_ceiling()
        } else {
            inner.step_down_ceiling()
        };
        info!(
            "{} pressure: concurrency ceiling {} → {}",
            current, before, after
        );
    }

    fn on_maintenance(&self, level: PressureLevel) {
        if level != PressureLevel::Normal {
            return;
        }
        let max = self.inner.settings.max_concurrency;
        if let Ok(previous) = self
            .inner
            .ceiling
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| (c < max).then(|| c + 1))
        {
            debug!("Relaxed concurrency ceiling {} → {}", previous, previous + 1);
        }
    }
}
