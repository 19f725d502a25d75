//! Memory-budgeted LRU caches.
//!
//! Every entry carries a footprint computed by an injected sizing function.
//! After any `store` returns, the footprint total is within the byte budget
//! and the entry count within the item cap; eviction always starts from the
//! least-recently-used end. Under memory pressure a fraction of the coldest
//! entries is shed regardless of the budget.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::mem::size_of;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use common::{HistoricalWindow, PressureLevel, StationId, StationObservation};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::charts::ChartPoint;
use crate::pressure::PressureListener;
use crate::stats::{DailyStatistic, StatKind};

type Sizer<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// A live cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub last_access: Instant,
    pub footprint: usize,
    /// Position in the access order; larger is more recent.
    tick: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub name: &'static str,
    pub entries: usize,
    pub bytes: usize,
    pub budget_bytes: usize,
    pub max_items: usize,
    pub evictions: u64,
}

struct CacheState<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Access order: first key is the least recently used.
    order: BTreeMap<u64, K>,
    next_tick: u64,
    total_bytes: usize,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V> CacheState<K, V> {
    fn touch(&mut self, key: &K) -> Option<&mut CacheEntry<V>> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        entry.last_access = Instant::now();
        self.order.insert(tick, key.clone());
        self.next_tick += 1;
        Some(entry)
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        self.total_bytes = self.total_bytes.saturating_sub(entry.footprint);
        Some(entry)
    }

    fn evict_coldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.footprint);
            self.evictions += 1;
        }
        true
    }
}

/// Generic key→value store with footprint accounting and strict LRU eviction.
pub struct MemoryBudgetCache<K, V> {
    name: &'static str,
    budget_bytes: usize,
    max_items: usize,
    sizer: Sizer<V>,
    state: Mutex<CacheState<K, V>>,
}

impl<K, V> fmt::Debug for MemoryBudgetCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudgetCache")
            .field("name", &self.name)
            .field("budget_bytes", &self.budget_bytes)
            .field("max_items", &self.max_items)
            .finish()
    }
}

impl<K, V> MemoryBudgetCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    pub fn new(
        name: &'static str,
        budget_bytes: usize,
        max_items: usize,
        sizer: impl Fn(&V) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            budget_bytes,
            max_items,
            sizer: Arc::new(sizer),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                total_bytes: 0,
                evictions: 0,
            }),
        }
    }

    /// Insert or replace `key`, marking it most recently used, then enforce the budget.
    ///
    /// Returns the number of entries evicted to make room.
    pub fn store(&self, key: K, value: V) -> usize {
        let footprint = (self.sizer)(&value);
        let mut state = self.state.lock();
        state.remove(&key);

        let tick = state.next_tick;
        state.next_tick += 1;
        state.total_bytes += footprint;
        state.order.insert(tick, key.clone());
        state.entries.insert(
            key,
            CacheEntry {
                value,
                last_access: Instant::now(),
                footprint,
                tick,
            },
        );

        let evicted = self.enforce_budget(&mut state);
        if evicted > 0 {
            debug!(
                "{}: evicted {} entries to stay within {} bytes / {} items",
                self.name, evicted, self.budget_bytes, self.max_items
            );
        }
        evicted
    }

    /// Look up `key`, marking it most recently used on a hit.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.state.lock();
        state.touch(key).map(|entry| entry.value.clone())
    }

    /// Look up `key` without affecting the access order.
    pub fn peek(&self, key: &K) -> Option<V> {
        let state = self.state.lock();
        state.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.state.lock().remove(key).map(|entry| entry.value)
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.total_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.state.lock().order.values().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            name: self.name,
            entries: state.entries.len(),
            bytes: state.total_bytes,
            budget_bytes: self.budget_bytes,
            max_items: self.max_items,
            evictions: state.evictions,
        }
    }

    /// Re-run budget enforcement.
    pub fn cleanup(&self) -> usize {
        let mut state = self.state.lock();
        self.enforce_budget(&mut state)
    }

    /// Shed the coldest 20% / 50% / 80% of entries for Warning / Urgent / Critical,
    /// rounded up so a non-empty cache always sheds at least one entry.
    pub fn evict_for_pressure(&self, level: PressureLevel) -> usize {
        let percent = (pressure_eviction_fraction(level) * 100.0).round() as usize;
        if percent == 0 {
            return 0;
        }

        let mut state = self.state.lock();
        let target = (state.entries.len() * percent).div_ceil(100);
        let mut evicted = 0;
        while evicted < target && state.evict_coldest() {
            evicted += 1;
        }
        evicted
    }

    fn enforce_budget(&self, state: &mut CacheState<K, V>) -> usize {
        let mut evicted = 0;
        while (state.total_bytes > self.budget_bytes || state.entries.len() > self.max_items)
            && state.evict_coldest()
        {
            evicted += 1;
        }
        evicted
    }
}

/// Fraction of entries shed by a pressure-triggered eviction pass.
pub fn pressure_eviction_fraction(level: PressureLevel) -> f64 {
    match level {
        PressureLevel::Normal => 0.0,
        PressureLevel::Warning => 0.2,
        PressureLevel::Urgent => 0.5,
        PressureLevel::Critical => 0.8,
    }
}

impl<K, V> PressureListener for MemoryBudgetCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn on_pressure_change(&self, previous: PressureLevel, current: PressureLevel) {
        if current <= previous {
            return;
        }
        let evicted = self.evict_for_pressure(current);
        info!(
            "{}: {} pressure, shed {} cold entries ({} remain, {} bytes)",
            self.name,
            current,
            evicted,
            self.len(),
            self.total_bytes()
        );
    }
}

// ── Specializations ───────────────────────────────────────────────────

/// Key of a derived chart series.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChartKey {
    pub station: StationId,
    pub measurement: String,
    /// Hash of the chart shape (range, point budget).
    pub shape_hash: u64,
}

/// Key of a computed daily statistic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DailyStatKey {
    pub station: StationId,
    pub kind: StatKind,
    pub day: NaiveDate,
}

pub type ObservationCache = MemoryBudgetCache<StationId, Arc<StationObservation>>;
pub type HistoryCache = MemoryBudgetCache<StationId, Arc<HistoricalWindow>>;
pub type ChartPointCache = MemoryBudgetCache<ChartKey, Arc<Vec<ChartPoint>>>;
pub type DailyStatsCache = MemoryBudgetCache<DailyStatKey, DailyStatistic>;

const ENTRY_OVERHEAD: usize = 64;
/// Approximate cost of one timestamp→value node in a series map.
const SERIES_POINT_BYTES: usize = 48;

pub fn observation_cache(budget_bytes: usize, max_items: usize) -> ObservationCache {
    MemoryBudgetCache::new("observations", budget_bytes, max_items, |obs: &Arc<StationObservation>| {
        ENTRY_OVERHEAD + json_footprint(&obs.payload)
    })
}

pub fn history_cache(budget_bytes: usize, max_items: usize) -> HistoryCache {
    MemoryBudgetCache::new("history", budget_bytes, max_items, |window: &Arc<HistoricalWindow>| {
        window_footprint(window)
    })
}

pub fn chart_point_cache(budget_bytes: usize, max_items: usize) -> ChartPointCache {
    MemoryBudgetCache::new("chart_points", budget_bytes, max_items, |points: &Arc<Vec<ChartPoint>>| {
        ENTRY_OVERHEAD + points.len() * size_of::<ChartPoint>()
    })
}

pub fn daily_stats_cache(budget_bytes: usize, max_items: usize) -> DailyStatsCache {
    MemoryBudgetCache::new("daily_stats", budget_bytes, max_items, |_: &DailyStatistic| {
        ENTRY_OVERHEAD + size_of::<DailyStatistic>()
    })
}

/// Rough heap footprint of a JSON value.
pub fn json_footprint(value: &serde_json::Value) -> usize {
    use serde_json::Value;
    let base = size_of::<Value>();
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) => base,
        Value::String(s) => base + s.len(),
        Value::Array(items) => base + items.iter().map(json_footprint).sum::<usize>(),
        Value::Object(map) => {
            base + map
                .iter()
                .map(|(k, v)| k.len() + json_footprint(v))
                .sum::<usize>()
        }
    }
}

/// Rough heap footprint of a historical window.
pub fn window_footprint(window: &HistoricalWindow) -> usize {
    ENTRY_OVERHEAD
        + window
            .series
            .iter()
            .map(|(name, series)| name.len() + series.len() * SERIES_POINT_BYTES)
            .sum::<usize>()
}
