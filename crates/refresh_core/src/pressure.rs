//! Process memory pressure monitor.
//!
//! Samples resident memory on a fixed period and maps it to a
//! [`PressureLevel`]. Listeners hear about a level only when it changes,
//! so a steady Critical reading does not re-run the eviction cascade every
//! tick. Every tick additionally fans out a maintenance callback, which is
//! where ceilings relax one step at a time after pressure clears.

use std::sync::Arc;
use std::time::Duration;

use common::config::PressureConfig;
use common::PressureLevel;
use parking_lot::{Mutex, RwLock};
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MB: u64 = 1024 * 1024;

/// A component that reacts to pressure changes.
pub trait PressureListener: Send + Sync {
    /// Called once per level change, never for repeated samples of the same level.
    fn on_pressure_change(&self, previous: PressureLevel, current: PressureLevel);

    /// Called on every sampling tick with the current level.
    fn on_maintenance(&self, _level: PressureLevel) {}
}

/// Source of the process resident-set size.
pub trait MemorySampler: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the current process RSS through `sysinfo`.
pub struct ProcessMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemorySampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("Cannot resolve own pid, memory sampling disabled: {}", e);
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }
}

/// Resident-memory thresholds, strictly exceeded to enter a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureThresholds {
    pub warning_bytes: u64,
    pub urgent_bytes: u64,
    pub critical_bytes: u64,
}

impl PressureThresholds {
    pub fn from_config(cfg: &PressureConfig) -> Self {
        Self {
            warning_bytes: cfg.warning_mb * MB,
            urgent_bytes: cfg.urgent_mb * MB,
            critical_bytes: cfg.critical_mb * MB,
        }
    }

    pub fn level_for(&self, resident_bytes: u64) -> PressureLevel {
        if resident_bytes > self.critical_bytes {
            PressureLevel::Critical
        } else if resident_bytes > self.urgent_bytes {
            PressureLevel::Urgent
        } else if resident_bytes > self.warning_bytes {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self::from_config(&PressureConfig::default())
    }
}

pub struct MemoryPressureMonitor {
    sampler: Arc<dyn MemorySampler>,
    thresholds: PressureThresholds,
    sample_interval: Duration,
    level: watch::Sender<PressureLevel>,
    listeners: RwLock<Vec<Arc<dyn PressureListener>>>,
    last_resident_bytes: Mutex<Option<u64>>,
}

impl MemoryPressureMonitor {
    pub fn new(
        sampler: Arc<dyn MemorySampler>,
        thresholds: PressureThresholds,
        sample_interval: Duration,
    ) -> Self {
        let (level, _) = watch::channel(PressureLevel::Normal);
        Self {
            sampler,
            thresholds,
            sample_interval,
            level,
            listeners: RwLock::new(Vec::new()),
            last_resident_bytes: Mutex::new(None),
        }
    }

    pub fn from_config(sampler: Arc<dyn MemorySampler>, cfg: &PressureConfig) -> Self {
        Self::new(
            sampler,
            PressureThresholds::from_config(cfg),
            Duration::from_secs(cfg.sample_interval_secs.max(1)),
        )
    }

    pub fn add_listener(&self, listener: Arc<dyn PressureListener>) {
        self.listeners.write().push(listener);
    }

    pub fn current_level(&self) -> PressureLevel {
        *self.level.borrow()
    }

    /// Observe level changes as state.
    pub fn subscribe(&self) -> watch::Receiver<PressureLevel> {
        self.level.subscribe()
    }

    pub fn last_resident_bytes(&self) -> Option<u64> {
        *self.last_resident_bytes.lock()
    }

    /// Apply a resident-memory reading. Returns `(previous, current)` when the level changed.
    pub fn observe(&self, resident_bytes: u64) -> Option<(PressureLevel, PressureLevel)> {
        *self.last_resident_bytes.lock() = Some(resident_bytes);
        self.set_level(self.thresholds.level_for(resident_bytes))
    }

    /// Force a level, running the cascade if it differs from the current one.
    pub fn set_level(&self, level: PressureLevel) -> Option<(PressureLevel, PressureLevel)> {
        let previous = self.level.send_replace(level);
        if previous == level {
            return None;
        }

        if level > previous {
            warn!("Memory pressure rose: {} → {}", previous, level);
        } else {
            info!("Memory pressure eased: {} → {}", previous, level);
        }

        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_pressure_change(previous, level);
        }
        Some((previous, level))
    }

    /// One sampling cycle: read memory, apply the level, run maintenance.
    pub fn tick(&self) -> PressureLevel {
        match self.sampler.resident_bytes() {
            Some(bytes) => {
                debug!("Resident memory: {} MB", bytes / MB);
                self.observe(bytes);
            }
            None => debug!("Resident memory sample unavailable"),
        }

        let level = self.current_level();
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_maintenance(level);
        }
        level
    }

    /// Sample until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.sample_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Pressure monitor stopping");
                    return;
                }
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    struct FixedSampler(AtomicU64);

    impl MemorySampler for FixedSampler {
        fn resident_bytes(&self) -> Option<u64> {
            Some(self.0.load(Ordering::SeqCst))
        }
    }

    #[derive(Default)]
    struct CountingListener {
        changes: Mutex<Vec<(PressureLevel, PressureLevel)>>,
        maintenance: AtomicUsize,
    }

    impl PressureListener for CountingListener {
        fn on_pressure_change(&self, previous: PressureLevel, current: PressureLevel) {
            self.changes.lock().push((previous, current));
        }

        fn on_maintenance(&self, _level: PressureLevel) {
            self.maintenance.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn monitor_with(bytes: u64) -> (MemoryPressureMonitor, Arc<FixedSampler>) {
        let sampler = Arc::new(FixedSampler(AtomicU64::new(bytes)));
        let monitor = MemoryPressureMonitor::new(
            sampler.clone(),
            PressureThresholds::default(),
            Duration::from_secs(30),
        );
        (monitor, sampler)
    }

    #[test]
    fn test_threshold_mapping() {
        let t = PressureThresholds::default();
        assert_eq!(t.level_for(100 * MB), PressureLevel::Normal);
        assert_eq!(t.level_for(200 * MB), PressureLevel::Normal);
        assert_eq!(t.level_for(250 * MB), PressureLevel::Warning);
        assert_eq!(t.level_for(350 * MB), PressureLevel::Urgent);
        assert_eq!(t.level_for(450 * MB), PressureLevel::Critical);
    }

    #[test]
    fn test_listener_only_fires_on_change() {
        let (monitor, sampler) = monitor_with(100 * MB);
        let listener = Arc::new(CountingListener::default());
        monitor.add_listener(listener.clone());

        monitor.tick();
        monitor.tick();
        assert!(listener.changes.lock().is_empty());

        sampler.0.store(450 * MB, Ordering::SeqCst);
        monitor.tick();
        monitor.tick();
        monitor.tick();
        assert_eq!(
            *listener.changes.lock(),
            vec![(PressureLevel::Normal, PressureLevel::Critical)]
        );
        assert_eq!(listener.maintenance.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_jump_to_critical_is_single_transition() {
        let (monitor, _) = monitor_with(0);
        let listener = Arc::new(CountingListener::default());
        monitor.add_listener(listener.clone());

        assert_eq!(
            monitor.observe(500 * MB),
            Some((PressureLevel::Normal, PressureLevel::Critical))
        );
        assert_eq!(listener.changes.lock().len(), 1);
        assert_eq!(monitor.current_level(), PressureLevel::Critical);
    }

    #[test]
    fn test_subscribe_sees_latest_level() {
        let (monitor, _) = monitor_with(0);
        let rx = monitor.subscribe();
        monitor.observe(320 * MB);
        assert_eq!(*rx.borrow(), PressureLevel::Urgent);
        assert_eq!(monitor.last_resident_bytes(), Some(320 * MB));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        tokio::time::pause();
        let (monitor, _) = monitor_with(0);
        let monitor = Arc::new(monitor);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(monitor.clone().run(shutdown.clone()));

        tokio::time::advance(Duration::from_secs(61)).await;
        shutdown.cancel();
        handle.await.expect("monitor task should exit cleanly");
    }
}
