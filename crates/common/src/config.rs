//! Monitor configuration types.

use serde::{Deserialize, Serialize};

use crate::types::{CredentialSet, StationId};

/// Top-level monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Station API credentials.
    #[serde(default)]
    pub credentials: CredentialSet,

    /// Stations to track.
    #[serde(default)]
    pub stations: Vec<StationConfig>,

    /// Station API endpoint settings.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Fetch coordination parameters.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Memory pressure thresholds.
    #[serde(default)]
    pub pressure: PressureConfig,

    /// Cache budgets.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Refresh schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Historical window handling.
    #[serde(default)]
    pub history: HistoryConfig,

    /// Background computation limits.
    #[serde(default)]
    pub tasks: TaskConfig,
}

/// Configuration for a single station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Stable identifier (device MAC address).
    pub id: StationId,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Inactive stations are never fetched.
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Station API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Client-side request rate cap.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Request coordination parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Upper bound of the adaptive concurrency ceiling.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Cached data younger than this is not refetched by non-forced batches.
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,
    /// Delay between successive fetch starts within a batch.
    #[serde(default = "default_polite_delay_ms")]
    pub polite_delay_ms: u64,
}

/// Resident-memory thresholds (megabytes) for each pressure level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PressureConfig {
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_warning_mb")]
    pub warning_mb: u64,
    #[serde(default = "default_urgent_mb")]
    pub urgent_mb: u64,
    #[serde(default = "default_critical_mb")]
    pub critical_mb: u64,
}

/// Memory budgets for the in-memory caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_observation_budget")]
    pub observation_budget_bytes: usize,
    #[serde(default = "default_observation_items")]
    pub observation_max_items: usize,
    #[serde(default = "default_history_budget")]
    pub history_budget_bytes: usize,
    #[serde(default = "default_history_items")]
    pub history_max_items: usize,
    #[serde(default = "default_chart_budget")]
    pub chart_budget_bytes: usize,
    #[serde(default = "default_chart_items")]
    pub chart_max_items: usize,
    #[serde(default = "default_daily_stats_budget")]
    pub daily_stats_budget_bytes: usize,
    #[serde(default = "default_daily_stats_items")]
    pub daily_stats_max_items: usize,
}

/// Per-station refresh timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// How long a manual refresh keeps the station flagged as refreshing.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

/// Historical window handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// A daily window whose newest point today is older than this is refetched.
    #[serde(default = "default_daily_max_age")]
    pub daily_max_age_secs: u64,
    /// Long-retention series only replaced by its own extended-range fetch.
    #[serde(default = "default_auxiliary_series")]
    pub auxiliary_series: String,
    /// Non-auxiliary points older than this are dropped when windows merge.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    /// Days covered by the auxiliary extended-range fetch.
    #[serde(default = "default_auxiliary_days")]
    pub auxiliary_days: i64,
    /// Station-local UTC offset used for calendar-day boundaries.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Series used for daily high/low statistics.
    #[serde(default = "default_temperature_series")]
    pub temperature_series: String,
    /// Half the assumed diurnal swing used when estimating daily extremes.
    #[serde(default = "default_diurnal_amplitude")]
    pub diurnal_amplitude: f64,
}

/// Background computation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// 0 means the available parallelism of the host.
    #[serde(default)]
    pub max_parallelism: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    "https://rt.ambientweather.net/v1".into()
}
fn default_requests_per_second() -> u32 {
    1
}
fn default_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}
fn default_freshness_window() -> u64 {
    120
}
fn default_polite_delay_ms() -> u64 {
    150
}

fn default_sample_interval() -> u64 {
    30
}
fn default_warning_mb() -> u64 {
    200
}
fn default_urgent_mb() -> u64 {
    300
}
fn default_critical_mb() -> u64 {
    400
}

fn default_observation_budget() -> usize {
    8 * 1024 * 1024
}
fn default_observation_items() -> usize {
    256
}
fn default_history_budget() -> usize {
    32 * 1024 * 1024
}
fn default_history_items() -> usize {
    128
}
fn default_chart_budget() -> usize {
    4 * 1024 * 1024
}
fn default_chart_items() -> usize {
    512
}
fn default_daily_stats_budget() -> usize {
    512 * 1024
}
fn default_daily_stats_items() -> usize {
    1024
}

fn default_refresh_interval() -> u64 {
    300
}
fn default_settle_delay_ms() -> u64 {
    1500
}

fn default_daily_max_age() -> u64 {
    600
}
fn default_auxiliary_series() -> String {
    "lightning_day".into()
}
fn default_retention_hours() -> i64 {
    48
}
fn default_auxiliary_days() -> i64 {
    7
}
fn default_temperature_series() -> String {
    "tempf".into()
}
fn default_diurnal_amplitude() -> f64 {
    6.0
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            requests_per_second: default_requests_per_second(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            freshness_window_secs: default_freshness_window(),
            polite_delay_ms: default_polite_delay_ms(),
        }
    }
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
            warning_mb: default_warning_mb(),
            urgent_mb: default_urgent_mb(),
            critical_mb: default_critical_mb(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            observation_budget_bytes: default_observation_budget(),
            observation_max_items: default_observation_items(),
            history_budget_bytes: default_history_budget(),
            history_max_items: default_history_items(),
            chart_budget_bytes: default_chart_budget(),
            chart_max_items: default_chart_items(),
            daily_stats_budget_bytes: default_daily_stats_budget(),
            daily_stats_max_items: default_daily_stats_items(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            settle_delay_ms: default_settle_delay_ms(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            daily_max_age_secs: default_daily_max_age(),
            auxiliary_series: default_auxiliary_series(),
            retention_hours: default_retention_hours(),
            auxiliary_days: default_auxiliary_days(),
            utc_offset_minutes: 0,
            temperature_series: default_temperature_series(),
            diurnal_amplitude: default_diurnal_amplitude(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self { max_parallelism: 0 }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialSet::default(),
            stations: Vec::new(),
            endpoint: EndpointConfig::default(),
            fetch: FetchConfig::default(),
            pressure: PressureConfig::default(),
            cache: CacheConfig::default(),
            schedule: ScheduleConfig::default(),
            history: HistoryConfig::default(),
            tasks: TaskConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Active station ids in configuration order.
    pub fn active_stations(&self) -> Vec<StationId> {
        self.stations
            .iter()
            .filter(|s| s.active)
            .map(|s| s.id.clone())
            .collect()
    }
}
