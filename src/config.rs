//! Configuration loader: merges env vars, .env file, and config.toml.

use common::config::{MonitorConfig, StationConfig};
use common::{Error, StationId};
use std::path::Path;

fn parse_positive_u64(raw: &str, env_name: &str) -> Result<u64, Error> {
    let parsed = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::Config(format!("{env_name} must be an integer > 0")))?;
    if parsed == 0 {
        return Err(Error::Config(format!("{env_name} must be an integer > 0")));
    }
    Ok(parsed)
}

fn parse_positive_usize(raw: &str, env_name: &str) -> Result<usize, Error> {
    parse_positive_u64(raw, env_name).map(|v| v as usize)
}

/// Comma-separated station ids, e.g. `AA:BB:CC:DD:EE:01,AA:BB:CC:DD:EE:02`.
fn parse_station_list(raw: &str) -> Vec<StationConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| StationConfig {
            id: StationId::new(id),
            name: String::new(),
            active: true,
        })
        .collect()
}

fn validate_config(config: &MonitorConfig) -> Result<(), Error> {
    let mut issues: Vec<String> = Vec::new();

    if config.stations.is_empty() {
        issues.push("stations must contain at least one station".into());
    }
    if !config.stations.is_empty() && config.active_stations().is_empty() {
        issues.push("at least one station must be active".into());
    }
    if config.credentials.api_key.trim().is_empty() {
        issues.push("STATION_API_KEY is required".into());
    }
    if config.credentials.application_key.trim().is_empty() {
        issues.push("STATION_APPLICATION_KEY is required".into());
    }

    if config.endpoint.base_url.trim().is_empty() {
        issues.push("endpoint.base_url must not be empty".into());
    }
    if config.endpoint.timeout_secs == 0 {
        issues.push("endpoint.timeout_secs must be > 0".into());
    }

    if config.fetch.max_concurrency == 0 {
        issues.push("fetch.max_concurrency must be > 0".into());
    }

    if config.pressure.sample_interval_secs == 0 {
        issues.push("pressure.sample_interval_secs must be > 0".into());
    }
    if config.pressure.warning_mb >= config.pressure.urgent_mb {
        issues.push("pressure.warning_mb must be < pressure.urgent_mb".into());
    }
    if config.pressure.urgent_mb >= config.pressure.critical_mb {
        issues.push("pressure.urgent_mb must be < pressure.critical_mb".into());
    }

    if config.cache.observation_budget_bytes == 0 || config.cache.observation_max_items == 0 {
        issues.push("cache.observation_* limits must be > 0".into());
    }
    if config.cache.history_budget_bytes == 0 || config.cache.history_max_items == 0 {
        issues.push("cache.history_* limits must be > 0".into());
    }
    if config.cache.chart_budget_bytes == 0 || config.cache.chart_max_items == 0 {
        issues.push("cache.chart_* limits must be > 0".into());
    }
    if config.cache.daily_stats_budget_bytes == 0 || config.cache.daily_stats_max_items == 0 {
        issues.push("cache.daily_stats_* limits must be > 0".into());
    }

    if config.schedule.refresh_interval_secs == 0 {
        issues.push("schedule.refresh_interval_secs must be > 0".into());
    }

    if config.history.auxiliary_days <= 0 {
        issues.push("history.auxiliary_days must be > 0".into());
    }
    if config.history.retention_hours < 24 {
        issues.push("history.retention_hours must be >= 24".into());
    }
    if config.history.auxiliary_series.trim().is_empty() {
        issues.push("history.auxiliary_series must not be empty".into());
    }
    if config.history.utc_offset_minutes.abs() >= 24 * 60 {
        issues.push("history.utc_offset_minutes must be within +/- 1439".into());
    }
    if config.history.diurnal_amplitude < 0.0 {
        issues.push("history.diurnal_amplitude must be >= 0".into());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid config:\n - {}",
            issues.join("\n - ")
        )))
    }
}

/// Load monitor configuration from environment and optional config file.
pub fn load_config() -> Result<MonitorConfig, Error> {
    // 1. Load .env file from project root or parent directories.
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }

    // 2. Start with defaults.
    let mut config = MonitorConfig::default();

    // 3. Try loading config.toml if it exists.
    let config_path = Path::new("config.toml");
    if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read config.toml: {}", e)))?;
        config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config.toml: {}", e)))?;
    }

    // 4. Override with environment variables (highest priority).
    if let Ok(key) = std::env::var("STATION_API_KEY") {
        config.credentials.api_key = key;
    }
    if let Ok(key) = std::env::var("STATION_APPLICATION_KEY") {
        config.credentials.application_key = key;
    }
    if let Ok(url) = std::env::var("STATION_BASE_URL") {
        config.endpoint.base_url = url.trim().to_string();
    }
    if let Ok(raw) = std::env::var("STATION_IDS") {
        let stations = parse_station_list(&raw);
        if !stations.is_empty() {
            config.stations = stations;
        }
    }
    if let Ok(raw) = std::env::var("STATION_REFRESH_INTERVAL_SECS") {
        config.schedule.refresh_interval_secs =
            parse_positive_u64(&raw, "STATION_REFRESH_INTERVAL_SECS")?;
    }
    if let Ok(raw) = std::env::var("STATION_MAX_CONCURRENCY") {
        config.fetch.max_concurrency = parse_positive_usize(&raw, "STATION_MAX_CONCURRENCY")?;
    }
    if let Ok(raw) = std::env::var("STATION_FRESHNESS_WINDOW_SECS") {
        config.fetch.freshness_window_secs =
            parse_positive_u64(&raw, "STATION_FRESHNESS_WINDOW_SECS")?;
    }

    // 5. Validate.
    validate_config(&config)?;

    Ok(config)
}
