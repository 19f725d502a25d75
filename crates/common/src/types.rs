//! Domain types shared across the monitor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Stations ──────────────────────────────────────────────────────────

/// Stable identifier of a tracked station (e.g. the device MAC address).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub String);

impl StationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// API credentials a request is issued under.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CredentialSet {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub application_key: String,
}

impl CredentialSet {
    pub fn new(api_key: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            application_key: application_key.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.application_key.trim().is_empty()
    }
}

// Keys never reach the logs.
impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = |k: &str| {
            let skip = k.chars().count().saturating_sub(4);
            format!("…{}", k.chars().skip(skip).collect::<String>())
        };
        f.debug_struct("CredentialSet")
            .field("api_key", &tail(&self.api_key))
            .field("application_key", &tail(&self.application_key))
            .finish()
    }
}

/// What a fetch retrieves for a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    /// Latest conditions.
    Current,
    /// A historical window with the given role.
    History(WindowRole),
    /// The dedicated extended-range fetch of the auxiliary series.
    Auxiliary,
}

/// Deduplicatable unit of work: equal identities share one network call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    pub credentials: CredentialSet,
    pub station: StationId,
    pub kind: FetchKind,
}

impl RequestIdentity {
    pub fn current(credentials: CredentialSet, station: StationId) -> Self {
        Self {
            credentials,
            station,
            kind: FetchKind::Current,
        }
    }

    pub fn history(credentials: CredentialSet, station: StationId, role: WindowRole) -> Self {
        Self {
            credentials,
            station,
            kind: FetchKind::History(role),
        }
    }

    pub fn auxiliary(credentials: CredentialSet, station: StationId) -> Self {
        Self {
            credentials,
            station,
            kind: FetchKind::Auxiliary,
        }
    }
}

/// Latest conditions payload for a station.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationObservation {
    pub station: StationId,
    /// Most recent timestamp found in the payload.
    pub observed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ── Pressure & priority ───────────────────────────────────────────────

/// Discretized process memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal = 0,
    Warning = 1,
    Urgent = 2,
    Critical = 3,
}

impl PressureLevel {
    pub fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Normal,
            1 => Self::Warning,
            2 => Self::Urgent,
            _ => Self::Critical,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }
}

impl Default for PressureLevel {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority class of background computation, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Historical windows ────────────────────────────────────────────────

/// Role of a fetched time-series window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowRole {
    /// Short user-selected chart range (last hour / 6h / 24h).
    Interactive,
    /// Local midnight to now; source of daily high/low statistics.
    Daily,
}

/// A measurement series keyed by timestamp.
pub type Series = BTreeMap<DateTime<Utc>, f64>;

/// Gap-free time range backed by fetched data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coverage {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Coverage {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at <= self.end
    }
}

/// A time-series payload for one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalWindow {
    pub station: StationId,
    pub role: WindowRole,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Named measurement series (e.g. "tempf", "humidity").
    #[serde(default)]
    pub series: BTreeMap<String, Series>,
    /// Range continuously covered since the last daily-role fetch.
    #[serde(default)]
    pub daily_coverage: Option<Coverage>,
}

impl HistoricalWindow {
    pub fn new(
        station: StationId,
        role: WindowRole,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            station,
            role,
            start,
            end,
            series: BTreeMap::new(),
            daily_coverage: None,
        }
    }

    /// Total number of points across all series.
    pub fn point_count(&self) -> usize {
        self.series.values().map(|s| s.len()).sum()
    }

    /// Latest timestamp present in any series.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.series
            .values()
            .filter_map(|s| s.keys().next_back().copied())
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_level_ordering() {
        assert!(PressureLevel::Critical > PressureLevel::Urgent);
        assert!(PressureLevel::Warning > PressureLevel::Normal);
        assert_eq!(PressureLevel::from_u8(2), PressureLevel::Urgent);
        assert_eq!(PressureLevel::from_u8(9), PressureLevel::Critical);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = CredentialSet::new("secret-api-key-1234", "app-key-abcd");
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("secret-api-key"));
        assert!(rendered.contains("1234"));
    }

    #[test]
    fn test_identities_differ_by_kind() {
        let creds = CredentialSet::new("a", "b");
        let current = RequestIdentity::current(creds.clone(), "st-1".into());
        let daily = RequestIdentity::history(creds, "st-1".into(), WindowRole::Daily);
        assert_ne!(current, daily);
    }
}
