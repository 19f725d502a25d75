//! Seam to the network: the fetch collaborator, its error type, lenient
//! payload decoding and payload timestamp extraction.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use common::{HistoricalWindow, RequestIdentity, WindowRole};
use serde_json::Value;
use thiserror::Error;

/// Failure of a single fetch. `Clone` so one outcome can be handed to every
/// caller sharing the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("transport: {0}")]
    Transport(String),

    #[error("parse: {0}")]
    Parse(String),

    #[error("fetch cancelled")]
    Cancelled,
}

impl From<FetchError> for common::Error {
    fn from(e: FetchError) -> Self {
        use common::Error;
        match e {
            FetchError::RateLimited => Error::RateLimited("station API".into()),
            FetchError::Status { status, message } => Error::Http { status, message },
            FetchError::Transport(msg) => Error::Transport(msg),
            FetchError::Parse(msg) => Error::Parse(msg),
            FetchError::Cancelled => Error::Cancelled("fetch".into()),
        }
    }
}

/// Time range for a historical fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub role: WindowRole,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Restrict the fetch to one series (the auxiliary extended-range fetch).
    pub only_series: Option<String>,
}

impl HistoryRequest {
    pub fn new(role: WindowRole, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            role,
            start,
            end,
            only_series: None,
        }
    }
}

/// The network collaborator the coordinator drives.
#[async_trait]
pub trait StationFetcher: Send + Sync {
    /// Latest conditions payload.
    async fn fetch_current(&self, identity: &RequestIdentity) -> Result<Value, FetchError>;

    /// A historical window covering `request`.
    async fn fetch_history(
        &self,
        identity: &RequestIdentity,
        request: HistoryRequest,
    ) -> Result<HistoricalWindow, FetchError>;
}

// ── Lenient decoding ──────────────────────────────────────────────────

/// Decode a JSON body, falling back to the first complete JSON value found
/// in the text when the body as a whole is malformed (BOMs, log prefixes,
/// truncated trailers).
pub fn decode_lenient(body: &str) -> Result<Value, FetchError> {
    let strict_err = match serde_json::from_str::<Value>(body) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let Some(start) = body.find(|c: char| c == '{' || c == '[') else {
        return Err(FetchError::Parse(strict_err.to_string()));
    };

    let mut stream = serde_json::Deserializer::from_str(&body[start..]).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => {
            tracing::debug!("Recovered JSON payload with lenient decoding: {}", strict_err);
            Ok(value)
        }
        _ => Err(FetchError::Parse(strict_err.to_string())),
    }
}

// ── Timestamp extraction ──────────────────────────────────────────────

/// Finds the observation time of a payload.
pub trait TimestampExtractor: Send + Sync {
    /// Most recent timestamp found anywhere in the payload.
    fn most_recent(&self, payload: &Value) -> Option<DateTime<Utc>>;

    /// Timestamp of the single documented fallback field.
    fn named_field(&self, payload: &Value) -> Option<DateTime<Utc>>;
}

/// Walks a JSON payload looking for time-like keys.
#[derive(Debug, Clone)]
pub struct JsonTimestampExtractor {
    keys: Vec<String>,
    fallback_field: String,
}

impl JsonTimestampExtractor {
    pub fn new(keys: Vec<String>, fallback_field: impl Into<String>) -> Self {
        Self {
            keys,
            fallback_field: fallback_field.into(),
        }
    }

    fn collect(&self, value: &Value, out: &mut Option<DateTime<Utc>>) {
        match value {
            Value::Object(map) => {
                for (key, v) in map {
                    if self.keys.iter().any(|k| k.eq_ignore_ascii_case(key)) {
                        if let Some(ts) = parse_timestamp(v) {
                            *out = Some(out.map_or(ts, |cur| cur.max(ts)));
                        }
                    }
                    self.collect(v, out);
                }
            }
            Value::Array(items) => {
                for v in items {
                    self.collect(v, out);
                }
            }
            _ => {}
        }
    }

    fn find_field<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        match value {
            Value::Object(map) => map.get(&self.fallback_field).or_else(|| {
                map.values().find_map(|v| self.find_field(v))
            }),
            Value::Array(items) => items.iter().find_map(|v| self.find_field(v)),
            _ => None,
        }
    }
}

impl Default for JsonTimestampExtractor {
    fn default() -> Self {
        Self::new(
            ["dateutc", "date", "timestamp", "time", "obs_time", "ts"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            "dateutc",
        )
    }
}

impl TimestampExtractor for JsonTimestampExtractor {
    fn most_recent(&self, payload: &Value) -> Option<DateTime<Utc>> {
        let mut latest = None;
        self.collect(payload, &mut latest);
        latest
    }

    fn named_field(&self, payload: &Value) -> Option<DateTime<Utc>> {
        self.find_field(payload).and_then(parse_timestamp)
    }
}

/// Epoch seconds, epoch milliseconds or RFC 3339.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let raw = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            // Anything past year ~5138 in seconds is taken as milliseconds.
            if raw.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(|n| parse_timestamp(&Value::from(n)))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_strict() {
        let v = decode_lenient(r#"{"tempf": 71.2}"#).expect("valid json");
        assert_eq!(v["tempf"], json!(71.2));
    }

    #[test]
    fn test_decode_recovers_from_prefix_and_trailer() {
        let body = "\u{feff}data: [{\"dateutc\": 1700000000000}] <!-- trailer";
        let v = decode_lenient(body).expect("should recover");
        assert_eq!(v[0]["dateutc"], json!(1700000000000i64));
    }

    #[test]
    fn test_decode_gives_up_on_garbage() {
        assert!(matches!(decode_lenient("<html>502</html>"), Err(FetchError::Parse(_))));
        assert!(matches!(decode_lenient("{\"tempf\": "), Err(FetchError::Parse(_))));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let secs = parse_timestamp(&json!(1_700_000_000)).unwrap();
        let millis = parse_timestamp(&json!(1_700_000_000_000i64)).unwrap();
        let rfc = parse_timestamp(&json!("2023-11-14T22:13:20Z")).unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs, rfc);
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn test_most_recent_scans_nested_payload() {
        let payload = json!({
            "macAddress": "AA:BB",
            "lastData": {"dateutc": 1_700_000_000_000i64, "tempf": 70.1},
            "history": [
                {"date": "2023-11-14T22:20:00Z"},
                {"date": "2023-11-14T22:10:00Z"}
            ]
        });
        let extractor = JsonTimestampExtractor::default();
        let latest = extractor.most_recent(&payload).unwrap();
        assert_eq!(latest, parse_timestamp(&json!("2023-11-14T22:20:00Z")).unwrap());
        let named = extractor.named_field(&payload).unwrap();
        assert_eq!(named, parse_timestamp(&json!(1_700_000_000_000i64)).unwrap());
    }

    #[test]
    fn test_no_timestamps() {
        let extractor = JsonTimestampExtractor::default();
        assert!(extractor.most_recent(&json!({"tempf": 1})).is_none());
        assert!(extractor.named_field(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_fetch_error_maps_into_common_error() {
        let e: common::Error = FetchError::Status {
            status: 503,
            message: "unavailable".into(),
        }
        .into();
        assert!(matches!(e, common::Error::Http { status: 503, .. }));
    }
}
