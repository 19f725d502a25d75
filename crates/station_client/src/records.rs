//! Conversion of station API records into domain types.

use chrono::{DateTime, Utc};
use common::{HistoricalWindow, StationId};
use refresh_core::fetch::parse_timestamp;
use refresh_core::{FetchError, HistoryRequest};
use serde_json::Value;

/// Record fields that are not measurements.
const NON_MEASUREMENT_FIELDS: &[&str] = &["dateutc", "date", "tz", "loc", "lastRain", "macAddress"];

/// Timestamp of one record.
pub fn record_time(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("dateutc")
        .and_then(parse_timestamp)
        .or_else(|| record.get("date").and_then(parse_timestamp))
}

/// Find the device entry for `station` in a device listing and return it.
pub fn select_device(listing: Value, station: &StationId) -> Result<Value, FetchError> {
    let Value::Array(devices) = listing else {
        return Err(FetchError::Parse("device listing is not an array".into()));
    };
    devices
        .into_iter()
        .find(|d| {
            d.get("macAddress")
                .and_then(Value::as_str)
                .map(|mac| mac.eq_ignore_ascii_case(station.as_str()))
                .unwrap_or(false)
        })
        .ok_or_else(|| FetchError::Status {
            status: 404,
            message: format!("station {} not in device listing", station),
        })
}

/// Fold history records into `window`, keeping points inside the requested
/// range. Returns the oldest record time seen, for paging.
pub fn fold_records(
    window: &mut HistoricalWindow,
    records: &[Value],
    request: &HistoryRequest,
) -> Option<DateTime<Utc>> {
    let mut oldest: Option<DateTime<Utc>> = None;
    for record in records {
        let Some(at) = record_time(record) else {
            continue;
        };
        oldest = Some(oldest.map_or(at, |o| o.min(at)));
        if at < request.start || at > request.end {
            continue;
        }
        let Some(fields) = record.as_object() else {
            continue;
        };
        for (name, value) in fields {
            if NON_MEASUREMENT_FIELDS.contains(&name.as_str()) {
                continue;
            }
            if let Some(only) = &request.only_series {
                if name != only {
                    continue;
                }
            }
            if let Some(v) = value.as_f64() {
                window.series.entry(name.clone()).or_default().insert(at, v);
            }
        }
    }
    oldest
}
