//! Freshness gate: decides whether cached station data is still usable.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// True iff `last_updated` exists and `now - last_updated < window`.
pub fn is_fresh_at(last_updated: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    let Some(updated) = last_updated else {
        return false;
    };
    let Ok(window) = chrono::Duration::from_std(window) else {
        return true;
    };
    now.signed_duration_since(updated) < window
}

/// [`is_fresh_at`] against the wall clock.
pub fn is_fresh(last_updated: Option<DateTime<Utc>>, window: Duration) -> bool {
    is_fresh_at(last_updated, window, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(120);

    #[test]
    fn test_absent_timestamp_is_never_fresh() {
        assert!(!is_fresh(None, WINDOW));
        assert!(!is_fresh(None, Duration::from_secs(u32::MAX as u64)));
    }

    #[test]
    fn test_boundaries_around_window() {
        let now = Utc::now();
        let window = chrono::Duration::from_std(WINDOW).unwrap();
        let just_stale = now - window - chrono::Duration::seconds(1);
        let just_fresh = now - window + chrono::Duration::seconds(1);

        assert!(!is_fresh_at(Some(just_stale), WINDOW, now));
        assert!(is_fresh_at(Some(just_fresh), WINDOW, now));
    }

    #[test]
    fn test_exactly_window_old_is_stale() {
        let now = Utc::now();
        let updated = now - chrono::Duration::seconds(120);
        assert!(!is_fresh_at(Some(updated), WINDOW, now));
    }

    #[test]
    fn test_recent_update_is_fresh() {
        let updated = Utc::now() - chrono::Duration::seconds(30);
        assert!(is_fresh(Some(updated), WINDOW));
    }
}
