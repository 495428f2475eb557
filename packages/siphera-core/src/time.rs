//! Wall-clock helpers.
//!
//! All protocol timestamps (message envelopes, sender keys, contact keys,
//! backups) are Unix milliseconds.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_LEGACY_CUTOFF_MS;

    #[test]
    fn test_clock_is_past_legacy_cutoff() {
        assert!(now_timestamp_millis() > DEFAULT_LEGACY_CUTOFF_MS);
    }

    #[test]
    fn test_millis_agree_with_seconds() {
        let secs = now_timestamp();
        let millis = now_timestamp_millis();
        assert!((millis / 1000 - secs).abs() <= 1);
    }
}
