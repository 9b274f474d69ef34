//! UUID v7 utilities for time-ordered identifiers.
//!
//! Job and batch ids are UUIDv7 so that ids sort by creation time, which keeps
//! queue ordering and index locality stable in the durable store.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check whether a UUID is version 7.
pub fn is_v7(id: &Uuid) -> bool {
    id.get_version_num() == 7
}

/// Extract the embedded creation timestamp from a UUIDv7.
///
/// Returns `None` for other UUID versions.
pub fn extract_timestamp(id: &Uuid) -> Option<DateTime<Utc>> {
    if !is_v7(id) {
        return None;
    }
    let bytes = id.as_bytes();
    let millis = bytes[..6]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Utc.timestamp_millis_opt(millis as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_v7_is_version_7() {
        let id = new_v7();
        assert!(is_v7(&id));
    }

    #[test]
    fn test_v4_is_not_v7() {
        let id = Uuid::new_v4();
        assert!(!is_v7(&id));
        assert!(extract_timestamp(&id).is_none());
    }

    #[test]
    fn test_extract_timestamp_close_to_now() {
        let before = Utc::now();
        let id = new_v7();
        let ts = extract_timestamp(&id).unwrap();
        let delta = (ts - before).num_milliseconds().abs();
        assert!(delta < 1_000, "timestamp drift {delta}ms");
    }

    #[test]
    fn test_v7_ids_are_time_ordered() {
        let a = new_v7();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_v7();
        assert!(a < b);
    }
}
