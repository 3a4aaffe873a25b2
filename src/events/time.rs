//! FILETIME conversion.
//!
//! The provider timestamps records in 100-nanosecond ticks since
//! 1601-01-01 UTC. Everything past this module works with `DateTime<Utc>`.

use chrono::{DateTime, Utc};

/// Seconds between 1601-01-01 and 1970-01-01.
pub const FILETIME_UNIX_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// FILETIME ticks per second.
pub const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Convert FILETIME ticks to a UTC timestamp.
///
/// Zero means "never set" and yields `None`.
pub fn filetime_to_utc(ticks: u64) -> Option<DateTime<Utc>> {
    if ticks == 0 {
        return None;
    }
    let secs = (ticks / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_EPOCH_OFFSET_SECS;
    let nanos = (ticks % FILETIME_TICKS_PER_SEC) as u32 * 100;
    DateTime::from_timestamp(secs, nanos)
}

/// Convert a UTC timestamp to FILETIME ticks. Sub-tick precision is
/// truncated; times before 1601 yield `None`.
pub fn utc_to_filetime(time: DateTime<Utc>) -> Option<u64> {
    let secs = time
        .timestamp()
        .checked_add(FILETIME_UNIX_EPOCH_OFFSET_SECS)?;
    let secs = u64::try_from(secs).ok()?;
    let ticks = u64::from(time.timestamp_subsec_nanos() / 100);
    secs.checked_mul(FILETIME_TICKS_PER_SEC)?.checked_add(ticks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_unix_epoch() {
        let ticks = FILETIME_UNIX_EPOCH_OFFSET_SECS as u64 * FILETIME_TICKS_PER_SEC;
        let time = filetime_to_utc(ticks).unwrap();
        assert_eq!(time, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn test_known_timestamp_with_subsecond() {
        // 2016-03-01T17:18:42.1234567Z
        let ticks = 131_013_263_221_234_567;
        let time = filetime_to_utc(ticks).unwrap();
        assert_eq!(time.to_rfc3339(), "2016-03-01T17:18:42.123456700+00:00");
    }

    #[test]
    fn test_zero_is_unset() {
        assert_eq!(filetime_to_utc(0), None);
    }

    #[test]
    fn test_before_unix_epoch() {
        // One second after the FILETIME epoch.
        let time = filetime_to_utc(FILETIME_TICKS_PER_SEC).unwrap();
        assert_eq!(time.to_rfc3339(), "1601-01-01T00:00:01+00:00");
    }

    #[test]
    fn test_pre_1601_has_no_filetime() {
        let time = Utc.with_ymd_and_hms(1500, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(utc_to_filetime(time), None);
    }

    proptest! {
        #[test]
        fn prop_conversion_is_exact(ticks in 1u64..=2_650_467_743_999_999_999) {
            let time = filetime_to_utc(ticks).unwrap();
            prop_assert_eq!(utc_to_filetime(time), Some(ticks));
        }

        #[test]
        fn prop_conversion_preserves_order(a in 1u64..u64::MAX / 4, b in 1u64..u64::MAX / 4) {
            let (ta, tb) = (filetime_to_utc(a).unwrap(), filetime_to_utc(b).unwrap());
            prop_assert_eq!(a.cmp(&b), ta.cmp(&tb));
        }
    }
}
