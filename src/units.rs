//! Conversion between bandwidth (MB/s) and counter events per regulation
//! interval.
//!
//! One LLC miss moves one cache line, so over an interval of `T_ms`
//! milliseconds a bandwidth of `B` MB/s corresponds to
//! `B * 2^20 / (LINE * (1000 / T_ms))` events. Conversions round in opposite
//! directions (floor towards events, ceiling towards MB/s) so that a budget
//! derived from a bandwidth never admits more traffic than requested.

/// Bytes moved per LLC miss.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Number of counter events corresponding to `mb` MB/s over one regulation
/// interval of `interval_ms` milliseconds.
///
/// `1000 / interval_ms` is integer division, matching intervals that divide
/// one second.
pub fn events_for_mb(mb: u64, interval_ms: u32) -> u64 {
    let per_second = 1000 / u64::from(interval_ms.max(1));
    mb * 1024 * 1024 / (CACHE_LINE_SIZE * per_second.max(1))
}

/// Bandwidth in MB/s corresponding to `events` counter events observed over
/// one regulation interval of `interval_ms` milliseconds. Rounds up.
pub fn mb_for_events(events: u64, interval_ms: u32) -> u64 {
    let divisor = u64::from(interval_ms.max(1)) * 1024 * 1024;
    (events * CACHE_LINE_SIZE * 1000 + (divisor - 1)) / divisor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_within_one_mb() {
        // |mb(events(B)) - B| <= 1 for the whole regulated range.
        for &t in &[1u32, 2, 5, 10] {
            for b in 1..=30_000u64 {
                let back = mb_for_events(events_for_mb(b, t), t);
                let diff = if back > b { back - b } else { b - back };
                assert!(diff <= 1, "B={} T={} round-tripped to {}", b, t, back);
            }
        }
    }

    #[test]
    fn events_monotonic_in_bandwidth() {
        let mut prev = 0;
        for b in 0..=30_000u64 {
            let ev = events_for_mb(b, 1);
            assert!(ev >= prev);
            prev = ev;
        }
    }

    #[test]
    fn known_values_at_one_ms() {
        // 1 MB/s over 1 ms: 2^20 / (64 * 1000) = 16.384 -> 16 events.
        assert_eq!(events_for_mb(1, 1), 16);
        // 1000 MB/s over 1 ms: 16384 events exactly.
        assert_eq!(events_for_mb(1000, 1), 16_384);
        assert_eq!(mb_for_events(16_384, 1), 1000);
    }

    #[test]
    fn mb_rounds_up() {
        // One event is far below 1 MB/s but must not vanish.
        assert_eq!(mb_for_events(1, 1), 1);
        assert_eq!(mb_for_events(0, 1), 0);
    }

    #[test]
    fn longer_intervals_scale_budget() {
        // A 10 ms interval holds ten times the events of a 1 ms interval.
        assert_eq!(events_for_mb(1000, 10), 10 * events_for_mb(1000, 1));
    }
}
