//! Process-monotonic nanosecond clock.
//!
//! All virtual-runtime and timeout arithmetic works on signed nanosecond
//! deltas from a single process-wide anchor, taken on first use. Using one
//! anchor keeps every timestamp small and makes comparisons overflow-safe
//! for the lifetime of any realistic process.

use std::sync::OnceLock;
use std::time::Instant;

/// Nanoseconds elapsed since the process-wide anchor.
///
/// Monotone non-decreasing. The first call anchors the clock, so early
/// readings are near zero.
#[inline]
pub fn monotonic_nanos() -> i64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    // i64 nanos covers ~292 years from the anchor.
    Instant::now().duration_since(anchor).as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_decreasing() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        let c = monotonic_nanos();
        assert!(a >= 0);
        assert!(b >= a);
        assert!(c >= b);
    }

    #[test]
    fn advances_across_sleep() {
        let before = monotonic_nanos();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let after = monotonic_nanos();
        assert!(after - before >= 1_000_000);
    }
}
