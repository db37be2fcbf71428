//! A monotonic nanosecond clock shared by reports and containers.

use std::time::Instant;

use lazy_static::lazy_static;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Returns the nanoseconds elapsed since the first call into this clock.
///
/// Values are monotonic across threads and only meaningful relative to each
/// other.
pub fn now_ns() -> u64 {
    u64::try_from(EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_monotonic() {
        let first = now_ns();
        let second = now_ns();
        assert!(second >= first);
    }
}
