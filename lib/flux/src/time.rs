use lazy_static::lazy_static;
use std::time::{Instant, SystemTime};

lazy_static! {
    static ref MONOTONIC_EPOCH: Instant = Instant::now();
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}

/// Returns the microseconds elapsed on the process-local monotonic clock.
/// The first call pins the epoch. Never returns zero, so zero stays usable
/// as a "no deadline" sentinel.
#[inline]
pub fn monotonic_usec() -> u64 {
    MONOTONIC_EPOCH.elapsed().as_micros() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_nonzero() {
        assert!(monotonic_usec() > 0);
    }

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_usec();
        let b = monotonic_usec();
        assert!(b >= a);
    }
}
