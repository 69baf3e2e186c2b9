//! Monotonic millisecond clock for TTLs and connection timeouts.

use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds elapsed since the first call in this process.
///
/// Monotonic, so TTL deadlines and idle timers are immune to wall-clock
/// adjustments.
pub fn now_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
