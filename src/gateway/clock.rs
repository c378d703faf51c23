//! Radio clock.
//!
//! Microseconds since the gateway started, from a monotonic source. The
//! forwarder protocol carries the low 32 bits (`tmst`), which wrap about
//! every 71 minutes; [`expand_tmst`] maps them back onto the 64-bit clock.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// A clock that already reads `elapsed`, so its time base matches a
    /// counter started earlier (e.g. the ESP timer, which counts from boot).
    pub fn with_elapsed(elapsed: Duration) -> Self {
        let now = Instant::now();
        Self {
            origin: now.checked_sub(elapsed).unwrap_or(now),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a 32-bit timestamp to the 64-bit clock, choosing the value
/// closest to `now_us` (at most ±35 minutes away).
pub fn expand_tmst(tmst: u32, now_us: u64) -> u64 {
    let delta = tmst.wrapping_sub(now_us as u32) as i32 as i64;
    (now_us as i64 + delta).max(0) as u64
}

/// Current UTC time in milliseconds since the Unix epoch.
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lora_1ch_gateway_macros::esp32_test;

    #[esp32_test]
    fn test_clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_us();
        std::thread::sleep(Duration::from_millis(2));
        assert!(clock.now_us() >= a + 2_000);
    }

    #[esp32_test]
    fn test_clock_with_elapsed_starts_ahead() {
        let clock = Clock::with_elapsed(Duration::from_millis(250));
        assert!(clock.now_us() >= 250_000);
    }

    #[esp32_test]
    fn test_expand_tmst() {
        assert_eq!(expand_tmst(1_500_000, 1_000_000), 1_500_000);
        assert_eq!(expand_tmst(500_000, 1_000_000), 500_000);

        // Across the 32-bit wrap
        let now = (1u64 << 32) + 100;
        assert_eq!(expand_tmst(200, now), now + 100);
        assert_eq!(expand_tmst(u32::MAX, now), now - 101);

        // Never negative
        assert_eq!(expand_tmst(u32::MAX - 10, 5), 0);
    }
}
