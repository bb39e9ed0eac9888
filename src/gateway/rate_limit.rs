// =============================================================================
// Rate-limit tracker — soft preflight guard, not the circuit breaker
// =============================================================================
//
// Mirrors the exchange's own request-weight accounting from response headers
// so the gateway can stagger submissions before the exchange itself starts
// rejecting calls. This is advisory only; the circuit breaker is the hard
// failure-isolation mechanism.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1m: AtomicU32,
    last_updated_ms: AtomicU64,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1m: AtomicU32::new(0),
            last_updated_ms: AtomicU64::new(0),
        }
    }

    /// Parse rate-limit headers from an exchange response and update the
    /// tracked counters. Unrecognized headers are ignored.
    pub fn update_from_headers<'a>(&self, headers: impl IntoIterator<Item = (&'a str, &'a str)>, now_ms: i64) {
        for (name, value) in headers {
            let lower = name.to_ascii_lowercase();
            if let Ok(parsed) = value.parse::<u32>() {
                if lower.contains("used-weight") {
                    self.used_weight_1m.store(parsed, Ordering::Relaxed);
                } else if lower.contains("order-count-10s") {
                    self.order_count_10s.store(parsed, Ordering::Relaxed);
                } else if lower.contains("order-count-1m") {
                    self.order_count_1m.store(parsed, Ordering::Relaxed);
                }
            }
        }
        self.last_updated_ms.store(now_ms.max(0) as u64, Ordering::Relaxed);
    }

    pub fn used_weight(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    pub fn order_count_10s(&self) -> u32 {
        self.order_count_10s.load(Ordering::Relaxed)
    }

    /// Soft guard: suggests a caller stagger its requests when the tracked
    /// weight is approaching a conservative threshold (70% of the exchange's
    /// typical 1200/min budget).
    pub fn should_throttle(&self) -> bool {
        self.used_weight() > 840
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_headers() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(vec![("X-MBX-USED-WEIGHT-1M", "500"), ("X-MBX-ORDER-COUNT-10S", "3")], 1000);
        assert_eq!(tracker.used_weight(), 500);
        assert_eq!(tracker.order_count_10s(), 3);
    }

    #[test]
    fn throttle_guard_trips_above_threshold() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(vec![("X-MBX-USED-WEIGHT-1M", "900")], 1000);
        assert!(tracker.should_throttle());
    }

    #[test]
    fn ignores_unrecognized_headers() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(vec![("X-Unrelated", "42")], 1000);
        assert_eq!(tracker.used_weight(), 0);
    }
}
