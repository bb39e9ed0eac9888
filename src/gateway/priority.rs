// =============================================================================
// Priority dispatch — tiered call scheduling ahead of every gateway method
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::sleep;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MAX_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

/// Shared in-flight CRITICAL counter. Non-CRITICAL callers wait (bounded) for
/// it to reach zero before proceeding; CRITICAL callers never wait on it.
#[derive(Default)]
pub struct PriorityGate {
    critical_in_flight: AtomicU32,
}

impl PriorityGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for any in-flight CRITICAL call to clear (if this call itself is
    /// not CRITICAL), polling every 10 ms up to a 5 s bound, then return a
    /// guard that tracks this call's own CRITICAL occupancy (if any).
    pub async fn acquire(&self, priority: Priority) -> PriorityGuard<'_> {
        if priority != Priority::Critical {
            let mut waited = Duration::ZERO;
            while self.critical_in_flight.load(Ordering::Acquire) > 0 && waited < MAX_WAIT {
                sleep(POLL_INTERVAL).await;
                waited += POLL_INTERVAL;
            }
        }

        if priority == Priority::Critical {
            self.critical_in_flight.fetch_add(1, Ordering::AcqRel);
            PriorityGuard { gate: Some(self) }
        } else {
            PriorityGuard { gate: None }
        }
    }
}

/// Drop guard releasing the in-flight CRITICAL slot this call took, if any.
pub struct PriorityGuard<'a> {
    gate: Option<&'a PriorityGate>,
}

impl Drop for PriorityGuard<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.gate {
            gate.critical_in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn normal_call_proceeds_when_no_critical_in_flight() {
        let gate = PriorityGate::new();
        let _guard = gate.acquire(Priority::Normal).await;
    }

    #[tokio::test]
    async fn critical_call_increments_and_releases_counter() {
        let gate = PriorityGate::new();
        {
            let _guard = gate.acquire(Priority::Critical).await;
            assert_eq!(gate.critical_in_flight.load(Ordering::Acquire), 1);
        }
        assert_eq!(gate.critical_in_flight.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn normal_call_waits_out_critical_before_proceeding() {
        let gate = PriorityGate::new();
        let critical_guard = gate.acquire(Priority::Critical).await;
        let waited = tokio::time::timeout(Duration::from_millis(50), gate.acquire(Priority::Normal)).await;
        assert!(waited.is_err(), "normal call should still be waiting on CRITICAL");
        drop(critical_guard);
    }
}
