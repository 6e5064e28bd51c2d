use crate::cache::CacheStats;
use crate::dedup::DedupSnapshot;
use crate::resilience::circuit_breaker::CircuitBreakerSnapshot;
use crate::resilience::concurrency::ConcurrencySnapshot;

/// Point-in-time view of the client's runtime state.
///
/// Facts only, no policy: callers can build load shedding or target
/// selection on top of these numbers.
#[derive(Debug, Clone, Default)]
pub struct SignalsSnapshot {
    pub concurrency: Option<ConcurrencySnapshot>,
    /// One entry per target the breaker has seen, sorted by target.
    pub circuits: Vec<CircuitBreakerSnapshot>,
    pub dedup_in_flight: Vec<DedupSnapshot>,
    pub cache: Option<CacheStats>,
}

impl SignalsSnapshot {
    /// Slots currently held past global admission, if a cap is configured.
    pub fn inflight_in_use(&self) -> Option<usize> {
        self.concurrency
            .as_ref()
            .and_then(|c| c.global.as_ref())
            .map(|g| g.in_use)
    }
}
