use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub consecutive_failures: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
    pub probe_in_flight: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(rename = "cooldown_ms", with = "crate::utils::serde_millis")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the cooldown duration
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

#[derive(Debug)]
struct TargetState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl TargetState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`CircuitPermit::record`]. A probe permit dropped
/// without a report (e.g. the caller was cancelled) frees the probe slot so
/// the next request can probe instead.
#[must_use]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    target: String,
    probe: bool,
    recorded: bool,
}

impl CircuitPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Report the outcome. Returns `true` when this failure is the one that opened the circuit.
    pub fn record(mut self, success: bool) -> bool {
        self.recorded = true;
        if success {
            self.breaker.on_success(&self.target, self.probe);
            false
        } else {
            self.breaker.on_failure(&self.target, self.probe)
        }
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.recorded {
            self.breaker.release_probe(&self.target);
        }
    }
}

/// Per-target circuit breaker.
///
/// - Counts consecutive failures per target; a success resets the count
/// - Opens at the threshold and fast-fails every request while open
/// - After the cooldown admits exactly one probe (half-open); other requests
///   arriving while the probe is outstanding are fast-failed
/// - Probe success closes the circuit, probe failure reopens it and restarts the cooldown
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    targets: Mutex<HashMap<String, TargetState>>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn poisoned(target: &str) -> Error {
        Error::configuration_with_context(
            "CircuitBreaker poisoned",
            ErrorContext::new()
                .with_target(target)
                .with_source("circuit_breaker"),
        )
    }

    /// Ask for admission to `target`.
    pub fn try_acquire(&self, target: &str) -> Result<CircuitPermit<'_>> {
        let mut targets = self.targets.lock().map_err(|_| Self::poisoned(target))?;
        let st = targets
            .entry(target.to_string())
            .or_insert_with(TargetState::closed);
        let now = Instant::now();

        let probe = match st.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = st.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.cfg.cooldown {
                    return Err(self.open_error(target, Some(self.cfg.cooldown - elapsed)));
                }
                st.state = CircuitState::HalfOpen;
                st.probe_in_flight = true;
                tracing::info!(target = target, "circuit half-open, admitting probe");
                true
            }
            CircuitState::HalfOpen => {
                if st.probe_in_flight {
                    return Err(self.open_error(target, None));
                }
                st.probe_in_flight = true;
                true
            }
        };

        Ok(CircuitPermit {
            breaker: self,
            target: target.to_string(),
            probe,
            recorded: false,
        })
    }

    fn open_error(&self, target: &str, retry_in: Option<Duration>) -> Error {
        Error::CircuitOpen {
            target: target.to_string(),
            retry_in,
            context: ErrorContext::new()
                .with_target(target)
                .with_source("circuit_breaker"),
        }
    }

    fn on_success(&self, target: &str, probe: bool) {
        let Ok(mut targets) = self.targets.lock() else {
            return;
        };
        let Some(st) = targets.get_mut(target) else {
            return;
        };
        match st.state {
            CircuitState::Closed => st.consecutive_failures = 0,
            CircuitState::HalfOpen if probe => {
                *st = TargetState::closed();
                tracing::info!(target = target, "circuit closed after successful probe");
            }
            // Late results from calls admitted before the circuit opened.
            _ => {}
        }
    }

    /// Count a failure; `true` when this call moved the circuit to open.
    fn on_failure(&self, target: &str, probe: bool) -> bool {
        let Ok(mut targets) = self.targets.lock() else {
            return false;
        };
        let Some(st) = targets.get_mut(target) else {
            return false;
        };
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                if st.consecutive_failures < self.cfg.failure_threshold {
                    return false;
                }
                st.state = CircuitState::Open;
                st.opened_at = Some(Instant::now());
                tracing::warn!(
                    target = target,
                    consecutive_failures = st.consecutive_failures,
                    cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                    "circuit opened"
                );
                true
            }
            CircuitState::HalfOpen if probe => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                st.state = CircuitState::Open;
                st.opened_at = Some(Instant::now());
                st.probe_in_flight = false;
                tracing::warn!(target = target, "probe failed, circuit reopened");
                true
            }
            _ => false,
        }
    }

    fn release_probe(&self, target: &str) {
        if let Ok(mut targets) = self.targets.lock() {
            if let Some(st) = targets.get_mut(target) {
                if st.state == CircuitState::HalfOpen {
                    st.probe_in_flight = false;
                }
            }
        }
    }

    /// Run `op` under the breaker for `target`, counting every `Err` as a failure.
    pub async fn call<T, F, Fut>(&self, target: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire(target)?;
        let outcome = op().await;
        permit.record(outcome.is_ok());
        outcome
    }

    pub fn state(&self, target: &str) -> CircuitState {
        self.targets
            .lock()
            .ok()
            .and_then(|t| t.get(target).map(|s| s.state))
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, target: &str) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let targets = self.targets.lock().ok();
        let st = targets.as_ref().and_then(|t| t.get(target));
        self.snapshot_of(target, st, now)
    }

    /// Snapshots of every target the breaker has seen.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let now = Instant::now();
        let Ok(targets) = self.targets.lock() else {
            return Vec::new();
        };
        let mut out: Vec<_> = targets
            .iter()
            .map(|(k, st)| self.snapshot_of(k, Some(st), now))
            .collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    fn snapshot_of(
        &self,
        target: &str,
        st: Option<&TargetState>,
        now: Instant,
    ) -> CircuitBreakerSnapshot {
        let (state, consecutive_failures, open_remaining_ms, probe_in_flight) = match st {
            Some(st) => {
                let remaining = match (st.state, st.opened_at) {
                    (CircuitState::Open, Some(at)) => {
                        let until = at + self.cfg.cooldown;
                        if until > now {
                            Some((until - now).as_millis() as u64)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };
                (st.state, st.consecutive_failures, remaining, st.probe_in_flight)
            }
            None => (CircuitState::Closed, 0, None, false),
        };
        CircuitBreakerSnapshot {
            target: target.to_string(),
            state,
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            consecutive_failures,
            open_remaining_ms,
            probe_in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing() -> Result<()> {
        Err(Error::validation_with_context("boom", ErrorContext::new()))
    }

    #[test]
    fn test_circuit_breaker_config_defaults() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_circuit_breaker_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_cooldown(Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(5));

        for _ in 0..2 {
            let _ = cb.call("a", || async { failing() }).await;
        }
        assert_eq!(cb.snapshot("a").consecutive_failures, 2);

        cb.call("a", || async { Ok(()) }).await.unwrap();
        assert_eq!(cb.snapshot("a").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_call_fast_fails_then_single_probe() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(5)
                .with_cooldown(Duration::from_millis(100)),
        );
        let calls = AtomicU32::new(0);

        for _ in 0..5 {
            let res = cb
                .call("svc", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    failing()
                })
                .await;
            assert!(matches!(res, Err(Error::Validation { .. })));
        }
        assert_eq!(cb.state("svc"), CircuitState::Open);

        let res = cb
            .call("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        tokio::time::sleep(Duration::from_millis(110)).await;

        // Exactly one probe is admitted while it is outstanding.
        let probe = cb.try_acquire("svc").unwrap();
        assert!(probe.is_probe());
        assert!(matches!(
            cb.try_acquire("svc"),
            Err(Error::CircuitOpen { .. })
        ));
        probe.record(true);

        let snapshot = cb.snapshot("svc");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_restarts_cooldown() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(2)
                .with_cooldown(Duration::from_millis(50)),
        );
        for _ in 0..2 {
            let _ = cb.call("a", || async { failing() }).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let _ = cb.call("a", || async { failing() }).await;
        assert_eq!(cb.state("a"), CircuitState::Open);
        assert!(cb.snapshot("a").open_remaining_ms.unwrap() > 40);

        tokio::time::sleep(Duration::from_millis(60)).await;
        cb.call("a", || async { Ok(()) }).await.unwrap();
        assert_eq!(cb.state("a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_probe_frees_slot() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_cooldown(Duration::from_millis(10)),
        );
        let _ = cb.call("a", || async { failing() }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let probe = cb.try_acquire("a").unwrap();
        drop(probe);
        assert_eq!(cb.state("a"), CircuitState::HalfOpen);
        assert!(cb.try_acquire("a").unwrap().is_probe());
    }

    #[tokio::test]
    async fn test_targets_are_isolated() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(1));
        let _ = cb.call("bad:443", || async { failing() }).await;

        assert_eq!(cb.state("bad:443"), CircuitState::Open);
        assert!(cb.call("good:443", || async { Ok(()) }).await.is_ok());
        assert_eq!(cb.snapshots().len(), 2);
    }

    #[test]
    fn test_exactly_one_failure_reports_the_opening() {
        let cb = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new().with_failure_threshold(3),
        ));
        // Admit everything before recording so late failures land on an open circuit.
        let permits: Vec<_> = (0..8).map(|_| cb.try_acquire("t").unwrap()).collect();
        let opened = permits
            .into_iter()
            .map(|p| p.record(false))
            .filter(|opened| *opened)
            .count();
        assert_eq!(opened, 1);
        assert_eq!(cb.state("t"), CircuitState::Open);

        let openers = Arc::new(AtomicU32::new(0));
        let cb = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new().with_failure_threshold(5),
        ));
        let mut handles = vec![];
        for _ in 0..10 {
            let cb = Arc::clone(&cb);
            let openers = Arc::clone(&openers);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    if let Ok(permit) = cb.try_acquire("t") {
                        if permit.record(false) {
                            openers.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(openers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_circuit_breaker_thread_safe() {
        let cb = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::new().with_failure_threshold(100),
        ));

        let mut handles = vec![];
        for _ in 0..10 {
            let cb_clone = Arc::clone(&cb);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    cb_clone.try_acquire("t").unwrap().record(false);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cb.snapshot("t").consecutive_failures, 50);
    }
}
