//! Admission control: global in-flight cap, interval admission rate and
//! optional per-target pools.

use super::rate_limiter::{IntervalLimiter, IntervalLimiterConfig, IntervalLimiterSnapshot};
use crate::{Error, ErrorContext, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Global in-flight cap. `None` admits immediately.
    pub max: Option<usize>,
    /// Sends admitted per `interval`. Gates sending, not slot occupancy.
    pub requests_per_interval: Option<u32>,
    #[serde(rename = "interval_ms", with = "crate::utils::serde_millis")]
    pub interval: Duration,
    /// Give each target its own slot pool and interval window.
    pub per_target_pooling: bool,
    /// Slot cap per target when pooling; defaults to `max`.
    pub per_target_max: Option<usize>,
    /// Fail with `AdmissionRejected` instead of queueing.
    pub reject_when_full: bool,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max: None,
            requests_per_interval: None,
            interval: Duration::from_secs(1),
            per_target_pooling: false,
            per_target_max: None,
            reject_when_full: false,
        }
    }
}

impl ConcurrencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = Some(max.max(1));
        self
    }

    pub fn with_rate(mut self, requests_per_interval: u32, interval: Duration) -> Self {
        self.requests_per_interval = Some(requests_per_interval);
        self.interval = interval;
        self
    }

    pub fn with_per_target_pooling(mut self, per_target_max: Option<usize>) -> Self {
        self.per_target_pooling = true;
        self.per_target_max = per_target_max.map(|n| n.max(1));
        self
    }

    pub fn with_reject_when_full(mut self, reject: bool) -> Self {
        self.reject_when_full = reject;
        self
    }

    fn window(&self) -> Option<IntervalLimiterConfig> {
        self.requests_per_interval
            .and_then(|n| IntervalLimiterConfig::new(n, self.interval).validated())
    }
}

#[derive(Debug, Clone)]
pub struct InflightSnapshot {
    pub max: usize,
    pub available: usize,
    pub in_use: usize,
}

#[derive(Debug, Clone)]
pub struct ConcurrencySnapshot {
    pub global: Option<InflightSnapshot>,
    pub window: Option<IntervalLimiterSnapshot>,
    pub targets: Vec<(String, InflightSnapshot)>,
}

struct Pool {
    slots: Option<Arc<Semaphore>>,
    max: Option<usize>,
    window: Option<IntervalLimiter>,
}

impl Pool {
    fn new(max: Option<usize>, window: Option<IntervalLimiterConfig>) -> Self {
        Self {
            slots: max.map(|n| Arc::new(Semaphore::new(n))),
            max,
            window: window.map(IntervalLimiter::new),
        }
    }

    fn inflight(&self) -> Option<InflightSnapshot> {
        let sem = self.slots.as_ref()?;
        let max = self.max?;
        let available = sem.available_permits();
        Some(InflightSnapshot {
            max,
            available,
            in_use: max.saturating_sub(available),
        })
    }
}

/// Admission granted by the controller; the slot is released on drop.
#[derive(Debug)]
pub struct Permit {
    _target: Option<OwnedSemaphorePermit>,
    _global: Option<OwnedSemaphorePermit>,
}

/// Global / per-interval / per-target admission gate.
///
/// Slot waiters are served in strict arrival order (tokio's semaphore is
/// FIFO). A request takes its target slot, then its global slot, then waits
/// for the interval window while holding both.
pub struct ConcurrencyController {
    cfg: ConcurrencyConfig,
    global: Pool,
    targets: Mutex<HashMap<String, Arc<Pool>>>,
}

impl ConcurrencyController {
    pub fn new(cfg: ConcurrencyConfig) -> Self {
        // With pooling the interval rate applies per target.
        let global_window = if cfg.per_target_pooling {
            None
        } else {
            cfg.window()
        };
        let global = Pool::new(cfg.max, global_window);
        Self {
            cfg,
            global,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Unbounded controller: admits everything immediately.
    pub fn unbounded() -> Self {
        Self::new(ConcurrencyConfig::default())
    }

    pub fn config(&self) -> &ConcurrencyConfig {
        &self.cfg
    }

    /// Global cap, if any.
    pub fn max(&self) -> Option<usize> {
        self.cfg.max
    }

    fn target_pool(&self, target: Option<&str>) -> Result<Option<Arc<Pool>>> {
        if !self.cfg.per_target_pooling {
            return Ok(None);
        }
        let Some(target) = target else {
            return Ok(None);
        };
        let mut targets = self.targets.lock().map_err(|_| {
            Error::configuration_with_context(
                "ConcurrencyController poisoned",
                ErrorContext::new().with_source("concurrency"),
            )
        })?;
        let pool = targets
            .entry(target.to_string())
            .or_insert_with(|| {
                let max = self.cfg.per_target_max.or(self.cfg.max);
                Arc::new(Pool::new(max, self.cfg.window()))
            })
            .clone();
        Ok(Some(pool))
    }

    /// Suspend until a slot is free (or fail fast in reject mode).
    ///
    /// Fails only when `cancel` fires while queued, or when the controller is
    /// configured to reject instead of queueing.
    pub async fn acquire(
        &self,
        target: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Permit> {
        if self.cfg.reject_when_full {
            return self.try_acquire(target);
        }
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::cancelled(
                        ErrorContext::new()
                            .with_target(target.unwrap_or_default())
                            .with_source("concurrency"),
                    )),
                    permit = self.acquire_inner(target) => permit,
                }
            }
            None => self.acquire_inner(target).await,
        }
    }

    async fn acquire_inner(&self, target: Option<&str>) -> Result<Permit> {
        let pool = self.target_pool(target)?;

        let target_permit = match pool.as_ref().and_then(|p| p.slots.clone()) {
            Some(sem) => Some(sem.acquire_owned().await.map_err(|_| closed_error())?),
            None => None,
        };
        let global_permit = match self.global.slots.clone() {
            Some(sem) => Some(sem.acquire_owned().await.map_err(|_| closed_error())?),
            None => None,
        };

        if let Some(window) = pool.as_ref().and_then(|p| p.window.as_ref()) {
            window.acquire().await;
        }
        if let Some(window) = self.global.window.as_ref() {
            window.acquire().await;
        }

        tracing::trace!(target = target.unwrap_or(""), "admission granted");
        Ok(Permit {
            _target: target_permit,
            _global: global_permit,
        })
    }

    /// Non-blocking admission.
    pub fn try_acquire(&self, target: Option<&str>) -> Result<Permit> {
        let rejected = || Error::AdmissionRejected {
            target: target.unwrap_or_default().to_string(),
            context: ErrorContext::new()
                .with_target(target.unwrap_or_default())
                .with_source("concurrency"),
        };
        let pool = self.target_pool(target)?;

        let target_permit = match pool.as_ref().and_then(|p| p.slots.clone()) {
            Some(sem) => Some(sem.try_acquire_owned().map_err(|_| rejected())?),
            None => None,
        };
        let global_permit = match self.global.slots.clone() {
            Some(sem) => Some(sem.try_acquire_owned().map_err(|_| rejected())?),
            None => None,
        };
        if let Some(window) = pool.as_ref().and_then(|p| p.window.as_ref()) {
            if !window.try_acquire() {
                return Err(rejected());
            }
        }
        if let Some(window) = self.global.window.as_ref() {
            if !window.try_acquire() {
                return Err(rejected());
            }
        }
        Ok(Permit {
            _target: target_permit,
            _global: global_permit,
        })
    }

    /// Return a slot. Equivalent to dropping the permit.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    pub async fn snapshot(&self) -> ConcurrencySnapshot {
        let window = match self.global.window.as_ref() {
            Some(w) => Some(w.snapshot().await),
            None => None,
        };
        let mut targets: Vec<(String, InflightSnapshot)> = self
            .targets
            .lock()
            .map(|t| {
                t.iter()
                    .filter_map(|(k, pool)| pool.inflight().map(|s| (k.clone(), s)))
                    .collect()
            })
            .unwrap_or_default();
        targets.sort_by(|a, b| a.0.cmp(&b.0));
        ConcurrencySnapshot {
            global: self.global.inflight(),
            window,
            targets,
        }
    }
}

fn closed_error() -> Error {
    Error::configuration_with_context(
        "Backpressure semaphore closed",
        ErrorContext::new().with_source("concurrency"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    async fn run_tasks(ctl: Arc<ConcurrencyController>, targets: Vec<&'static str>) -> Duration {
        let start = Instant::now();
        let mut handles = Vec::new();
        for t in targets {
            let ctl = ctl.clone();
            handles.push(tokio::spawn(async move {
                let _permit = ctl.acquire(Some(t), None).await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        start.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_two_runs_in_two_waves() {
        let ctl = Arc::new(ConcurrencyController::new(ConcurrencyConfig::new().with_max(2)));
        let elapsed = run_tasks(ctl, vec!["a"; 4]).await;
        assert!(elapsed >= Duration::from_millis(100), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(150), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_grants_immediately() {
        let ctl = Arc::new(ConcurrencyController::unbounded());
        let elapsed = run_tasks(ctl, vec!["a"; 4]).await;
        assert!(elapsed < Duration::from_millis(100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_target_pools_are_isolated() {
        let cfg = ConcurrencyConfig::new()
            .with_max(4)
            .with_per_target_pooling(Some(1));
        let ctl = Arc::new(ConcurrencyController::new(cfg));

        // Two hosts, two requests each, one slot per host: two waves.
        let elapsed = run_tasks(ctl.clone(), vec!["a", "a", "b", "b"]).await;
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(150));

        let snapshot = ctl.snapshot().await;
        assert_eq!(snapshot.targets.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_held_while_waiting_for_window() {
        let cfg = ConcurrencyConfig::new()
            .with_max(5)
            .with_rate(1, Duration::from_millis(100));
        let ctl = Arc::new(ConcurrencyController::new(cfg));

        let first = ctl.acquire(None, None).await.unwrap();
        let ctl2 = ctl.clone();
        let waiter = tokio::spawn(async move { ctl2.acquire(None, None).await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The second request occupies a slot although the window has not opened.
        let snapshot = ctl.snapshot().await;
        assert_eq!(snapshot.global.unwrap().in_use, 2);
        assert!(!waiter.is_finished());

        tokio::time::sleep(Duration::from_millis(100)).await;
        waiter.await.unwrap().unwrap();
        drop(first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued_dequeues() {
        let ctl = Arc::new(ConcurrencyController::new(ConcurrencyConfig::new().with_max(1)));
        let held = ctl.acquire(None, None).await.unwrap();

        let token = CancellationToken::new();
        let ctl2 = ctl.clone();
        let t2 = token.clone();
        let waiter = tokio::spawn(async move { ctl2.acquire(None, Some(&t2)).await });
        tokio::task::yield_now().await;
        token.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The cancelled waiter must not hold the slot once it is released.
        ctl.release(held);
        let again = ctl.try_acquire(None);
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_reject_mode() {
        let cfg = ConcurrencyConfig::new().with_max(1).with_reject_when_full(true);
        let ctl = ConcurrencyController::new(cfg);

        let _held = ctl.acquire(Some("a"), None).await.unwrap();
        let err = ctl.acquire(Some("a"), None).await.unwrap_err();
        assert!(matches!(err, Error::AdmissionRejected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_grant_order() {
        let ctl = Arc::new(ConcurrencyController::new(ConcurrencyConfig::new().with_max(1)));
        let held = ctl.acquire(None, None).await.unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let ctl = ctl.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _p = ctl.acquire(None, None).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            tokio::task::yield_now().await;
        }
        drop(held);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_config_from_yaml() {
        let cfg: ConcurrencyConfig = serde_yaml::from_str(
            "max: 8\nrequests_per_interval: 10\ninterval_ms: 500\nper_target_pooling: true\n",
        )
        .unwrap();
        assert_eq!(cfg.max, Some(8));
        assert_eq!(cfg.interval, Duration::from_millis(500));
        assert!(cfg.per_target_pooling);
    }
}
