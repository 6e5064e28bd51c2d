use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct IntervalLimiterSnapshot {
    pub requests_per_interval: u32,
    pub interval_ms: u64,
    /// Admissions recorded inside the current window.
    pub in_window: usize,
    /// Estimated wait until the next admission is possible (ms), if the window is full.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct IntervalLimiterConfig {
    pub requests_per_interval: u32,
    pub interval: Duration,
}

impl IntervalLimiterConfig {
    pub fn new(requests_per_interval: u32, interval: Duration) -> Self {
        Self {
            requests_per_interval,
            interval,
        }
    }

    /// `None` when the limit can never admit anything or the interval is empty.
    pub fn validated(self) -> Option<Self> {
        if self.requests_per_interval == 0 || self.interval.is_zero() {
            return None;
        }
        Some(self)
    }
}

#[derive(Debug)]
struct State {
    /// Start times of admissions inside the sliding window, oldest first.
    admitted: VecDeque<Instant>,
}

impl State {
    fn prune(&mut self, now: Instant, interval: Duration) {
        while let Some(front) = self.admitted.front() {
            if now.duration_since(*front) >= interval {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Sliding-window admission rate: at most N sends within any interval.
///
/// - Waiters are served in arrival order (the tokio gate mutex is FIFO and the
///   head waiter keeps it while it sleeps for the window to open)
/// - The admission log sits behind a std mutex that is never held across an
///   await, so snapshots never queue behind waiters
/// - Dropping a waiting future leaves the queue
pub struct IntervalLimiter {
    cfg: IntervalLimiterConfig,
    gate: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

impl IntervalLimiter {
    pub fn new(cfg: IntervalLimiterConfig) -> Self {
        let cap = cfg.requests_per_interval as usize;
        Self {
            cfg,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(State {
                admitted: VecDeque::with_capacity(cap),
            }),
        }
    }

    pub fn config(&self) -> &IntervalLimiterConfig {
        &self.cfg
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an admission if the window has room, else the instant it reopens.
    fn admit(&self, now: Instant) -> std::result::Result<(), Instant> {
        let mut st = self.state();
        st.prune(now, self.cfg.interval);
        if st.admitted.len() < self.cfg.requests_per_interval as usize {
            st.admitted.push_back(now);
            return Ok(());
        }
        Err(st
            .admitted
            .front()
            .map_or(now, |oldest| *oldest + self.cfg.interval))
    }

    /// Wait for the window to admit one send.
    pub async fn acquire(&self) {
        let _turn = self.gate.lock().await;
        loop {
            match self.admit(Instant::now()) {
                Ok(()) => return,
                // Window full: sleep until the oldest admission ages out.
                Err(wake_at) => tokio::time::sleep_until(wake_at).await,
            }
        }
    }

    /// Admit without waiting; `false` when the window is full or another caller is queued.
    pub fn try_acquire(&self) -> bool {
        let Ok(_turn) = self.gate.try_lock() else {
            return false;
        };
        self.admit(Instant::now()).is_ok()
    }

    pub async fn snapshot(&self) -> IntervalLimiterSnapshot {
        let mut st = self.state();
        let now = Instant::now();
        st.prune(now, self.cfg.interval);
        let estimated_wait_ms = if st.admitted.len() >= self.cfg.requests_per_interval as usize {
            st.admitted
                .front()
                .map(|oldest| (*oldest + self.cfg.interval).saturating_duration_since(now))
                .map(|d| d.as_millis() as u64)
        } else {
            None
        };
        IntervalLimiterSnapshot {
            requests_per_interval: self.cfg.requests_per_interval,
            interval_ms: self.cfg.interval.as_millis() as u64,
            in_window: st.admitted.len(),
            estimated_wait_ms,
        }
    }
}
