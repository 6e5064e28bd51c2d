//! Bounded retry loop with backoff.

use crate::error::TimeoutPhase;
use crate::transport::TransportErrorKind;
use crate::{Error, ErrorContext, Result};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed {
        #[serde(rename = "delay_ms", with = "crate::utils::serde_millis")]
        delay: Duration,
    },
    /// `base × 2^(attempt-1)`, optionally jittered, then capped.
    Exponential {
        #[serde(rename = "delay_ms", with = "crate::utils::serde_millis")]
        base: Duration,
        #[serde(rename = "max_delay_ms", default, with = "crate::utils::serde_millis::option")]
        max: Option<Duration>,
        #[serde(default)]
        jitter: bool,
    },
}

impl Backoff {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base, max, jitter } => {
                let exp = attempt.saturating_sub(1).min(31);
                let factor = 1u32 << exp;
                let mut delay = base.saturating_mul(factor);
                if *jitter && !delay.is_zero() {
                    // Equal jitter: keep half, randomize the other half.
                    let half = delay / 2;
                    let spread = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
                    delay = half + Duration::from_millis(spread);
                }
                match max {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }

    fn cap(&self) -> Option<Duration> {
        match self {
            Backoff::Exponential { max, .. } => *max,
            _ => None,
        }
    }
}

/// Retry configuration for one logical call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub status_codes: Vec<u16>,
    /// Retry connection-level failures (network and dns kinds; tls never).
    pub retry_on_network: bool,
    pub retry_on_timeout: bool,
    /// Prefer a `Retry-After: <seconds>` header over the computed backoff.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Some(Duration::from_secs(10)),
                jitter: true,
            },
            status_codes: default_status_codes(),
            retry_on_network: true,
            retry_on_timeout: true,
            respect_retry_after: true,
        }
    }
}

/// 408, 429 and every 5xx.
pub fn default_status_codes() -> Vec<u16> {
    let mut codes = vec![408, 429];
    codes.extend(500..=599);
    codes
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that makes a single attempt.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.status_codes = codes;
        self
    }

    pub fn is_retriable_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    /// Whether `err` may succeed on another attempt.
    pub fn is_retriable(&self, err: &Error) -> bool {
        match err {
            Error::Transport(e, _) => {
                self.retry_on_network
                    && matches!(e.kind, TransportErrorKind::Network | TransportErrorKind::Dns)
            }
            Error::Timeout { .. } => self.retry_on_timeout,
            Error::Http { status, .. } => self.is_retriable_status(*status),
            Error::DedupJoin { source, .. } => self.is_retriable(source),
            _ => false,
        }
    }

    fn delay_for(&self, attempt: u32, err: &Error) -> Duration {
        let computed = self.backoff.delay(attempt);
        if !self.respect_retry_after {
            return computed;
        }
        let retry_after = err
            .response()
            .and_then(|r| r.header_first(&["retry-after"]))
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        match (retry_after, self.backoff.cap()) {
            (Some(ra), Some(cap)) => ra.min(cap),
            (Some(ra), None) => ra,
            (None, _) => computed,
        }
    }
}

/// Observability event emitted before each retry.
#[derive(Debug, Clone)]
pub struct RetryEvent {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub error: Error,
    pub delay: Duration,
}

pub type RetryListener = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Runs one logical call in a bounded attempt loop.
pub struct RetryExecutor {
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
    listener: Option<RetryListener>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt_timeout: None,
            listener: None,
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_listener(mut self, listener: RetryListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drive `op` until it succeeds, fails non-retriably or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number. Cancellation stops scheduling
    /// further attempts and drops the in-flight attempt.
    pub async fn execute<T, F, Fut>(&self, cancel: Option<&CancellationToken>, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let outcome = self.run_attempt(cancel, op(attempt), attempt, start).await;
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let stamp = |e: Error| {
                e.map_context(|c| {
                    c.attempts = Some(attempt);
                    c.elapsed = Some(start.elapsed());
                })
            };

            if err.is_cancelled() || attempt >= max_attempts || !self.policy.is_retriable(&err) {
                return Err(stamp(err));
            }

            let delay = self.policy.delay_for(attempt, &err);
            tracing::warn!(
                attempt = attempt,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying request"
            );
            if let Some(listener) = &self.listener {
                listener(&RetryEvent {
                    attempt,
                    error: err.clone(),
                    delay,
                });
            }

            if !delay.is_zero() {
                match cancel {
                    Some(token) => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => {
                                return Err(cancelled(attempt, start));
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
            attempt += 1;
        }
    }

    async fn run_attempt<T, Fut>(
        &self,
        cancel: Option<&CancellationToken>,
        fut: Fut,
        attempt: u32,
        start: Instant,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let attempt_start = Instant::now();
        let timed = async {
            match self.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::timeout(TimeoutPhase::Overall, attempt_start.elapsed())
                        .map_context(|c| c.source = Some("retry".into()))),
                },
                None => fut.await,
            }
        };
        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(cancelled(attempt, start)),
                    res = timed => res,
                }
            }
            None => timed.await,
        }
    }
}

fn cancelled(attempt: u32, start: Instant) -> Error {
    Error::cancelled(
        ErrorContext::new()
            .with_attempts(attempt)
            .with_elapsed(start.elapsed())
            .with_source("retry"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn network_error() -> Error {
        TransportError::new(TransportErrorKind::Network, "connection refused").into()
    }

    #[test]
    fn test_exponential_backoff() {
        let b = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Some(Duration::from_millis(500)),
            jitter: false,
        };
        assert_eq!(b.delay(1), Duration::from_millis(100));
        assert_eq!(b.delay(2), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(400));
        assert_eq!(b.delay(4), Duration::from_millis(500));
        assert_eq!(b.delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let b = Backoff::Exponential {
            base: Duration::from_millis(200),
            max: None,
            jitter: true,
        };
        for _ in 0..100 {
            let d = b.delay(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_only_connection_level_transport_kinds_retry() {
        let policy = RetryPolicy::new();
        let kind = |k| Error::from(TransportError::new(k, "boom"));
        assert!(policy.is_retriable(&kind(TransportErrorKind::Network)));
        assert!(policy.is_retriable(&kind(TransportErrorKind::Dns)));
        assert!(!policy.is_retriable(&kind(TransportErrorKind::Tls)));
        assert!(!policy.is_retriable(&kind(TransportErrorKind::Protocol)));
        assert!(!policy.is_retriable(&kind(TransportErrorKind::Other)));

        let mut off = RetryPolicy::new();
        off.retry_on_network = false;
        assert!(!off.is_retriable(&kind(TransportErrorKind::Network)));
    }

    #[test]
    fn test_default_status_codes() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retriable_status(408));
        assert!(policy.is_retriable_status(429));
        assert!(policy.is_retriable_status(503));
        assert!(!policy.is_retriable_status(404));
        assert!(!policy.is_retriable_status(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_then_success() {
        let calls = AtomicU32::new(0);
        let exec = RetryExecutor::new(RetryPolicy::new().with_max_attempts(3));

        let out = exec
            .execute(None, |_| async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(network_error())
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_last_error_with_attempts() {
        let exec = RetryExecutor::new(
            RetryPolicy::new()
                .with_max_attempts(2)
                .with_backoff(Backoff::Fixed {
                    delay: Duration::from_millis(10),
                }),
        );
        let err = exec
            .execute::<(), _, _>(None, |_| async { Err(network_error()) })
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(err.attempts(), Some(2));
    }

    #[tokio::test]
    async fn test_non_retriable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let exec = RetryExecutor::new(RetryPolicy::new().with_max_attempts(5));
        let err = exec
            .execute::<(), _, _>(None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation_with_context("bad", ErrorContext::new()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_event_carries_attempt_and_delay() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let exec = RetryExecutor::new(RetryPolicy::new().with_max_attempts(3).with_backoff(
            Backoff::Exponential {
                base: Duration::from_millis(50),
                max: None,
                jitter: false,
            },
        ))
        .with_listener(Arc::new(move |e: &RetryEvent| {
            sink.lock().unwrap().push((e.attempt, e.delay));
        }));

        let _ = exec
            .execute::<(), _, _>(None, |_| async { Err(network_error()) })
            .await;
        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![(1, Duration::from_millis(50)), (2, Duration::from_millis(100))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let calls = AtomicU32::new(0);
        let exec = RetryExecutor::new(RetryPolicy::new().with_max_attempts(2).with_backoff(Backoff::None))
            .with_attempt_timeout(Some(Duration::from_millis(20)));

        let err = exec
            .execute::<(), _, _>(None, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                phase: TimeoutPhase::Overall,
                ..
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_further_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();
        let exec = RetryExecutor::new(RetryPolicy::new().with_max_attempts(10).with_backoff(
            Backoff::Fixed {
                delay: Duration::from_millis(100),
            },
        ));

        let t = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            t.cancel();
        });

        let c = calls.clone();
        let err = exec
            .execute::<(), _, _>(Some(&token), move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(network_error())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: RetryPolicy = serde_yaml::from_str(
            "max_attempts: 4\nbackoff:\n  kind: exponential\n  delay_ms: 250\n  max_delay_ms: 2000\n",
        )
        .unwrap();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                base: Duration::from_millis(250),
                max: Some(Duration::from_millis(2000)),
                jitter: false,
            }
        );
        assert!(policy.is_retriable_status(502));
    }
}
