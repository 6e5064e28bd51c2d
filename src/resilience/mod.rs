//! 弹性模式模块：重试、熔断、并发准入与速率窗口。
//!
//! # Resilience Primitives Module
//!
//! Building blocks the request pipeline composes around the transport. Each
//! one is usable on its own.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`retry`] | Bounded attempt loop with fixed or exponential backoff |
//! | [`circuit_breaker`] | Per-target Closed / Open / HalfOpen state machine |
//! | [`concurrency`] | Global and per-target in-flight caps, FIFO queueing |
//! | [`rate_limiter`] | Sliding-window admission rate (N sends within any interval) |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: requests pass; consecutive failures are counted
//! - **Open**: requests fail fast with `CircuitOpen` until the cooldown elapses
//! - **HalfOpen**: exactly one probe is admitted; its outcome closes or reopens
//!
//! ```rust
//! use fetchline::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_cooldown(Duration::from_secs(30)),
//! );
//! let permit = breaker.try_acquire("api.example.com:443").unwrap();
//! permit.record(true);
//! ```
//!
//! ## Concurrency
//!
//! ```rust
//! use fetchline::resilience::concurrency::{ConcurrencyConfig, ConcurrencyController};
//! use std::time::Duration;
//!
//! let controller = ConcurrencyController::new(
//!     ConcurrencyConfig::new()
//!         .with_max(8)
//!         .with_rate(100, Duration::from_secs(1)),
//! );
//! assert_eq!(controller.max(), Some(8));
//! ```

pub mod circuit_breaker;
pub mod concurrency;
pub mod rate_limiter;
pub mod retry;
