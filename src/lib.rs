//! # fetchline
//!
//! 面向 HTTP 客户端的请求执行核心：中间件流水线，叠加去重、缓存、熔断、准入控制与重试。
//!
//! Request-execution core for HTTP clients: a middleware pipeline layered with
//! in-flight deduplication, response caching, per-target circuit breaking,
//! admission control and bounded retries, plus batch and pagination drivers
//! built on top of it.
//!
//! ## Overview
//!
//! Every logical request flows through one fixed chain:
//!
//! ```text
//! user middleware → dedup → cache → circuit breaker → concurrency → retry → transport
//! ```
//!
//! and the response flows back through the same chain, updating cache
//! contents and circuit counters on the way out. The transport is an opaque
//! collaborator; the default one is backed by `reqwest`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fetchline::{CacheConfig, CacheStrategy, Client, RetryPolicy};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> fetchline::Result<()> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com/v1/")
//!         .max_inflight(16)
//!         .retry(RetryPolicy::new().with_max_attempts(3))
//!         .cache(
//!             CacheConfig::new()
//!                 .with_strategy(CacheStrategy::StaleWhileRevalidate)
//!                 .with_ttl(Duration::from_secs(60)),
//!         )
//!         .build()
//!         .await?;
//!
//!     let user: serde_json::Value = client.get_json("users/42").await?;
//!     println!("{}", user);
//!     client.shutdown().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`] facade, [`ClientBuilder`], serde [`ClientConfig`] |
//! | [`pipeline`] | Stage composition and lifecycle hook dispatch |
//! | [`dedup`] | At-most-one in-flight attempt per key |
//! | [`cache`] | Strategies, [`cache::Storage`] trait, memory and file stores |
//! | [`resilience`] | Retry, circuit breaker, admission control |
//! | [`batch`] | Bounded-parallelism batch runner |
//! | [`pagination`] | Lazy page and item streams |
//! | [`plugins`] | Middleware trait and hooks |
//! | [`transport`] | Transport trait and the reqwest-backed implementation |
//! | [`types`] | Request and response values |
//! | [`telemetry`] | Tracing subscriber bootstrap |

pub mod batch;
pub mod cache;
pub mod client;
pub mod dedup;
pub mod pagination;
pub mod pipeline;
pub mod plugins;
pub mod resilience;
pub mod telemetry;
pub mod transport;
pub mod types;
pub mod utils;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, TimeoutPhase};

// Re-export main types for convenience
pub use batch::{BatchOptions, BatchResult, BatchStats};
pub use cache::{CacheConfig, CacheStrategy, FileStore, MemoryStore, Storage};
pub use client::{Client, ClientBuilder, ClientConfig, SignalsSnapshot};
pub use pagination::{Page, PaginationOptions};
pub use pipeline::RequestPipeline;
pub use plugins::{HookContext, HookType, Middleware, Next};
pub use resilience::circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use resilience::concurrency::ConcurrencyConfig;
pub use resilience::retry::{Backoff, RetryPolicy};
pub use transport::{HttpTransport, Transport};
pub use types::{CacheStatus, Request, RequestOptions, Response};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
