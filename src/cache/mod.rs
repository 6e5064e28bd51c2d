//! 响应缓存模块：可插拔存储后端与四种读取策略。
//!
//! # Response Caching Module
//!
//! The cache stage sits right after deduplication in the pipeline, so a hit
//! never pays for circuit-breaker, admission or retry work.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheLayer`] | Pipeline stage applying a [`CacheStrategy`] per request |
//! | [`CacheConfig`] | Strategy, TTL, cacheable methods, key function |
//! | [`Storage`] | Trait for cache backends (`get` / `set` / `delete` / `clear` / `shutdown`) |
//! | [`MemoryStore`] | Bounded LRU with expiry and optional zlib compression |
//! | [`FileStore`] | One JSON record per key with a background expiry sweep |
//! | [`CacheStats`] | Hit / miss / stale counters and hit ratio |
//!
//! ## Strategies
//!
//! - `network-only`: bypass the cache entirely
//! - `cache-first`: serve a fresh entry; otherwise behave like `network-first`
//! - `stale-while-revalidate`: serve any stored entry and refresh it in the background
//! - `network-first`: fetch; on failure fall back to any stored entry
//!
//! Only successful (2xx) responses to cacheable methods are stored.

mod file;
mod layer;
mod memory;
mod storage;

pub use file::FileStore;
pub use layer::{CacheLayer, CacheStats};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use storage::{CacheEntry, Storage};

use crate::types::Request;
use crate::utils::method_url_key;
use reqwest::Method;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    #[default]
    NetworkOnly,
    CacheFirst,
    StaleWhileRevalidate,
    NetworkFirst,
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheStrategy::NetworkOnly => "network-only",
            CacheStrategy::CacheFirst => "cache-first",
            CacheStrategy::StaleWhileRevalidate => "stale-while-revalidate",
            CacheStrategy::NetworkFirst => "network-first",
        };
        f.write_str(s)
    }
}

/// Derives a storage or dedup key from a request.
pub type KeyFn = Arc<dyn Fn(&Request) -> String + Send + Sync>;

#[derive(Clone)]
pub struct CacheConfig {
    pub strategy: CacheStrategy,
    pub ttl: Duration,
    /// Extra time a record is kept after its TTL, for network-first fallback
    /// and stale-while-revalidate. Zero keeps nothing past TTL.
    pub stale_retention: Duration,
    pub methods: Vec<Method>,
    pub key: KeyFn,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::NetworkOnly,
            ttl: Duration::from_secs(300),
            stale_retention: Duration::ZERO,
            methods: vec![Method::GET],
            key: Arc::new(method_url_key),
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("strategy", &self.strategy)
            .field("ttl", &self.ttl)
            .field("stale_retention", &self.stale_retention)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stale_retention(mut self, retention: Duration) -> Self {
        self.stale_retention = retention;
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(f);
        self
    }

    pub fn is_cacheable(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        let s: CacheStrategy = serde_yaml::from_str("stale-while-revalidate").unwrap();
        assert_eq!(s, CacheStrategy::StaleWhileRevalidate);
        assert_eq!(CacheStrategy::CacheFirst.to_string(), "cache-first");
    }

    #[test]
    fn test_default_key_and_methods() {
        let cfg = CacheConfig::new();
        assert!(cfg.is_cacheable(&Method::GET));
        assert!(!cfg.is_cacheable(&Method::POST));
        let req = Request::get("https://example.com/a?b=1&a=2").unwrap();
        assert_eq!((cfg.key)(&req), "GET https://example.com/a?a=2&b=1");
    }
}
