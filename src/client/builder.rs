use super::config::{parse_methods, ClientConfig, StorageSetting};
use super::core::{Client, ClientInner};
use crate::cache::{CacheConfig, CacheLayer, FileStore, MemoryStore, Storage};
use crate::dedup::{DedupConfig, DedupStage};
use crate::plugins::{HookManager, Middleware, MiddlewareChain};
use crate::pipeline::RequestPipeline;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::resilience::concurrency::{ConcurrencyConfig, ConcurrencyController};
use crate::resilience::retry::RetryPolicy;
use crate::transport::{HttpTransport, Transport};
use crate::{Error, ErrorContext, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Builder for [`Client`].
///
/// Every stage is opt-in except deduplication, which is on for GET and HEAD
/// unless disabled.
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    base_url: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    throw_http_errors: bool,
    concurrency: Option<ConcurrencyConfig>,
    cache: Option<CacheConfig>,
    storage: Option<Arc<dyn Storage>>,
    storage_setting: Option<StorageSetting>,
    dedup: Option<DedupConfig>,
    retry: Option<RetryPolicy>,
    breaker: Option<CircuitBreakerConfig>,
    middleware: MiddlewareChain,
    hooks: Arc<HookManager>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            base_url: None,
            headers: Vec::new(),
            timeout: None,
            throw_http_errors: true,
            concurrency: None,
            cache: None,
            storage: None,
            storage_setting: None,
            dedup: Some(DedupConfig::default()),
            retry: None,
            breaker: None,
            middleware: MiddlewareChain::new(),
            hooks: Arc::new(HookManager::new()),
        }
    }

    /// Start from a loaded [`ClientConfig`]. Non-serializable pieces
    /// (transport, key functions, middleware, hooks) can still be set after.
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::new().throw_http_errors(config.throw_http_errors);
        builder.base_url = config.base_url;
        builder.timeout = config.timeout;
        builder.headers = config.headers.into_iter().collect();
        builder.concurrency = config.concurrency.map(|c| c.into_config());
        builder.retry = config.retry;
        builder.breaker = config.circuit_breaker;

        builder.dedup = if config.dedup.enabled {
            Some(DedupConfig::new().with_methods(parse_methods(&config.dedup.methods)?))
        } else {
            None
        };

        if let Some(cache) = config.cache {
            builder.cache = Some(
                CacheConfig::new()
                    .with_strategy(cache.strategy)
                    .with_ttl(cache.ttl)
                    .with_stale_retention(cache.stale_retention)
                    .with_methods(parse_methods(&cache.methods)?),
            );
            builder.storage_setting = Some(cache.storage);
        }
        Ok(builder)
    }

    /// Defaults overridden by `FETCHLINE_*` environment variables.
    ///
    /// - `FETCHLINE_MAX_INFLIGHT`
    /// - `FETCHLINE_BREAKER_FAILURE_THRESHOLD` / `FETCHLINE_BREAKER_COOLDOWN_SECS`
    /// - `FETCHLINE_RETRY_MAX_ATTEMPTS`
    /// - `FETCHLINE_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self::new().apply_env()
    }

    /// Layer `FETCHLINE_*` overrides on top of what is already set.
    pub fn apply_env(mut self) -> Self {
        if let Some(n) = env_parse::<usize>("FETCHLINE_MAX_INFLIGHT") {
            let cfg = self.concurrency.take().unwrap_or_default();
            self.concurrency = Some(cfg.with_max(n));
        }

        let threshold = env_parse::<u32>("FETCHLINE_BREAKER_FAILURE_THRESHOLD");
        let cooldown = env_parse::<u64>("FETCHLINE_BREAKER_COOLDOWN_SECS");
        if threshold.is_some() || cooldown.is_some() {
            let mut cfg = self.breaker.take().unwrap_or_default();
            if let Some(t) = threshold {
                cfg = cfg.with_failure_threshold(t);
            }
            if let Some(secs) = cooldown {
                cfg = cfg.with_cooldown(Duration::from_secs(secs.max(1)));
            }
            self.breaker = Some(cfg);
        }

        if let Some(n) = env_parse::<u32>("FETCHLINE_RETRY_MAX_ATTEMPTS") {
            let policy = self.retry.take().unwrap_or_default();
            self.retry = Some(policy.with_max_attempts(n));
        }

        if let Some(ms) = env_parse::<u64>("FETCHLINE_TIMEOUT_MS").filter(|ms| *ms > 0) {
            self.timeout = Some(Duration::from_millis(ms));
        }
        self
    }

    /// Replace the default reqwest transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Resolve relative request URLs against `url`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Header sent with every request unless the request sets it itself.
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Default per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn throw_http_errors(mut self, throw: bool) -> Self {
        self.throw_http_errors = throw;
        self
    }

    pub fn concurrency(mut self, cfg: ConcurrencyConfig) -> Self {
        self.concurrency = Some(cfg);
        self
    }

    /// Shorthand for a global in-flight cap.
    pub fn max_inflight(self, n: usize) -> Self {
        self.concurrency(ConcurrencyConfig::new().with_max(n))
    }

    /// Enable caching. Uses an in-memory store unless [`storage`](Self::storage) is set.
    pub fn cache(mut self, cfg: CacheConfig) -> Self {
        self.cache = Some(cfg);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn dedup(mut self, cfg: DedupConfig) -> Self {
        self.dedup = Some(cfg);
        self
    }

    pub fn no_dedup(mut self) -> Self {
        self.dedup = None;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.breaker = Some(cfg);
        self
    }

    /// Append user middleware. Runs outermost, in insertion order.
    pub fn middleware(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middleware.push(m);
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = hooks;
        self
    }

    async fn resolve_storage(&mut self) -> Result<Arc<dyn Storage>> {
        if let Some(storage) = self.storage.take() {
            return Ok(storage);
        }
        Ok(match self.storage_setting.take().unwrap_or_default() {
            StorageSetting::Memory(cfg) => Arc::new(MemoryStore::new(cfg)),
            StorageSetting::File {
                dir,
                sweep_interval,
            } => Arc::new(FileStore::open(dir, sweep_interval).await?),
        })
    }

    fn default_headers(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid header name {:?}: {}", name, e),
                    ErrorContext::new().with_source("client_builder"),
                )
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid value for header {}: {}", name, e),
                    ErrorContext::new().with_source("client_builder"),
                )
            })?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Build the client. Opens the file store when one is configured.
    pub async fn build(mut self) -> Result<Client> {
        let base_url = match self.base_url.as_deref() {
            Some(raw) => Some(Url::parse(raw).map_err(|e| {
                Error::configuration_with_context(
                    format!("invalid base_url: {}", e),
                    ErrorContext::new()
                        .with_url(raw)
                        .with_source("client_builder"),
                )
            })?),
            None => None,
        };
        let headers = self.default_headers()?;

        let transport: Arc<dyn Transport> = match self.transport.take() {
            Some(t) => t,
            None => Arc::new(HttpTransport::new()?),
        };

        let mut pipeline = RequestPipeline::builder(transport)
            .hooks(self.hooks.clone())
            .middleware_chain(std::mem::take(&mut self.middleware))
            .throw_http_errors(self.throw_http_errors);

        if let Some(cfg) = self.dedup.take() {
            pipeline = pipeline.dedup(DedupStage::new(cfg));
        }
        let mut storage = None;
        if let Some(cfg) = self.cache.take() {
            let store = self.resolve_storage().await?;
            storage = Some(store.clone());
            pipeline = pipeline.cache(CacheLayer::new(store, cfg));
        }
        if let Some(cfg) = self.breaker.take() {
            pipeline = pipeline.circuit_breaker(Arc::new(CircuitBreaker::new(cfg)));
        }
        if let Some(cfg) = self.concurrency.take() {
            pipeline = pipeline.concurrency(Arc::new(ConcurrencyController::new(cfg)));
        }
        if let Some(policy) = self.retry.take() {
            pipeline = pipeline.retry(policy);
        }
        if let Some(timeout) = self.timeout {
            pipeline = pipeline.timeout(timeout);
        }

        let pipeline = pipeline.build();
        tracing::debug!(
            base_url = base_url.as_ref().map(Url::as_str),
            stages = ?pipeline.stages(),
            "client built"
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                pipeline,
                base_url,
                headers,
                storage,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
