//! 请求流水线模块：按固定顺序组合中间件与弹性阶段。
//!
//! # Request Pipeline
//!
//! Composes user middleware and the built-in resilience stages in front of a
//! transport, and fires lifecycle hooks around the composed chain.
//!
//! ## Stage Order
//!
//! ```text
//! user middleware → dedup → cache → circuit breaker → concurrency → retry → transport
//! ```
//!
//! A cache hit therefore skips breaker, admission and retry work, and a
//! duplicate concurrent call joins the leader before the cache is consulted.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`RequestPipeline`] | Frozen chain; `execute` runs one logical request |
//! | [`PipelineBuilder`] | Selects which stages are present and their policy |
//! | [`stages`] | Circuit breaker, concurrency and retry stages |

pub mod stages;

use crate::cache::CacheLayer;
use crate::dedup::{DedupStage, Deduplicator};
use crate::plugins::{HookContext, HookManager, HookType, Middleware, MiddlewareChain, Next};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::concurrency::ConcurrencyController;
use crate::resilience::retry::RetryPolicy;
use crate::transport::Transport;
use crate::types::{Request, Response};
use crate::{Error, Result};
use stages::{with_request_context, CircuitBreakerStage, ConcurrencyStage, RetryStage};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct PipelineBuilder {
    transport: Arc<dyn Transport>,
    middleware: MiddlewareChain,
    dedup: Option<Arc<DedupStage>>,
    cache: Option<Arc<CacheLayer>>,
    breaker: Option<Arc<CircuitBreaker>>,
    concurrency: Option<Arc<ConcurrencyController>>,
    retry: RetryPolicy,
    timeout: Option<Duration>,
    hooks: Arc<HookManager>,
    throw_http_errors: bool,
}

impl PipelineBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            middleware: MiddlewareChain::new(),
            dedup: None,
            cache: None,
            breaker: None,
            concurrency: None,
            retry: RetryPolicy::disabled(),
            timeout: None,
            hooks: Arc::new(HookManager::new()),
            throw_http_errors: true,
        }
    }

    pub fn middleware(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middleware.push(m);
        self
    }

    pub fn middleware_chain(mut self, chain: MiddlewareChain) -> Self {
        self.middleware.extend(chain);
        self
    }

    pub fn dedup(mut self, stage: DedupStage) -> Self {
        self.dedup = Some(Arc::new(stage));
        self
    }

    pub fn cache(mut self, layer: CacheLayer) -> Self {
        self.cache = Some(Arc::new(layer.with_hooks(self.hooks.clone())));
        self
    }

    pub fn circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn concurrency(mut self, controller: Arc<ConcurrencyController>) -> Self {
        self.concurrency = Some(controller);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Default per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Share a hook manager. Must be set before [`cache`](Self::cache).
    pub fn hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn throw_http_errors(mut self, throw: bool) -> Self {
        self.throw_http_errors = throw;
        self
    }

    pub fn build(self) -> RequestPipeline {
        let mut chain = self.middleware;
        let user_middleware = chain.len();

        if let Some(dedup) = &self.dedup {
            chain.push(dedup.clone());
        }
        if let Some(cache) = &self.cache {
            chain.push(cache.clone());
        }
        if let Some(breaker) = &self.breaker {
            chain.push(Arc::new(CircuitBreakerStage::new(
                breaker.clone(),
                self.hooks.clone(),
            )));
        }
        if let Some(controller) = &self.concurrency {
            chain.push(Arc::new(ConcurrencyStage::new(controller.clone())));
        }
        chain.push(Arc::new(RetryStage::new(
            self.retry,
            self.timeout,
            self.throw_http_errors,
            self.hooks.clone(),
        )));

        let stages = chain.names();
        tracing::debug!(stages = ?stages, user_middleware = user_middleware, "pipeline built");

        RequestPipeline {
            next: chain.into_next(self.transport),
            stages,
            dedup: self.dedup,
            cache: self.cache,
            breaker: self.breaker,
            concurrency: self.concurrency,
            hooks: self.hooks,
            throw_http_errors: self.throw_http_errors,
        }
    }
}

/// A composed chain ready to execute requests. Cheap to share behind an `Arc`.
pub struct RequestPipeline {
    next: Next,
    stages: Vec<String>,
    dedup: Option<Arc<DedupStage>>,
    cache: Option<Arc<CacheLayer>>,
    breaker: Option<Arc<CircuitBreaker>>,
    concurrency: Option<Arc<ConcurrencyController>>,
    hooks: Arc<HookManager>,
    throw_http_errors: bool,
}

impl RequestPipeline {
    pub fn builder(transport: Arc<dyn Transport>) -> PipelineBuilder {
        PipelineBuilder::new(transport)
    }

    /// Run one logical request through the chain.
    ///
    /// `BeforeRequest` hooks may abort the request by returning an error.
    /// With `throw_http_errors` a final non-2xx response becomes
    /// [`Error::Http`].
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let ctx = request.error_context();
        if request.is_cancelled() {
            return Err(Error::cancelled(ctx.with_source("pipeline")));
        }

        let mut hook_ctx = HookContext::for_request(&request);
        self.hooks.trigger(HookType::BeforeRequest, &mut hook_ctx)?;

        let request_id = request.id.clone();
        let start = Instant::now();
        let outcome = match self.next.clone().run(request).await {
            Ok(resp) if self.throw_http_errors && !resp.is_success() => {
                Err(with_request_context(Error::http(resp), &ctx))
            }
            other => other,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(resp) => {
                tracing::debug!(
                    request_id = request_id.as_str(),
                    http_status = resp.status().as_u16(),
                    cache_status = ?resp.cache_status(),
                    duration_ms = elapsed_ms,
                    "request complete"
                );
                self.hooks.emit(
                    HookType::AfterResponse,
                    hook_ctx.with_status(resp.status().as_u16()),
                );
            }
            Err(e) => {
                tracing::debug!(
                    request_id = request_id.as_str(),
                    duration_ms = elapsed_ms,
                    error = %e,
                    "request failed"
                );
                self.hooks.emit(HookType::OnError, hook_ctx.with_error(e.clone()));
            }
        }
        outcome
    }

    /// Stage names in execution order.
    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.hooks
    }

    pub fn deduplicator(&self) -> Option<&Arc<Deduplicator>> {
        self.dedup.as_ref().map(|d| d.deduplicator())
    }

    pub fn cache(&self) -> Option<&Arc<CacheLayer>> {
        self.cache.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn concurrency(&self) -> Option<&Arc<ConcurrencyController>> {
        self.concurrency.as_ref()
    }
}
