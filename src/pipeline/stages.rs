//! Built-in stages placed after user middleware, in fixed order:
//! dedup → cache → circuit breaker → concurrency → retry → transport.

use crate::plugins::{HookContext, HookManager, HookType, Middleware, Next};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::concurrency::ConcurrencyController;
use crate::resilience::retry::{RetryEvent, RetryExecutor, RetryPolicy};
use crate::types::{Request, Response};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Fill context fields the raising component did not know about.
pub(crate) fn with_request_context(err: Error, ctx: &ErrorContext) -> Error {
    err.map_context(|c| {
        if c.target.is_none() {
            c.target = ctx.target.clone();
        }
        if c.method.is_none() {
            c.method = ctx.method.clone();
        }
        if c.url.is_none() {
            c.url = ctx.url.clone();
        }
    })
}

/// `Some(true)` success, `Some(false)` failure, `None` says nothing about the target's health.
fn circuit_verdict(outcome: &Result<Response>) -> Option<bool> {
    let unhealthy = |status: u16| status >= 500 || status == 429;
    match outcome {
        Ok(resp) => Some(!unhealthy(resp.status().as_u16())),
        Err(e) => {
            let inner = match e {
                Error::DedupJoin { source, .. } => source.as_ref(),
                other => other,
            };
            match inner {
                Error::Cancelled { .. } | Error::AdmissionRejected { .. } | Error::CircuitOpen { .. } => None,
                Error::Http { status, .. } => Some(!unhealthy(*status)),
                _ => Some(false),
            }
        }
    }
}

pub struct CircuitBreakerStage {
    breaker: Arc<CircuitBreaker>,
    hooks: Arc<HookManager>,
}

impl CircuitBreakerStage {
    pub fn new(breaker: Arc<CircuitBreaker>, hooks: Arc<HookManager>) -> Self {
        Self { breaker, hooks }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerStage {
    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        let target = request.target_key();
        let ctx = request.error_context();
        let hook_ctx = HookContext::for_request(&request);

        let permit = self
            .breaker
            .try_acquire(&target)
            .map_err(|e| with_request_context(e, &ctx))?;
        let outcome = next.run(request).await;

        match circuit_verdict(&outcome) {
            Some(success) => {
                if permit.record(success) {
                    let hook_ctx = match &outcome {
                        Err(e) => hook_ctx.with_error(e.clone()),
                        Ok(resp) => hook_ctx.with_status(resp.status().as_u16()),
                    };
                    self.hooks.emit(HookType::OnCircuitOpen, hook_ctx);
                }
            }
            None => drop(permit),
        }
        outcome
    }

    fn name(&self) -> &str {
        "circuit_breaker"
    }
}

pub struct ConcurrencyStage {
    controller: Arc<ConcurrencyController>,
}

impl ConcurrencyStage {
    pub fn new(controller: Arc<ConcurrencyController>) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl Middleware for ConcurrencyStage {
    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        let target = request.target_key();
        let _permit = self
            .controller
            .acquire(Some(&target), request.options.cancel.as_ref())
            .await
            .map_err(|e| with_request_context(e, &request.error_context()))?;
        next.run(request).await
    }

    fn name(&self) -> &str {
        "concurrency"
    }
}

pub struct RetryStage {
    policy: RetryPolicy,
    timeout: Option<Duration>,
    throw_http_errors: bool,
    hooks: Arc<HookManager>,
}

impl RetryStage {
    pub fn new(
        policy: RetryPolicy,
        timeout: Option<Duration>,
        throw_http_errors: bool,
        hooks: Arc<HookManager>,
    ) -> Self {
        Self {
            policy,
            timeout,
            throw_http_errors,
            hooks,
        }
    }
}

#[async_trait]
impl Middleware for RetryStage {
    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        let policy = request
            .options
            .retry
            .clone()
            .unwrap_or_else(|| self.policy.clone());
        let timeout = request.options.timeout.or(self.timeout);
        let cancel = request.options.cancel.clone();
        let ctx = request.error_context();

        let hooks = self.hooks.clone();
        let base = HookContext::for_request(&request);
        let executor = RetryExecutor::new(policy)
            .with_attempt_timeout(timeout)
            .with_listener(Arc::new(move |event: &RetryEvent| {
                hooks.emit(HookType::OnRetry, base.clone().with_retry(event));
            }));

        let policy = executor.policy();
        let request_id = request.id.clone();
        let result = executor
            .execute(cancel.as_ref(), |attempt| {
                let next = next.clone();
                let request = request.clone();
                let request_id = request_id.as_str();
                async move {
                    tracing::trace!(request_id = request_id, attempt = attempt, "dispatching attempt");
                    let resp = next.run(request).await?;
                    if policy.is_retriable_status(resp.status().as_u16()) {
                        Err(Error::http(resp))
                    } else {
                        Ok(resp)
                    }
                }
            })
            .await;

        match result {
            Ok(resp) => Ok(resp),
            Err(Error::Http { response, .. }) if !self.throw_http_errors => Ok(*response),
            Err(e) => Err(with_request_context(e, &ctx)),
        }
    }

    fn name(&self) -> &str {
        "retry"
    }
}
