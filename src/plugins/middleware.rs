//! Middleware system.
//!
//! A middleware receives the request and a [`Next`] continuation. It may
//! rewrite the request, call `next.run(..)` zero, one or several times, or
//! return a response of its own to short-circuit the rest of the chain.

use crate::transport::Transport;
use crate::types::{Request, Response};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request, next: Next) -> Result<Response>;

    fn name(&self) -> &str {
        "unnamed"
    }
}

/// The remainder of the chain after the current middleware.
///
/// `Next` owns its share of the chain, so it can be cloned to call
/// downstream more than once or moved into a spawned task.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    transport: Arc<dyn Transport>,
}

impl Next {
    pub(crate) fn new(chain: Arc<[Arc<dyn Middleware>]>, transport: Arc<dyn Transport>) -> Self {
        Self {
            chain,
            index: 0,
            transport,
        }
    }

    pub async fn run(self, request: Request) -> Result<Response> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Next {
                    chain: self.chain,
                    index: self.index + 1,
                    transport: self.transport,
                };
                middleware.handle(request, next).await
            }
            None => self.transport.dispatch(request).await,
        }
    }

    /// Stages still ahead, not counting the transport.
    pub fn remaining(&self) -> usize {
        self.chain.len().saturating_sub(self.index)
    }
}

/// Ordered list of middleware in front of a transport.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(m);
        self
    }

    pub fn push(&mut self, m: Arc<dyn Middleware>) {
        self.middlewares.push(m);
    }

    pub fn extend(&mut self, other: MiddlewareChain) {
        self.middlewares.extend(other.middlewares);
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    /// Freeze the chain in front of `transport`.
    pub fn into_next(self, transport: Arc<dyn Transport>) -> Next {
        Next::new(self.middlewares.into(), transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn dispatch(&self, request: Request) -> Result<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            if let Some(tag) = request.headers.get("x-tag") {
                headers.insert("x-tag", tag.clone());
            }
            Ok(Response::new(
                StatusCode::OK,
                headers,
                request.url.clone(),
                bytes::Bytes::new(),
            ))
        }
    }

    struct Tag(&'static str);

    #[async_trait]
    impl Middleware for Tag {
        async fn handle(&self, mut request: Request, next: Next) -> Result<Response> {
            let value = match request.headers.get("x-tag") {
                Some(v) => format!("{},{}", v.to_str().unwrap_or(""), self.0),
                None => self.0.to_string(),
            };
            request
                .headers
                .insert("x-tag", HeaderValue::from_str(&value).unwrap());
            next.run(request).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Middleware for ShortCircuit {
        async fn handle(&self, request: Request, _next: Next) -> Result<Response> {
            Ok(Response::new(
                StatusCode::NO_CONTENT,
                HeaderMap::new(),
                request.url,
                bytes::Bytes::new(),
            ))
        }
    }

    struct Twice;

    #[async_trait]
    impl Middleware for Twice {
        async fn handle(&self, request: Request, next: Next) -> Result<Response> {
            next.clone().run(request.clone()).await?;
            next.run(request).await
        }
    }

    #[tokio::test]
    async fn test_chain_runs_in_order() {
        let transport = Arc::new(EchoTransport {
            calls: AtomicUsize::new(0),
        });
        let next = MiddlewareChain::new()
            .add(Arc::new(Tag("a")))
            .add(Arc::new(Tag("b")))
            .into_next(transport.clone());

        let resp = next
            .run(Request::get("https://example.com").unwrap())
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-tag").unwrap(), "a,b");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_transport() {
        let transport = Arc::new(EchoTransport {
            calls: AtomicUsize::new(0),
        });
        let next = MiddlewareChain::new()
            .add(Arc::new(ShortCircuit))
            .into_next(transport.clone());

        let resp = next
            .run(Request::get("https://example.com").unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_next_can_be_called_more_than_once() {
        let transport = Arc::new(EchoTransport {
            calls: AtomicUsize::new(0),
        });
        let next = MiddlewareChain::new()
            .add(Arc::new(Twice))
            .into_next(transport.clone());

        next.run(Request::get("https://example.com").unwrap())
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }
}
