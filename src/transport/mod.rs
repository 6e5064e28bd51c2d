//! 传输层模块：发送单个请求并返回单个响应。
//!
//! # Transport Module
//!
//! The transport is the innermost collaborator of the pipeline: it sends one
//! request and returns one response, or fails. Everything above it (retry,
//! admission, circuit breaking, caching, deduplication) treats it as opaque.

mod http;

pub use http::HttpTransport;

use crate::types::{Request, Response};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Sends exactly one request. Implementations must not retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dispatch(&self, request: Request) -> Result<Response>;

    fn name(&self) -> &str {
        "transport"
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn dispatch(&self, request: Request) -> Result<Response> {
        (**self).dispatch(request).await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    Network,
    Dns,
    Tls,
    Protocol,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportErrorKind::Network => "network",
            TransportErrorKind::Dns => "dns",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Protocol => "protocol",
            TransportErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Failure to exchange a request/response with the upstream.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}
