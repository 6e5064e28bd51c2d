//! Request value type and per-call option overrides.

use crate::cache::CacheStrategy;
use crate::resilience::retry::RetryPolicy;
use crate::{Error, ErrorContext, Result};
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Per-call overrides of client-level policy.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Per-attempt deadline.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub cache: Option<CacheStrategy>,
    pub cache_ttl: Option<Duration>,
    /// `Some(false)` opts this call out of deduplication.
    pub dedup: Option<bool>,
    pub cancel: Option<CancellationToken>,
}

/// An outgoing HTTP request.
///
/// Treated as an immutable value by the pipeline: stages clone it when they
/// need a derived copy (e.g. one per retry attempt).
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub options: RequestOptions,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            options: RequestOptions::default(),
        }
    }

    /// Parse `url` and build a request.
    pub fn parse(method: Method, url: &str) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|e| {
            Error::validation_with_context(
                format!("invalid url: {}", e),
                ErrorContext::new()
                    .with_url(url)
                    .with_source("request"),
            )
        })?;
        Ok(Self::new(method, parsed))
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::parse(Method::GET, url)
    }

    pub fn post(url: &str) -> Result<Self> {
        Self::parse(Method::POST, url)
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
            Error::validation_with_context(
                format!("invalid header name: {}", e),
                ErrorContext::new().with_details(name.to_string()),
            )
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| {
            Error::validation_with_context(
                format!("invalid header value: {}", e),
                ErrorContext::new().with_details(name.to_string()),
            )
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body and set the content type.
    pub fn json<T: serde::Serialize>(mut self, value: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(value)?;
        self.headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.body = Some(Bytes::from(bytes));
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = Some(policy);
        self
    }

    pub fn cache_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.options.cache = Some(strategy);
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.options.cache_ttl = Some(ttl);
        self
    }

    pub fn dedup(mut self, enabled: bool) -> Self {
        self.options.dedup = Some(enabled);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.options.cancel = Some(token);
        self
    }

    /// Logical upstream target, used to partition circuit state and admission pools.
    pub fn target_key(&self) -> String {
        let host = self.url.host_str().unwrap_or("");
        match self.url.port_or_known_default() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Context pre-filled with this request's identity.
    pub fn error_context(&self) -> ErrorContext {
        ErrorContext::new()
            .with_method(self.method.as_str())
            .with_url(self.url.as_str())
            .with_target(self.target_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key_uses_default_port() {
        let req = Request::get("https://api.example.com/v1/items").unwrap();
        assert_eq!(req.target_key(), "api.example.com:443");

        let req = Request::get("http://localhost:8080/x").unwrap();
        assert_eq!(req.target_key(), "localhost:8080");
    }

    #[test]
    fn test_invalid_url_is_validation_error() {
        let err = Request::get("not a url").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let req = Request::post("https://example.com/items")
            .unwrap()
            .json(&serde_json::json!({"name": "a"}))
            .unwrap();
        assert_eq!(
            req.headers.get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(req.body.as_deref(), Some(&br#"{"name":"a"}"#[..]));
    }

    #[test]
    fn test_each_request_gets_unique_id() {
        let a = Request::get("https://example.com").unwrap();
        let b = Request::get("https://example.com").unwrap();
        assert_ne!(a.id, b.id);
    }
}
