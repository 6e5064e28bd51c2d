use super::{Transport, TransportError, TransportErrorKind};
use crate::error::TimeoutPhase;
use crate::types::{Request, Response};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::Proxy;
use std::env;
use std::error::Error as _;
use std::time::{Duration, Instant};

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build with production-friendly defaults (env-overridable).
    pub fn new() -> Result<Self> {
        let timeout_secs = env_parse::<u64>("FETCHLINE_HTTP_TIMEOUT_SECS").unwrap_or(30);

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_max_idle_per_host(env_parse("FETCHLINE_HTTP_POOL_MAX_IDLE_PER_HOST").unwrap_or(32))
            .pool_idle_timeout(Some(Duration::from_secs(
                env_parse("FETCHLINE_HTTP_POOL_IDLE_TIMEOUT_SECS").unwrap_or(90),
            )))
            .http2_adaptive_window(true)
            .http2_keep_alive_interval(Some(Duration::from_secs(30)))
            .http2_keep_alive_timeout(Duration::from_secs(10));

        if let Ok(proxy_url) = env::var("FETCHLINE_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder.build().map_err(|e| {
            Error::from(TransportError::new(TransportErrorKind::Other, e.to_string()).with_cause(e))
        })?;
        Ok(Self { client })
    }

    /// Wrap an already configured reqwest client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn classify(err: reqwest::Error, elapsed: Duration) -> Error {
        if err.is_timeout() {
            let phase = if err.is_connect() {
                TimeoutPhase::Connect
            } else {
                TimeoutPhase::Response
            };
            return Error::timeout(phase, elapsed);
        }

        let chain = error_chain_text(&err);
        let kind = if chain.contains("dns") || chain.contains("resolve") {
            TransportErrorKind::Dns
        } else if chain.contains("tls") || chain.contains("certificate") {
            TransportErrorKind::Tls
        } else if err.is_connect() || err.is_request() {
            TransportErrorKind::Network
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Protocol
        } else {
            TransportErrorKind::Other
        };
        TransportError::new(kind, err.to_string()).with_cause(err).into()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn dispatch(&self, request: Request) -> Result<Response> {
        let start = Instant::now();
        let ctx = request.error_context().with_source("http_transport");
        let url = request.url.clone();

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(|e| {
            Self::classify(e, start.elapsed()).map_context(|c| {
                let elapsed = start.elapsed();
                *c = ctx.clone().with_elapsed(elapsed);
            })
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| {
            Self::classify(e, start.elapsed()).map_context(|c| {
                *c = ctx.clone().with_elapsed(start.elapsed());
            })
        })?;

        tracing::trace!(
            request_id = request.id.as_str(),
            http_status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "transport dispatch complete"
        );
        Ok(Response::new(status, headers, url, body))
    }

    fn name(&self) -> &str {
        "reqwest"
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse::<T>().ok())
}

fn error_chain_text(err: &reqwest::Error) -> String {
    let mut text = String::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = current {
        text.push_str(&e.to_string().to_lowercase());
        text.push(' ');
        current = e.source();
    }
    text
}
