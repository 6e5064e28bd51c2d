//! Cache records and the storage backend trait.

use crate::types::Response;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A stored response: status, header snapshot, full body, write time and TTL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub url: String,
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn from_response(response: &Response, ttl: Duration) -> Self {
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        Self {
            status: response.status().as_u16(),
            headers,
            url: response.url().to_string(),
            body: response.body_bytes().to_vec(),
            stored_at_ms: now_ms(),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// Rebuild a response. The body is copied so every reader gets its own.
    pub fn to_response(&self) -> Result<Response> {
        let status = StatusCode::from_u16(self.status).map_err(|e| {
            Error::cache_with_context(
                format!("invalid stored status: {}", e),
                ErrorContext::new().with_source("cache"),
            )
        })?;
        let url = Url::parse(&self.url).map_err(|e| {
            Error::cache_with_context(
                format!("invalid stored url: {}", e),
                ErrorContext::new().with_url(&self.url).with_source("cache"),
            )
        })?;
        let mut headers = HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                headers.append(name, value);
            }
        }
        Ok(Response::new(status, headers, url, Bytes::from(self.body.clone())))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.stored_at_ms))
    }

    pub fn is_fresh(&self) -> bool {
        now_ms() < self.stored_at_ms.saturating_add(self.ttl_ms)
    }

    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Pluggable cache backend.
///
/// `ttl` passed to [`set`](Storage::set) is how long the backend retains the
/// record; freshness is judged from the entry's own `ttl_ms`.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;
    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
    /// Release background resources. The store must not be used afterwards.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str;
}
