//! Response value type.

use crate::{Error, Result};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStatus {
    /// Cache not consulted for this request.
    #[default]
    Bypass,
    /// Fetched from the network after a lookup found nothing usable.
    Miss,
    /// Served from a fresh cache entry.
    Hit,
    /// Served from a cache entry past its TTL, or as a network-failure fallback.
    Stale,
}

/// An HTTP response.
///
/// The body is consumed by the `into_*` / `text` / `json` methods, which take
/// `self`. Use `clone()` to inspect a body without consuming the original; the
/// buffer is reference-counted, so cloning never copies the payload.
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Bytes,
    cache_status: CacheStatus,
}

impl Response {
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: Bytes) -> Self {
        Self {
            status,
            headers,
            url,
            body,
            cache_status: CacheStatus::Bypass,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.cache_status
    }

    pub(crate) fn with_cache_status(mut self, status: CacheStatus) -> Self {
        self.cache_status = status;
        self
    }

    /// First non-empty value among `names`.
    pub fn header_first(&self, names: &[&str]) -> Option<String> {
        for name in names {
            if let Some(v) = self.headers.get(*name) {
                if let Ok(s) = v.to_str() {
                    let s = s.trim();
                    if !s.is_empty() {
                        return Some(s.to_string());
                    }
                }
            }
        }
        None
    }

    pub fn content_length(&self) -> usize {
        self.body.len()
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    pub fn text(self) -> Result<String> {
        String::from_utf8(self.body.to_vec()).map_err(|e| {
            Error::validation_with_context(
                format!("response body is not UTF-8: {}", e),
                crate::ErrorContext::new()
                    .with_url(self.url.as_str())
                    .with_source("response"),
            )
        })
    }

    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Turn a non-2xx response into `Error::Http`.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::http(self))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &'static str) -> Response {
        Response::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            Url::parse("https://example.com/a").unwrap(),
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[test]
    fn test_clone_leaves_original_readable() {
        let resp = response(200, r#"{"ok":true}"#);
        let peek = resp.clone().text().unwrap();
        assert_eq!(peek, r#"{"ok":true}"#);
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_error_for_status() {
        assert!(response(204, "").error_for_status().is_ok());
        let err = response(503, "down").error_for_status().unwrap_err();
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.response().unwrap().clone().text().unwrap(), "down");
    }
}
