//! Request fingerprints used as cache and dedup keys.

use crate::types::Request;
use sha2::{Digest, Sha256};
use url::Url;

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Canonical form of `url`: fragment dropped, query pairs sorted.
///
/// Scheme and host are already lowercased by the parser, and default ports
/// are elided, so `HTTPS://Example.com:443/a?b=2&a=1#x` and
/// `https://example.com/a?a=1&b=2` normalize identically.
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// `METHOD normalized-url`. The default cache key.
pub fn method_url_key(request: &Request) -> String {
    format!("{} {}", request.method, normalize_url(&request.url))
}

/// `METHOD normalized-url body-sha256`. The default dedup key.
pub fn request_fingerprint(request: &Request) -> String {
    let body = request
        .body
        .as_deref()
        .map(sha256_hex)
        .unwrap_or_else(|| "-".to_string());
    format!("{} {}", method_url_key(request), body)
}
