//! `Link` header parsing (RFC 8288 subset).

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderMap;

static LINK_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<([^>]*)>((?:\s*;\s*[^;,<]+)*)"#).expect("LINK_VALUE is a compile-time constant")
});

static REL_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\brel\s*=\s*(?:"([^"]*)"|([^\s;,"]+))"#).expect("REL_PARAM is a compile-time constant")
});

/// Target of the first link whose `rel` includes `next`.
pub fn next_link(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(reqwest::header::LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(find_next)
}

fn find_next(value: &str) -> Option<String> {
    LINK_VALUE.captures_iter(value).find_map(|caps| {
        let target = caps.get(1)?.as_str().trim();
        let params = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let rel = REL_PARAM.captures(params)?;
        let rels = rel.get(1).or_else(|| rel.get(2))?.as_str();
        rels.split_whitespace()
            .any(|r| r.eq_ignore_ascii_case("next"))
            .then(|| target.to_string())
    })
}
