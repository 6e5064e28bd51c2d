//! 分页模块：惰性地逐页获取并产出数据。
//!
//! # Pagination Module
//!
//! Lazily walks a paginated API, one request per page, through whatever
//! fetch function the caller supplies (normally the client's pipeline, so
//! every page gets dedup, cache, breaker, admission and retry).
//!
//! After each page the next URL is chosen by the first configured strategy
//! that yields one, in this order:
//!
//! | Priority | Strategy | Source of the next URL |
//! |----------|----------|------------------------|
//! | 1 | [`PaginationOptions::with_next_url`] | Caller function over the current [`Page`] |
//! | 2 | [`CursorOptions`] | Dot-path lookup into the body, set as a query parameter on the first URL |
//! | 3 | [`PageNumberOptions`] | Numeric query parameter, until a page has no items |
//! | 4 | `Link` header | `rel="next"` target |
//!
//! Iteration stops when no strategy yields a URL, when the next URL equals
//! the current one, or after `max_pages` pages.

mod link;

pub use link::next_link;

use crate::types::{Request, Response};
use crate::utils::PathMapper;
use crate::Result;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use url::Url;

/// One fetched page.
#[derive(Debug, Clone)]
pub struct Page {
    /// Decoded JSON body, `Null` when the body is empty or not JSON.
    pub data: Value,
    pub response: Response,
    /// 1-based index of this page in the walk.
    pub page_number: usize,
}

impl Page {
    fn new(response: Response, page_number: usize) -> Self {
        let body = response.body_bytes();
        let data = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(body).unwrap_or_else(|e| {
                tracing::debug!(url = %response.url(), error = %e, "page body is not JSON");
                Value::Null
            })
        };
        Self {
            data,
            response,
            page_number,
        }
    }

    /// The page's item collection: the body itself when it is an array,
    /// otherwise the array under `data` or `items`.
    pub fn items(&self) -> &[Value] {
        match &self.data {
            Value::Array(items) => items,
            Value::Object(map) => ["data", "items"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array))
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn into_items(self) -> Vec<Value> {
        match self.data {
            Value::Array(items) => items,
            Value::Object(mut map) => ["data", "items"]
                .iter()
                .find_map(|k| match map.remove(*k) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                })
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

pub type NextUrlFn = Arc<dyn Fn(&Page) -> Option<String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorOptions {
    /// Dot-path of the cursor in the decoded body, e.g. `meta.next_cursor`.
    pub path: String,
    pub param: String,
}

impl CursorOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            param: "cursor".to_string(),
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = param.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageNumberOptions {
    pub param: String,
    pub start: u64,
}

impl Default for PageNumberOptions {
    fn default() -> Self {
        Self {
            param: "page".to_string(),
            start: 1,
        }
    }
}

impl PageNumberOptions {
    pub fn new(param: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            ..Self::default()
        }
    }

    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }
}

#[derive(Clone, Default)]
pub struct PaginationOptions {
    pub next_url: Option<NextUrlFn>,
    pub cursor: Option<CursorOptions>,
    pub page_number: Option<PageNumberOptions>,
    pub follow_link_header: bool,
    pub max_pages: Option<usize>,
}

impl fmt::Debug for PaginationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginationOptions")
            .field("next_url", &self.next_url.as_ref().map(|_| "<fn>"))
            .field("cursor", &self.cursor)
            .field("page_number", &self.page_number)
            .field("follow_link_header", &self.follow_link_header)
            .field("max_pages", &self.max_pages)
            .finish()
    }
}

/// Strategy consulted for the next page, tried in declaration order.
enum Strategy<'a> {
    Explicit(&'a NextUrlFn),
    Cursor(&'a CursorOptions),
    PageNumber(&'a PageNumberOptions),
    LinkHeader,
}

impl PaginationOptions {
    /// Follows `Link: rel="next"` only.
    pub fn new() -> Self {
        Self {
            follow_link_header: true,
            ..Self::default()
        }
    }

    pub fn with_next_url<F>(mut self, f: F) -> Self
    where
        F: Fn(&Page) -> Option<String> + Send + Sync + 'static,
    {
        self.next_url = Some(Arc::new(f));
        self
    }

    pub fn with_cursor(mut self, cursor: CursorOptions) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_page_number(mut self, page: PageNumberOptions) -> Self {
        self.page_number = Some(page);
        self
    }

    pub fn with_link_header(mut self, follow: bool) -> Self {
        self.follow_link_header = follow;
        self
    }

    pub fn with_max_pages(mut self, max: usize) -> Self {
        self.max_pages = Some(max);
        self
    }

    fn strategies(&self) -> Vec<Strategy<'_>> {
        let mut out = Vec::with_capacity(4);
        if let Some(f) = &self.next_url {
            out.push(Strategy::Explicit(f));
        }
        if let Some(c) = &self.cursor {
            out.push(Strategy::Cursor(c));
        }
        if let Some(p) = &self.page_number {
            out.push(Strategy::PageNumber(p));
        }
        if self.follow_link_header {
            out.push(Strategy::LinkHeader);
        }
        out
    }

    fn next_url(&self, page: &Page, current: &Url, first: &Url) -> Option<Url> {
        self.strategies().into_iter().find_map(|strategy| match strategy {
            Strategy::Explicit(f) => f(page).and_then(|next| current.join(&next).ok()),
            Strategy::Cursor(c) => {
                let cursor = PathMapper::get_string(&page.data, &c.path)?;
                if cursor.is_empty() {
                    return None;
                }
                Some(with_query_param(first, &c.param, &cursor))
            }
            Strategy::PageNumber(p) => {
                if page.items().is_empty() {
                    return None;
                }
                let at = current
                    .query_pairs()
                    .find(|(k, _)| k == p.param.as_str())
                    .and_then(|(_, v)| v.parse::<u64>().ok())
                    .unwrap_or(p.start);
                let next = at.checked_add(1)?;
                Some(with_query_param(current, &p.param, &next.to_string()))
            }
            Strategy::LinkHeader => {
                next_link(page.response.headers()).and_then(|next| current.join(&next).ok())
            }
        })
    }
}

/// Copy of `url` with `name` set to `value`, replacing any existing values.
fn with_query_param(url: &Url, name: &str, value: &str) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut out = url.clone();
    {
        let mut pairs = out.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        pairs.append_pair(name, value);
    }
    out
}

/// A request for the next page: same method, headers and options, fresh id.
fn follow(template: &Request, url: Url) -> Request {
    let mut next = template.clone();
    next.id = uuid::Uuid::new_v4().to_string();
    next.url = url;
    next
}

struct Walk<F> {
    pending: Option<Request>,
    first: Url,
    fetched: usize,
    options: PaginationOptions,
    fetch: F,
}

/// Lazily fetch pages starting at `first`.
///
/// A fetch error is yielded once and ends the stream.
pub fn pages<F, Fut>(first: Request, options: PaginationOptions, fetch: F) -> BoxStream<'static, Result<Page>>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    let mut first = first;
    if let Some(p) = &options.page_number {
        if !first.url.query_pairs().any(|(k, _)| k == p.param.as_str()) {
            first.url = with_query_param(&first.url, &p.param, &p.start.to_string());
        }
    }
    let walk = Walk {
        first: first.url.clone(),
        pending: Some(first),
        fetched: 0,
        options,
        fetch,
    };

    stream::unfold(walk, |mut walk| async move {
        let request = walk.pending.take()?;
        if walk.options.max_pages.is_some_and(|max| walk.fetched >= max) {
            tracing::debug!(pages = walk.fetched, "page limit reached");
            return None;
        }
        let current = request.url.clone();
        let template = request.clone();

        match (walk.fetch)(request).await {
            Ok(response) => {
                walk.fetched += 1;
                let page = Page::new(response, walk.fetched);
                walk.pending = walk
                    .options
                    .next_url(&page, &current, &walk.first)
                    .filter(|next| *next != current)
                    .map(|next| follow(&template, next));
                tracing::trace!(
                    page = page.page_number,
                    items = page.items().len(),
                    has_next = walk.pending.is_some(),
                    "fetched page"
                );
                Some((Ok(page), walk))
            }
            Err(e) => Some((Err(e), walk)),
        }
    })
    .boxed()
}

/// Lazily yield the items of every page, in order.
pub fn paginate<F, Fut>(first: Request, options: PaginationOptions, fetch: F) -> BoxStream<'static, Result<Value>>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    pages(first, options, fetch)
        .flat_map(|page| {
            let items: Vec<Result<Value>> = match page {
                Ok(page) => page.into_items().into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        })
        .boxed()
}
