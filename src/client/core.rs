use super::builder::ClientBuilder;
use super::signals::SignalsSnapshot;
use crate::batch::{BatchOptions, BatchResult, BatchRunner};
use crate::cache::{CacheStats, Storage};
use crate::pagination::{self, Page, PaginationOptions};
use crate::pipeline::RequestPipeline;
use crate::plugins::HookManager;
use crate::types::{Request, Response};
use crate::{Error, ErrorContext, Result};
use futures::stream::BoxStream;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use url::Url;

pub(crate) struct ClientInner {
    pub(crate) pipeline: RequestPipeline,
    pub(crate) base_url: Option<Url>,
    pub(crate) headers: HeaderMap,
    pub(crate) storage: Option<Arc<dyn Storage>>,
}

/// HTTP client facade over one [`RequestPipeline`].
///
/// Cloning is cheap and clones share every registry: admission slots,
/// circuits, the dedup table and the cache.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Build a request, resolving `url` against the base URL when it is relative.
    pub fn new_request(&self, method: Method, url: &str) -> Result<Request> {
        match Url::parse(url) {
            Ok(absolute) => Ok(Request::new(method, absolute)),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.inner.base_url.as_ref().ok_or_else(|| {
                    Error::validation_with_context(
                        "relative url without a configured base_url",
                        ErrorContext::new().with_url(url).with_source("client"),
                    )
                })?;
                let joined = base.join(url).map_err(|e| {
                    Error::validation_with_context(
                        format!("invalid url: {}", e),
                        ErrorContext::new().with_url(url).with_source("client"),
                    )
                })?;
                Ok(Request::new(method, joined))
            }
            Err(e) => Err(Error::validation_with_context(
                format!("invalid url: {}", e),
                ErrorContext::new().with_url(url).with_source("client"),
            )),
        }
    }

    fn prepare(&self, mut request: Request) -> Request {
        for (name, value) in self.inner.headers.iter() {
            if !request.headers.contains_key(name) {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        request
    }

    /// Run one request through the pipeline.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let request = self.prepare(request);
        self.inner.pipeline.execute(request).await
    }

    pub async fn get(&self, url: &str) -> Result<Response> {
        let request = self.new_request(Method::GET, url)?;
        self.request(request).await
    }

    /// Decode a successful JSON response.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.get(url).await?.json()
    }

    fn batch_runner(&self, options: &BatchOptions) -> BatchRunner {
        let cap = self
            .inner
            .pipeline
            .concurrency()
            .and_then(|c| c.max())
            .unwrap_or(usize::MAX);
        BatchRunner::new(options.concurrency.min(cap))
    }

    /// Run every request with bounded parallelism. One failure never aborts the rest.
    pub async fn batch(&self, requests: Vec<Request>, options: BatchOptions) -> BatchResult<Response> {
        self.batch_with(requests, options, |resp| async move { Ok(resp) })
            .await
    }

    /// Like [`batch`](Self::batch), mapping each response. Mapper failures are
    /// captured per item.
    pub async fn batch_with<T, F, Fut>(
        &self,
        requests: Vec<Request>,
        options: BatchOptions,
        map_response: F,
    ) -> BatchResult<T>
    where
        F: Fn(Response) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let runner = self.batch_runner(&options);
        let map_response = &map_response;
        runner
            .run(requests, |request| async move {
                let response = self.request(request).await?;
                map_response(response).await
            })
            .await
    }

    /// Lazily fetch pages starting at `first`. Every page goes through the pipeline.
    pub fn pages(&self, first: Request, options: PaginationOptions) -> BoxStream<'static, Result<Page>> {
        let client = self.clone();
        pagination::pages(first, options, move |request| {
            let client = client.clone();
            async move { client.request(request).await }
        })
    }

    /// Lazily yield the items of every page.
    pub fn paginate(&self, first: Request, options: PaginationOptions) -> BoxStream<'static, Result<Value>> {
        let client = self.clone();
        pagination::paginate(first, options, move |request| {
            let client = client.clone();
            async move { client.request(request).await }
        })
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        self.inner.pipeline.hooks()
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.inner.pipeline
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.pipeline.cache().map(|c| c.stats())
    }

    pub async fn signals(&self) -> SignalsSnapshot {
        let pipeline = &self.inner.pipeline;
        let concurrency = match pipeline.concurrency() {
            Some(c) => Some(c.snapshot().await),
            None => None,
        };
        SignalsSnapshot {
            concurrency,
            circuits: pipeline
                .circuit_breaker()
                .map(|b| b.snapshots())
                .unwrap_or_default(),
            dedup_in_flight: pipeline
                .deduplicator()
                .map(|d| d.snapshot())
                .unwrap_or_default(),
            cache: self.cache_stats(),
        }
    }

    /// Release storage resources (stops the file store sweeper).
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(storage) = &self.inner.storage {
            storage.shutdown().await?;
        }
        tracing::debug!("client shut down");
        Ok(())
    }
}
