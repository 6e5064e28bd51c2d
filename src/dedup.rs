//! In-flight request deduplication.
//!
//! Concurrent calls that share a key ride on one physical attempt. The
//! registry entry lives exactly as long as that attempt: it is removed as
//! soon as the attempt settles, or when every caller has gone away.

use crate::cache::KeyFn;
use crate::plugins::{Middleware, Next};
use crate::types::{Request, Response};
use crate::utils::request_fingerprint;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use reqwest::Method;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

type SharedAttempt = Shared<BoxFuture<'static, Result<Response>>>;

struct InFlight {
    id: u64,
    attempt: WeakShared<BoxFuture<'static, Result<Response>>>,
    joined: usize,
}

type Registry = Arc<Mutex<HashMap<String, InFlight>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, InFlight>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes the registry entry when the shared attempt completes or is dropped.
struct Deregister {
    registry: Registry,
    key: String,
    id: u64,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        let mut map = lock(&self.registry);
        if map.get(&self.key).map(|e| e.id) == Some(self.id) {
            map.remove(&self.key);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupSnapshot {
    pub key: String,
    /// Callers that joined after the first one.
    pub joined: usize,
}

#[derive(Default)]
pub struct Deduplicator {
    registry: Registry,
    next_id: AtomicU64,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `attempt` under `key`, or join the attempt already in flight for it.
    ///
    /// The caller that started the attempt gets its outcome unchanged; joiners
    /// receive a clone of the response, or the failure wrapped in
    /// [`Error::DedupJoin`]. `cancel` only detaches this caller; the attempt
    /// keeps running while anyone else is still waiting on it.
    pub async fn dedupe<F>(
        &self,
        key: String,
        cancel: Option<&CancellationToken>,
        attempt: F,
    ) -> Result<Response>
    where
        F: Future<Output = Result<Response>> + Send + 'static,
    {
        let (shared, leader) = self.join_or_start(&key, attempt);
        if !leader {
            tracing::debug!(key = key.as_str(), "joined in-flight request");
        }

        let outcome = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return Err(Error::cancelled(
                            ErrorContext::new().with_details(key.clone()).with_source("dedup"),
                        ));
                    }
                    out = shared => out,
                }
            }
            None => shared.await,
        };

        match outcome {
            Err(e) if !leader => Err(Error::DedupJoin {
                key,
                source: Box::new(e),
            }),
            other => other,
        }
    }

    fn join_or_start<F>(&self, key: &str, attempt: F) -> (SharedAttempt, bool)
    where
        F: Future<Output = Result<Response>> + Send + 'static,
    {
        let mut map = lock(&self.registry);
        if let Some(entry) = map.get_mut(key) {
            if let Some(shared) = entry.attempt.upgrade() {
                entry.joined += 1;
                return (shared, false);
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = Deregister {
            registry: self.registry.clone(),
            key: key.to_string(),
            id,
        };
        let shared = async move {
            let _guard = guard;
            attempt.await
        }
        .boxed()
        .shared();

        if let Some(weak) = shared.downgrade() {
            map.insert(
                key.to_string(),
                InFlight {
                    id,
                    attempt: weak,
                    joined: 0,
                },
            );
        }
        (shared, true)
    }

    /// Keys with an attempt in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn snapshot(&self) -> Vec<DedupSnapshot> {
        let mut out: Vec<_> = lock(&self.registry)
            .iter()
            .map(|(k, e)| DedupSnapshot {
                key: k.clone(),
                joined: e.joined,
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }
}

#[derive(Clone)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Methods deduplicated unless a request opts in or out explicitly.
    pub methods: Vec<Method>,
    pub key: KeyFn,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec![Method::GET, Method::HEAD],
            key: Arc::new(request_fingerprint),
        }
    }
}

impl fmt::Debug for DedupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupConfig")
            .field("enabled", &self.enabled)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

impl DedupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_methods(mut self, methods: Vec<Method>) -> Self {
        self.methods = methods;
        self
    }

    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.key = Arc::new(f);
        self
    }

    fn applies_to(&self, request: &Request) -> bool {
        match request.options.dedup {
            Some(explicit) => explicit,
            None => self.enabled && self.methods.contains(&request.method),
        }
    }
}

/// Pipeline stage wrapping [`Deduplicator`].
pub struct DedupStage {
    config: DedupConfig,
    dedup: Arc<Deduplicator>,
}

impl DedupStage {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            dedup: Arc::new(Deduplicator::new()),
        }
    }

    pub fn deduplicator(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }
}

#[async_trait]
impl Middleware for DedupStage {
    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        if !self.config.applies_to(&request) {
            return next.run(request).await;
        }
        let key = (self.config.key)(&request);
        let cancel = request.options.cancel.clone();

        // The shared attempt belongs to every joiner, not to this caller's token.
        let mut shared_request = request;
        shared_request.options.cancel = None;
        let attempt = next.run(shared_request);

        self.dedup.dedupe(key, cancel.as_ref(), attempt).await
    }

    fn name(&self) -> &str {
        "dedup"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, TransportErrorKind};
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use url::Url;

    fn ok(body: &'static str) -> Result<Response> {
        Ok(Response::new(
            StatusCode::OK,
            HeaderMap::new(),
            Url::parse("https://example.com/").unwrap(),
            bytes::Bytes::from_static(body.as_bytes()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_attempt() {
        let dedup = Arc::new(Deduplicator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let dedup = dedup.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                dedup
                    .dedupe("k".into(), None, async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ok("shared")
                    })
                    .await
            }));
        }
        for h in handles {
            let resp = h.await.unwrap().unwrap();
            assert_eq!(resp.text().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_replayed_to_joiners() {
        let dedup = Arc::new(Deduplicator::new());
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .dedupe("k".into(), None, async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(TransportError::new(TransportErrorKind::Network, "reset").into())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(dedup.in_flight(), 1);

        let joined = dedup.dedupe("k".into(), None, async { ok("unused") }).await;
        let leader = leader.await.unwrap();

        assert!(matches!(leader, Err(Error::Transport(..))));
        let err = joined.unwrap_err();
        assert!(matches!(err, Error::DedupJoin { .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_settled_entry_is_removed() {
        let dedup = Deduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            dedup
                .dedupe("k".into(), None, async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ok("x")
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dedup.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_joiner_leaves_attempt_running() {
        let dedup = Arc::new(Deduplicator::new());
        let leader = {
            let dedup = dedup.clone();
            tokio::spawn(async move {
                dedup
                    .dedupe("k".into(), None, async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        ok("done")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let token = CancellationToken::new();
        token.cancel();
        let err = dedup
            .dedupe("k".into(), Some(&token), async { ok("unused") })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());

        assert_eq!(leader.await.unwrap().unwrap().text().unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_attempt_is_replaced() {
        let dedup = Arc::new(Deduplicator::new());
        let token = CancellationToken::new();
        let started = {
            let dedup = dedup.clone();
            let token = token.clone();
            tokio::spawn(async move {
                dedup
                    .dedupe("k".into(), Some(&token), async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        ok("slow")
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(started.await.unwrap().is_err());
        assert_eq!(dedup.in_flight(), 0);

        let resp = dedup.dedupe("k".into(), None, async { ok("fresh") }).await;
        assert_eq!(resp.unwrap().text().unwrap(), "fresh");
    }

    #[test]
    fn test_default_methods() {
        let cfg = DedupConfig::new();
        assert!(cfg.applies_to(&Request::get("https://example.com").unwrap()));
        assert!(!cfg.applies_to(&Request::post("https://example.com").unwrap()));
        assert!(cfg.applies_to(&Request::post("https://example.com").unwrap().dedup(true)));
        assert!(!cfg.applies_to(&Request::get("https://example.com").unwrap().dedup(false)));
    }
}
