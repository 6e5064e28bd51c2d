//! The cache stage of the request pipeline.

use super::storage::{CacheEntry, Storage};
use super::{CacheConfig, CacheStrategy};
use crate::plugins::{HookContext, HookManager, HookType, Middleware, Next};
use crate::types::{CacheStatus, Request, Response};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries served past their TTL (stale-while-revalidate or fallback).
    pub stale: u64,
    pub stores: u64,
    /// Background refreshes that repopulated an entry.
    pub revalidations: u64,
    pub errors: u64,
}

impl CacheStats {
    /// Share of cache lookups answered from storage, stale answers included.
    pub fn hit_ratio(&self) -> f64 {
        let served = self.hits + self.stale;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
    stores: AtomicU64,
    revalidations: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            revalidations: self.revalidations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Applies a [`CacheStrategy`] around the rest of the chain.
pub struct CacheLayer {
    storage: Arc<dyn Storage>,
    config: CacheConfig,
    stats: Arc<AtomicStats>,
    /// Keys with a background refresh in flight.
    refreshing: Arc<Mutex<HashSet<String>>>,
    hooks: Option<Arc<HookManager>>,
}

impl CacheLayer {
    pub fn new(storage: Arc<dyn Storage>, config: CacheConfig) -> Self {
        Self {
            storage,
            config,
            stats: Arc::new(AtomicStats::default()),
            refreshing: Arc::new(Mutex::new(HashSet::new())),
            hooks: None,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<HookManager>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Background refreshes currently running.
    pub fn refreshing(&self) -> usize {
        self.refreshing.lock().map(|s| s.len()).unwrap_or(0)
    }

    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.storage.get(key).await.map_err(|e| {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            e
        })
    }

    fn serve(&self, request: &Request, key: &str, entry: &CacheEntry) -> Result<Response> {
        let status = if entry.is_fresh() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            CacheStatus::Hit
        } else {
            self.stats.stale.fetch_add(1, Ordering::Relaxed);
            CacheStatus::Stale
        };
        tracing::debug!(
            request_id = request.id.as_str(),
            key = key,
            age_ms = entry.age().as_millis() as u64,
            cache_status = ?status,
            "served from cache"
        );
        if let Some(hooks) = &self.hooks {
            let mut ctx = HookContext::for_request(request)
                .with_status(entry.status)
                .with_cache_key(key);
            ctx.metadata
                .insert("stale".into(), (status == CacheStatus::Stale).into());
            hooks.emit(HookType::OnCacheHit, ctx);
        }
        Ok(entry.to_response()?.with_cache_status(status))
    }

    fn record_miss(&self, request: &Request, key: &str) {
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(request_id = request.id.as_str(), key = key, "cache miss");
        if let Some(hooks) = &self.hooks {
            hooks.emit(
                HookType::OnCacheMiss,
                HookContext::for_request(request).with_cache_key(key),
            );
        }
    }

    fn writer(&self) -> EntryWriter {
        EntryWriter {
            storage: self.storage.clone(),
            stats: self.stats.clone(),
            retention: self.config.stale_retention,
        }
    }

    fn spawn_refresh(&self, key: String, mut request: Request, next: Next, ttl: Duration) {
        {
            let Ok(mut running) = self.refreshing.lock() else {
                return;
            };
            if !running.insert(key.clone()) {
                return;
            }
        }
        // The refresh outlives the caller; it must not observe its cancellation.
        request.options.cancel = None;
        let writer = self.writer();
        let guard = RefreshGuard {
            key,
            running: self.refreshing.clone(),
        };

        tokio::spawn(async move {
            let key = guard.key.as_str();
            match next.run(request).await {
                Ok(resp) if resp.is_success() => match writer.write(key, &resp, ttl).await {
                    Ok(()) => {
                        writer.stats.revalidations.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => tracing::debug!(key = key, error = %e, "revalidation store failed"),
                },
                Ok(resp) => {
                    tracing::debug!(key = key, http_status = resp.status().as_u16(), "revalidation not stored")
                }
                Err(e) => tracing::debug!(key = key, error = %e, "revalidation failed"),
            }
        });
    }
}

struct EntryWriter {
    storage: Arc<dyn Storage>,
    stats: Arc<AtomicStats>,
    retention: Duration,
}

impl EntryWriter {
    async fn write(&self, key: &str, response: &Response, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::from_response(response, ttl);
        match self.storage.set(key, entry, ttl + self.retention).await {
            Ok(()) => {
                self.stats.stores.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}

struct RefreshGuard {
    key: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.key);
        }
    }
}

#[async_trait]
impl Middleware for CacheLayer {
    async fn handle(&self, request: Request, next: Next) -> Result<Response> {
        let strategy = request.options.cache.unwrap_or(self.config.strategy);
        if strategy == CacheStrategy::NetworkOnly || !self.config.is_cacheable(&request.method) {
            return next.run(request).await;
        }

        let key = (self.config.key)(&request);
        let ttl = request.options.cache_ttl.unwrap_or(self.config.ttl);

        let mut cached = None;
        match strategy {
            CacheStrategy::CacheFirst => {
                cached = self.lookup(&key).await?;
                if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh()) {
                    return self.serve(&request, &key, entry);
                }
                self.record_miss(&request, &key);
            }
            CacheStrategy::StaleWhileRevalidate => {
                if let Some(entry) = self.lookup(&key).await? {
                    let response = self.serve(&request, &key, &entry)?;
                    self.spawn_refresh(key, request, next, ttl);
                    return Ok(response);
                }
                self.record_miss(&request, &key);
            }
            _ => {}
        }

        // Network-first from here on.
        let outcome = next.run(request.clone()).await;
        let failed = match &outcome {
            Ok(resp) => resp.status().is_server_error(),
            Err(e) => !e.is_cancelled(),
        };
        if failed {
            if cached.is_none() {
                cached = self.lookup(&key).await.unwrap_or_else(|e| {
                    tracing::debug!(key = key.as_str(), error = %e, "fallback lookup failed");
                    None
                });
            }
            if let Some(entry) = cached {
                tracing::debug!(key = key.as_str(), "network failed, serving cached entry");
                self.stats.stale.fetch_add(1, Ordering::Relaxed);
                if let Some(hooks) = &self.hooks {
                    let mut ctx = HookContext::for_request(&request).with_cache_key(key.as_str());
                    ctx.metadata.insert("fallback".into(), true.into());
                    hooks.emit(HookType::OnCacheHit, ctx);
                }
                return Ok(entry.to_response()?.with_cache_status(CacheStatus::Stale));
            }
        }

        let response = outcome?;
        if response.is_success() {
            self.writer().write(&key, &response, ttl).await?;
        }
        Ok(response.with_cache_status(CacheStatus::Miss))
    }

    fn name(&self) -> &str {
        "cache"
    }
}
