//! In-memory LRU store with entry/byte bounds and optional compression.

use super::storage::{now_ms, CacheEntry, Storage};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lru::LruCache;
use serde::Deserialize;
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryStoreConfig {
    pub max_entries: usize,
    /// Budget for stored bodies and headers, after compression.
    pub max_bytes: Option<usize>,
    /// Bodies at least this large are zlib-compressed. `None` disables.
    pub compress_threshold: Option<usize>,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: None,
            compress_threshold: None,
        }
    }
}

impl MemoryStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entries(mut self, n: usize) -> Self {
        self.max_entries = n;
        self
    }

    pub fn with_max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = Some(n);
        self
    }

    pub fn with_compression(mut self, threshold: usize) -> Self {
        self.compress_threshold = Some(threshold);
        self
    }
}

struct Slot {
    entry: CacheEntry,
    compressed: bool,
    expires_at_ms: u64,
    size: usize,
}

struct Inner {
    entries: LruCache<String, Slot>,
    bytes: usize,
}

pub struct MemoryStore {
    cfg: MemoryStoreConfig,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(cfg: MemoryStoreConfig) -> Self {
        let cap = NonZeroUsize::new(cfg.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            cfg,
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                bytes: 0,
            }),
        }
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self::new(MemoryStoreConfig::new().with_max_entries(max_entries))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes currently held, after compression.
    pub fn bytes(&self) -> usize {
        self.lock().map(|i| i.bytes).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| {
            Error::cache_with_context(
                "memory store lock poisoned",
                ErrorContext::new().with_source("memory_store"),
            )
        })
    }

    fn pack(&self, mut entry: CacheEntry) -> Result<(CacheEntry, bool)> {
        match self.cfg.compress_threshold {
            Some(threshold) if entry.body.len() >= threshold => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&entry.body)?;
                entry.body = encoder.finish()?;
                Ok((entry, true))
            }
            _ => Ok((entry, false)),
        }
    }

    fn unpack(slot: &Slot) -> Result<CacheEntry> {
        let mut entry = slot.entry.clone();
        if slot.compressed {
            let mut decoder = ZlibDecoder::new(&slot.entry.body[..]);
            let mut body = Vec::new();
            decoder.read_to_end(&mut body)?;
            entry.body = body;
        }
        Ok(entry)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut inner = self.lock()?;
        let expired = match inner.entries.get(key) {
            None => return Ok(None),
            Some(slot) if now_ms() < slot.expires_at_ms => return Self::unpack(slot).map(Some),
            Some(_) => true,
        };
        if expired {
            if let Some(slot) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(slot.size);
            }
        }
        Ok(None)
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let (entry, compressed) = self.pack(entry)?;
        let size = entry.size() + key.len();
        if let Some(max) = self.cfg.max_bytes {
            if size > max {
                tracing::debug!(key = key, size = size, "entry exceeds memory budget, not stored");
                return Ok(());
            }
        }

        let mut inner = self.lock()?;
        if let Some(old) = inner.entries.pop(key) {
            inner.bytes = inner.bytes.saturating_sub(old.size);
        }
        if let Some(max) = self.cfg.max_bytes {
            while inner.bytes + size > max {
                match inner.entries.pop_lru() {
                    Some((_, evicted)) => inner.bytes = inner.bytes.saturating_sub(evicted.size),
                    None => break,
                }
            }
        }

        let slot = Slot {
            entry,
            compressed,
            expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
            size,
        };
        if let Some((_, evicted)) = inner.entries.push(key.to_string(), slot) {
            inner.bytes = inner.bytes.saturating_sub(evicted.size);
        }
        inner.bytes += size;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.entries.pop(key) {
            Some(slot) => {
                inner.bytes = inner.bytes.saturating_sub(slot.size);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.entries.clear();
        inner.bytes = 0;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &[u8]) -> CacheEntry {
        CacheEntry {
            status: 200,
            headers: vec![],
            url: "https://example.com/".into(),
            body: body.to_vec(),
            stored_at_ms: now_ms(),
            ttl_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::default();
        store.set("k", entry(b"abc"), Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().body, b"abc");
        assert!(store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let store = MemoryStore::default();
        store.set("k", entry(b"abc"), Duration::from_millis(30)).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction_by_count() {
        let store = MemoryStore::with_capacity(2);
        let ttl = Duration::from_secs(60);
        store.set("a", entry(b"1"), ttl).await.unwrap();
        store.set("b", entry(b"2"), ttl).await.unwrap();
        // Touch "a" so "b" becomes least recently used.
        store.get("a").await.unwrap();
        store.set("c", entry(b"3"), ttl).await.unwrap();

        assert!(store.get("a").await.unwrap().is_some());
        assert!(store.get("b").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_byte_budget_evicts_oldest() {
        let store = MemoryStore::new(MemoryStoreConfig::new().with_max_bytes(64));
        let ttl = Duration::from_secs(60);
        store.set("a", entry(&[1u8; 40]), ttl).await.unwrap();
        store.set("b", entry(&[2u8; 40]), ttl).await.unwrap();
        assert!(store.bytes() <= 64);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("b").await.unwrap().is_some());

        // Larger than the whole budget: silently skipped.
        store.set("huge", entry(&[0u8; 100]), ttl).await.unwrap();
        assert!(store.get("huge").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compression_round_trips_body() {
        let store = MemoryStore::new(MemoryStoreConfig::new().with_compression(16));
        let body = vec![b'x'; 4096];
        store.set("k", entry(&body), Duration::from_secs(60)).await.unwrap();
        assert!(store.bytes() < 1024);
        assert_eq!(store.get("k").await.unwrap().unwrap().body, body);
    }
}
