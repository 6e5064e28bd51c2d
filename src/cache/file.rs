//! Filesystem store: one JSON record per key, swept in the background.

use super::storage::{now_ms, CacheEntry, Storage};
use crate::utils::sha256_hex;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const RECORD_EXT: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: String,
    expires_at_ms: u64,
    entry: CacheEntry,
}

pub struct FileStore {
    dir: PathBuf,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `dir`.
    ///
    /// With `sweep_interval` set, a background task removes expired and
    /// unreadable records until [`Storage::shutdown`] is called.
    pub async fn open(dir: impl Into<PathBuf>, sweep_interval: Option<Duration>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| io_error(&dir, e))?;

        let shutdown = CancellationToken::new();
        let sweeper = sweep_interval
            .filter(|d| !d.is_zero())
            .map(|interval| tokio::spawn(sweep_loop(dir.clone(), interval, shutdown.clone())));

        Ok(Self {
            dir,
            shutdown,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", sha256_hex(key.as_bytes()), RECORD_EXT))
    }

    /// Remove every expired or unreadable record now. Returns how many were removed.
    pub async fn sweep(&self) -> Result<usize> {
        sweep_dir(&self.dir).await
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path, e)),
        };
        let record: Record = match serde_json::from_slice(&data) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "discarding unreadable cache record");
                remove_quiet(&path).await;
                return Ok(None);
            }
        };
        if record.key != key {
            return Ok(None);
        }
        if now_ms() >= record.expires_at_ms {
            remove_quiet(&path).await;
            return Ok(None);
        }
        Ok(Some(record.entry))
    }

    async fn set(&self, key: &str, entry: CacheEntry, ttl: Duration) -> Result<()> {
        let path = self.path_for(key);
        let record = Record {
            key: key.to_string(),
            expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
            entry,
        };
        let data = serde_json::to_vec(&record)?;

        // Write then rename so readers never observe a partial record.
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await.map_err(|e| io_error(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_quiet(&tmp).await;
            return Err(io_error(&path, e));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn clear(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        while let Some(item) = dir.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let path = item.path();
            if is_record(&path) {
                remove_quiet(&path).await;
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sweep_loop(dir: PathBuf, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match sweep_dir(&dir).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(dir = %dir.display(), removed = n, "file cache sweep"),
                    Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "file cache sweep failed"),
                }
            }
        }
    }
}

async fn sweep_dir(dir: &Path) -> Result<usize> {
    let now = now_ms();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;
    while let Some(item) = entries.next_entry().await.map_err(|e| io_error(dir, e))? {
        let path = item.path();
        if !is_record(&path) {
            continue;
        }
        let expired = match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice::<Record>(&data) {
                Ok(record) => now >= record.expires_at_ms,
                Err(_) => true,
            },
            // Deleted concurrently.
            Err(_) => false,
        };
        if expired {
            remove_quiet(&path).await;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_record(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT)
}

async fn remove_quiet(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::cache_with_context(
        e.to_string(),
        ErrorContext::new()
            .with_details(path.display().to_string())
            .with_source("file_store"),
    )
}
