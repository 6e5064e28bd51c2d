//! Bounded-parallelism batch runner.

use crate::Result;
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Items in flight at once. Layered under the client's own admission cap.
    pub concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { concurrency: 5 }
    }
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration: Duration,
}

impl BatchStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

/// Per-item outcomes in input order, plus aggregate stats.
#[derive(Debug)]
pub struct BatchResult<T> {
    pub results: Vec<Result<T>>,
    pub stats: BatchStats,
}

impl<T> BatchResult<T> {
    pub fn all_succeeded(&self) -> bool {
        self.stats.failed == 0
    }

    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().ok().map(|v| (i, v)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &crate::Error)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
    }
}

pub struct BatchRunner {
    concurrency: usize,
}

impl BatchRunner {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `f` over every item with at most `concurrency` in flight.
    ///
    /// A failing item never aborts the others.
    pub async fn run<I, T, F, Fut>(&self, items: I, f: F) -> BatchResult<T>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut indexed: Vec<(usize, Result<T>)> = stream::iter(items.into_iter().enumerate())
            .map(|(i, item)| {
                let fut = f(item);
                async move { (i, fut.await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);

        let results: Vec<Result<T>> = indexed.into_iter().map(|(_, r)| r).collect();
        let successful = results.iter().filter(|r| r.is_ok()).count();
        let stats = BatchStats {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            duration: start.elapsed(),
        };
        tracing::info!(
            total = stats.total,
            successful = stats.successful,
            failed = stats.failed,
            duration_ms = stats.duration.as_millis() as u64,
            "batch complete"
        );
        BatchResult { results, stats }
    }
}
