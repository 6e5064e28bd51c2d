//! 批处理模块：以有界并发执行一组逻辑请求。
//!
//! # Batch Execution Module
//!
//! Runs many logical requests with a caller-chosen parallelism, layered under
//! the client's admission control (effective parallelism is the smaller of
//! the two). Every item's outcome is captured on its own; one failure never
//! aborts the batch.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchRunner`] | Executes items with bounded parallelism, results in input order |
//! | [`BatchOptions`] | Caller-supplied concurrency |
//! | [`BatchResult`] | Per-item `Result`s plus [`BatchStats`] |
//!
//! ## Example
//!
//! ```rust
//! use fetchline::batch::BatchRunner;
//!
//! # async fn demo() {
//! let runner = BatchRunner::new(4);
//! let out = runner.run(1..=3, |n| async move { Ok(n * 2) }).await;
//! assert_eq!(out.stats.successful, 3);
//! # }
//! ```

mod runner;

pub use runner::{BatchOptions, BatchResult, BatchRunner, BatchStats};
