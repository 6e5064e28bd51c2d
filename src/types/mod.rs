//! 类型模块：请求与响应的核心数据类型。
//!
//! # Types Module
//!
//! Value types that flow through the request pipeline.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Request`] | Method, URL, headers, body and per-call overrides |
//! | [`RequestOptions`] | Timeout / retry / cache / dedup / cancellation overrides |
//! | [`Response`] | Status, headers and a buffered, consume-once body |
//! | [`CacheStatus`] | Whether a response was served by the cache |

pub mod request;
pub mod response;

pub use request::{Request, RequestOptions};
pub use response::{CacheStatus, Response};
