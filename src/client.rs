//! Client facade over the request pipeline.
//!
//! Keep the public surface small and predictable. Implementation details are
//! split into submodules under `src/client/`.

pub mod builder;
pub mod config;
pub mod core;
pub mod signals;

pub use builder::ClientBuilder;
pub use config::{CacheSetting, ClientConfig, ConcurrencySetting, DedupSetting, StorageSetting};
pub use core::Client;
pub use signals::SignalsSnapshot;
