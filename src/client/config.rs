//! Serializable client configuration (YAML or JSON).

use crate::cache::{CacheStrategy, MemoryStoreConfig};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::concurrency::ConcurrencyConfig;
use crate::resilience::retry::RetryPolicy;
use crate::{Error, ErrorContext, Result};
use reqwest::Method;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Either a bare in-flight cap or the full admission configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ConcurrencySetting {
    Max(usize),
    Detailed(ConcurrencyConfig),
}

impl ConcurrencySetting {
    pub fn into_config(self) -> ConcurrencyConfig {
        match self {
            ConcurrencySetting::Max(n) => ConcurrencyConfig::new().with_max(n),
            ConcurrencySetting::Detailed(cfg) => cfg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StorageSetting {
    Memory(MemoryStoreConfig),
    File {
        dir: PathBuf,
        #[serde(default, rename = "sweep_interval_ms", with = "crate::utils::serde_millis::option")]
        sweep_interval: Option<Duration>,
    },
}

impl Default for StorageSetting {
    fn default() -> Self {
        StorageSetting::Memory(MemoryStoreConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheSetting {
    pub strategy: CacheStrategy,
    #[serde(rename = "ttl_ms", with = "crate::utils::serde_millis")]
    pub ttl: Duration,
    #[serde(rename = "stale_retention_ms", with = "crate::utils::serde_millis")]
    pub stale_retention: Duration,
    pub methods: Vec<String>,
    pub storage: StorageSetting,
}

impl Default for CacheSetting {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::NetworkOnly,
            ttl: Duration::from_secs(300),
            stale_retention: Duration::ZERO,
            methods: vec!["GET".to_string()],
            storage: StorageSetting::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DedupSetting {
    pub enabled: bool,
    pub methods: Vec<String>,
}

impl Default for DedupSetting {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec!["GET".to_string(), "HEAD".to_string()],
        }
    }
}

/// Mirror of every serializable [`ClientBuilder`](super::ClientBuilder) knob.
///
/// Absent sections leave the corresponding stage out of the pipeline,
/// except `dedup`, which defaults to enabled for GET and HEAD.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    #[serde(rename = "timeout_ms", with = "crate::utils::serde_millis::option")]
    pub timeout: Option<Duration>,
    pub throw_http_errors: bool,
    pub headers: BTreeMap<String, String>,
    pub concurrency: Option<ConcurrencySetting>,
    pub cache: Option<CacheSetting>,
    pub dedup: DedupSetting,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: None,
            throw_http_errors: true,
            headers: BTreeMap::new(),
            concurrency: None,
            cache: None,
            dedup: DedupSetting::default(),
            retry: None,
            circuit_breaker: None,
        }
    }
}

impl ClientConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid YAML config: {}", e),
                ErrorContext::new().with_source("client_config"),
            )
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid JSON config: {}", e),
                ErrorContext::new().with_source("client_config"),
            )
        })
    }

    /// Load by extension: `.json` as JSON, anything else as YAML.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read config: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("client_config"),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text),
            _ => Self::from_yaml_str(&text),
        }
    }

    /// Reject values that would build a client that can never admit or
    /// retry anything.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| -> Result<()> {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new().with_source("client_config"),
            ))
        };
        if let Some(base) = &self.base_url {
            if url::Url::parse(base).is_err() {
                return invalid("base_url is not an absolute URL");
            }
        }
        if let Some(c) = &self.concurrency {
            if *c == ConcurrencySetting::Max(0) {
                return invalid("concurrency must be at least 1");
            }
            let cfg = c.clone().into_config();
            if cfg.max == Some(0) || cfg.per_target_max == Some(0) {
                return invalid("concurrency max must be at least 1");
            }
            if cfg.requests_per_interval == Some(0) || cfg.interval.is_zero() {
                return invalid("requests_per_interval and interval_ms must be positive");
            }
        }
        if let Some(r) = &self.retry {
            if r.max_attempts == 0 {
                return invalid("retry.max_attempts must be at least 1");
            }
        }
        if let Some(b) = &self.circuit_breaker {
            if b.failure_threshold == 0 {
                return invalid("circuit_breaker.failure_threshold must be at least 1");
            }
        }
        if let Some(cache) = &self.cache {
            parse_methods(&cache.methods)?;
        }
        parse_methods(&self.dedup.methods)?;
        Ok(())
    }
}

pub(crate) fn parse_methods(names: &[String]) -> Result<Vec<Method>> {
    names
        .iter()
        .map(|name| {
            Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()).map_err(|_| {
                Error::configuration_with_context(
                    format!("unknown HTTP method: {}", name),
                    ErrorContext::new().with_source("client_config"),
                )
            })
        })
        .collect()
}
