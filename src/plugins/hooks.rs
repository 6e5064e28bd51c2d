//! Hook system.
//!
//! Hooks observe the request lifecycle. Only `BeforeRequest` can influence
//! control flow (an error aborts the request); failures of every other hook
//! are logged and dropped.

use crate::resilience::retry::RetryEvent;
use crate::types::Request;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookType {
    BeforeRequest,
    AfterResponse,
    OnError,
    OnRetry,
    OnCacheHit,
    OnCacheMiss,
    OnCircuitOpen,
}

#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub request_id: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub target: Option<String>,
    pub status: Option<u16>,
    pub error: Option<Error>,
    pub attempt: Option<u32>,
    pub delay: Option<Duration>,
    pub cache_key: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    skip: bool,
}

impl HookContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_request(request: &Request) -> Self {
        Self {
            request_id: Some(request.id.clone()),
            method: Some(request.method.to_string()),
            url: Some(request.url.to_string()),
            target: Some(request.target_key()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, error: Error) -> Self {
        self.status = error.status();
        self.error = Some(error);
        self
    }

    pub fn with_retry(mut self, event: &RetryEvent) -> Self {
        self.attempt = Some(event.attempt);
        self.delay = Some(event.delay);
        self.error = Some(event.error.clone());
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    /// Stop the remaining hooks of this trigger from running.
    pub fn skip(&mut self) {
        self.skip = true;
    }

    pub fn should_skip(&self) -> bool {
        self.skip
    }
}

pub trait Hook: Send + Sync {
    fn call(&self, ctx: &mut HookContext) -> Result<()>;
}

pub struct FnHook<F> {
    func: F,
}

impl<F> FnHook<F>
where
    F: Fn(&mut HookContext) -> Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(&mut HookContext) -> Result<()> + Send + Sync,
{
    fn call(&self, ctx: &mut HookContext) -> Result<()> {
        (self.func)(ctx)
    }
}

struct Registered {
    name: String,
    priority: i32,
    callback: Arc<dyn Hook>,
}

/// Named, prioritized hooks per lifecycle point. Lower priority runs first.
#[derive(Default)]
pub struct HookManager {
    hooks: RwLock<HashMap<HookType, Vec<Registered>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Hook + 'static>(
        &self,
        hook_type: HookType,
        name: impl Into<String>,
        priority: i32,
        hook: H,
    ) {
        let mut hooks = self.write();
        let entry = hooks.entry(hook_type).or_default();
        entry.push(Registered {
            name: name.into(),
            priority,
            callback: Arc::new(hook),
        });
        entry.sort_by_key(|h| h.priority);
    }

    pub fn register_fn<F>(&self, hook_type: HookType, name: impl Into<String>, priority: i32, func: F)
    where
        F: Fn(&mut HookContext) -> Result<()> + Send + Sync + 'static,
    {
        self.register(hook_type, name, priority, FnHook::new(func));
    }

    pub fn unregister(&self, hook_type: HookType, name: &str) -> bool {
        let mut hooks = self.write();
        match hooks.get_mut(&hook_type) {
            Some(entry) => {
                let len = entry.len();
                entry.retain(|h| h.name != name);
                entry.len() < len
            }
            None => false,
        }
    }

    /// Run the hooks for `hook_type`, stopping at the first error.
    pub fn trigger(&self, hook_type: HookType, ctx: &mut HookContext) -> Result<()> {
        // Snapshot so hooks may register or unregister without deadlocking.
        let callbacks: Vec<Arc<dyn Hook>> = self
            .read()
            .get(&hook_type)
            .map(|v| v.iter().map(|h| h.callback.clone()).collect())
            .unwrap_or_default();
        for cb in callbacks {
            if ctx.should_skip() {
                break;
            }
            cb.call(ctx)?;
        }
        Ok(())
    }

    /// Fire-and-forget variant of [`trigger`](Self::trigger).
    pub fn emit(&self, hook_type: HookType, mut ctx: HookContext) {
        if self.count(hook_type) == 0 {
            return;
        }
        if let Err(e) = self.trigger(hook_type, &mut ctx) {
            tracing::debug!(hook = ?hook_type, error = %e, "hook failed");
        }
    }

    pub fn count(&self, hook_type: HookType) -> usize {
        self.read().get(&hook_type).map(|v| v.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<HookType, Vec<Registered>>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<HookType, Vec<Registered>>> {
        self.hooks.write().unwrap_or_else(|e| e.into_inner())
    }
}
