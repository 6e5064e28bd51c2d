//! Middleware and lifecycle hooks.

mod hooks;
mod middleware;

pub use hooks::{FnHook, Hook, HookContext, HookManager, HookType};
pub use middleware::{Middleware, MiddlewareChain, Next};
