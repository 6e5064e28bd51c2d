use crate::transport::TransportError;
use crate::types::Response;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Structured error context so callers can make a further retry/abort decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Number of attempts made before the error surfaced.
    pub attempts: Option<u32>,
    /// Wall-clock time spent on the logical request.
    pub elapsed: Option<Duration>,
    /// Upstream target key (usually `host:port`).
    pub target: Option<String>,
    pub method: Option<String>,
    pub url: Option<String>,
    /// Component that raised the error (e.g. "retry", "circuit_breaker", "file_store")
    pub source: Option<String>,
    pub details: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Phase of a request in which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutPhase {
    Lookup,
    Connect,
    SecureConnect,
    Socket,
    Send,
    Response,
    /// The per-attempt deadline enforced by the pipeline.
    Overall,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutPhase::Lookup => "lookup",
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::SecureConnect => "secure-connect",
            TimeoutPhase::Socket => "socket",
            TimeoutPhase::Send => "send",
            TimeoutPhase::Response => "response",
            TimeoutPhase::Overall => "overall",
        };
        f.write_str(s)
    }
}

/// Unified error type for the request-execution core.
///
/// `Error` is `Clone` so a single failed attempt can be replayed to every
/// caller that joined it through the deduplicator.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Transport error: {0}{}", format_context(.1))]
    Transport(TransportError, ErrorContext),

    #[error("Timeout during {phase} phase after {}ms{}", .elapsed.as_millis(), format_context(.context))]
    Timeout {
        phase: TimeoutPhase,
        elapsed: Duration,
        context: ErrorContext,
    },

    #[error("HTTP error: status {status}{}", format_context(.context))]
    Http {
        status: u16,
        response: Box<Response>,
        context: ErrorContext,
    },

    #[error("Circuit open for target {target}{}", format_context(.context))]
    CircuitOpen {
        target: String,
        /// Time left before the breaker admits a probe, if known.
        retry_in: Option<Duration>,
        context: ErrorContext,
    },

    #[error("Shared attempt for {key} failed: {source}")]
    DedupJoin {
        key: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Admission rejected for target {target}{}", format_context(.context))]
    AdmissionRejected {
        target: String,
        context: ErrorContext,
    },

    #[error("Request cancelled{}", format_context(.context))]
    Cancelled { context: ErrorContext },

    #[error("Cache error: {message}{}", format_context(.context))]
    Cache {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(attempts) = ctx.attempts {
        parts.push(format!("attempts: {}", attempts));
    }
    if let Some(elapsed) = ctx.elapsed {
        parts.push(format!("elapsed: {}ms", elapsed.as_millis()));
    }
    if let Some(ref target) = ctx.target {
        parts.push(format!("target: {}", target));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e, ErrorContext::new())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    pub fn http(response: Response) -> Self {
        Error::Http {
            status: response.status().as_u16(),
            response: Box::new(response),
            context: ErrorContext::new(),
        }
    }

    pub fn timeout(phase: TimeoutPhase, elapsed: Duration) -> Self {
        Error::Timeout {
            phase,
            elapsed,
            context: ErrorContext::new(),
        }
    }

    pub fn cancelled(context: ErrorContext) -> Self {
        Error::Cancelled { context }
    }

    pub fn cache_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Cache {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// HTTP status carried by the error, looking through dedup joins.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::DedupJoin { source, .. } => source.status(),
            _ => None,
        }
    }

    /// The response attached to an HTTP error, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Http { response, .. } => Some(response),
            Error::DedupJoin { source, .. } => source.response(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::DedupJoin { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled { .. } => true,
            Error::DedupJoin { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_transport(&self) -> bool {
        match self {
            Error::Transport(..) => true,
            Error::DedupJoin { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// Attempts recorded in the error context.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::DedupJoin { source, .. } => source.attempts(),
            other => other.context().and_then(|c| c.attempts),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transport(_, context)
            | Error::Timeout { context, .. }
            | Error::Http { context, .. }
            | Error::CircuitOpen { context, .. }
            | Error::AdmissionRejected { context, .. }
            | Error::Cancelled { context }
            | Error::Cache { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. } => Some(context),
            _ => None,
        }
    }

    pub fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Error::Transport(_, context)
            | Error::Timeout { context, .. }
            | Error::Http { context, .. }
            | Error::CircuitOpen { context, .. }
            | Error::AdmissionRejected { context, .. }
            | Error::Cancelled { context }
            | Error::Cache { context, .. }
            | Error::Configuration { context, .. }
            | Error::Validation { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Apply `f` to the context, when this variant carries one.
    pub fn map_context(mut self, f: impl FnOnce(&mut ErrorContext)) -> Self {
        if let Some(ctx) = self.context_mut() {
            f(ctx);
        }
        self
    }
}
