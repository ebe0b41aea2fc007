// Backend multiplexer: typed clients over stdio JSON-RPC subprocesses and
// remote HTTP JSON-RPC endpoints, plus the registry that owns them.

pub mod client;
pub mod http;
pub mod registry;
pub mod stdio;

pub use client::BackendClient;
pub use registry::BackendRegistry;

use thiserror::Error;

/// Failure classes for a backend invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// The call did not complete within the configured deadline.
    Timeout,
    /// The process or connection failed (spawn, I/O, closed pipe, HTTP).
    Transport,
    /// The backend answered, but with an error or an unintelligible payload.
    Protocol,
    /// No backend registered under the requested key or kind.
    NotFound,
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendErrorKind::Timeout => write!(f, "timeout"),
            BackendErrorKind::Transport => write!(f, "transport"),
            BackendErrorKind::Protocol => write!(f, "protocol"),
            BackendErrorKind::NotFound => write!(f, "not found"),
        }
    }
}

/// Structured error carrying enough context to log a useful line without
/// chasing the call site.
#[derive(Debug, Clone, Error)]
#[error("backend '{backend_key}' {kind} error calling '{tool_name}': {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub backend_key: String,
    pub tool_name: String,
    pub message: String,
}

impl BackendError {
    pub fn new(
        kind: BackendErrorKind,
        backend_key: impl Into<String>,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            backend_key: backend_key.into(),
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Timeouts and transport failures are worth one retry; protocol errors
    /// are deterministic and are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            BackendErrorKind::Timeout | BackendErrorKind::Transport
        )
    }
}
