/// Error types for the embedder bridge.
///
/// Every variant is rendered into the process-wide last-error channel before a
/// sentinel value crosses the C boundary, so the `Display` text is what host
/// bindings end up raising.
use thiserror::Error;

/// Errors that can occur while loading, initializing, or invoking an engine.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to load shared library {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("failed to load {symbol} function from {path}: {reason}")]
    MissingSymbol {
        path: String,
        symbol: &'static str,
        reason: String,
    },

    #[error("unknown library handle {0}, use load_library first")]
    UnknownLibrary(u64),

    #[error("unknown embedder handle {0}")]
    UnknownEmbedder(u64),

    #[error("failed to initialize embedder: {0}")]
    InitFailed(String),

    #[error("{operation} failed: {reason}")]
    Invocation {
        operation: &'static str,
        reason: String,
    },

    #[error("{0} is not supported by the loaded engine")]
    Unsupported(&'static str),

    #[error("failed to allocate {0}")]
    Allocation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("registry lock poisoned: {0}")]
    Poisoned(String),

    #[error("logging setup failed: {0}")]
    Logging(String),
}

impl BridgeError {
    pub(crate) fn invocation(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Invocation {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
