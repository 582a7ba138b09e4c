use crate::types::{EXIT_ERROR, EXIT_TIMEOUT, EXIT_VALIDATION};

/// Error kinds surfaced by the core command surface.
///
/// The router never leaks raw transport errors: every failure is wrapped into
/// one of these kinds, carrying the failing server name where one exists.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connect: server '{server}': {message}")]
    Connect { server: String, message: String },

    #[error("transport: server '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("protocol: server '{server}': {message}")]
    Protocol { server: String, message: String },

    #[error("tool '{tool}' on server '{server}' reported an error")]
    Tool { server: String, tool: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// Process exit code for this kind: 2 validation, 124 timeout, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => EXIT_VALIDATION,
            Self::Timeout(_) => EXIT_TIMEOUT,
            _ => EXIT_ERROR,
        }
    }

    /// Short machine-readable kind label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not-found",
            Self::Connect { .. } => "connect",
            Self::Transport { .. } => "transport",
            Self::Protocol { .. } => "protocol",
            Self::Tool { .. } => "tool-error",
            Self::Timeout(_) => "timeout",
            Self::Cancelled(_) => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}
