//! Transport error types.
//!
//! Every error variant carries enough context to diagnose the failed
//! callback without a debugger.

/// Errors that can occur while invoking a connector callback.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Missing or invalid transport configuration.
    #[error("transport config error: {0}")]
    Config(String),

    /// The connector answered with a non-success status.
    #[error("callback '{path}' returned {status_code}: {message}")]
    Status {
        /// Connector-relative path that was called.
        path: String,
        /// HTTP status code.
        status_code: u16,
        /// Error message extracted from the body, or `HTTP <code>`.
        message: String,
    },

    /// The request timed out.
    #[error("callback '{path}' timed out")]
    Timeout { path: String },

    /// Network or HTTP client error.
    #[error("callback '{path}' network error: {reason}")]
    Network { path: String, reason: String },

    /// The response body was not valid JSON.
    #[error("callback '{path}' returned invalid JSON: {reason}")]
    Json { path: String, reason: String },
}

impl TransportError {
    /// HTTP status code, if the connector answered at all.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status_code, .. } => Some(*status_code),
            Self::Config(_) | Self::Timeout { .. } | Self::Network { .. } | Self::Json { .. } => {
                None
            }
        }
    }
}
