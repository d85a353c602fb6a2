use thiserror::Error;

/// Crate-level error taxonomy for the relay.
///
/// The `Display` text of each variant is what ultimately reaches the browser:
/// either inside a pre-flight JSON rejection or as the single `Error: ...`
/// delta frame of an in-stream failure. Keep these short and non-technical;
/// full diagnostics go to the server log.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request carried no user message with extractable text.
    #[error("No user message found in request")]
    Validation,

    /// The upstream base URL or agent id is not configured.
    #[error("Chat backend is not configured (missing {0})")]
    Configuration(&'static str),

    /// The upstream answered with a non-2xx status (or an unreadable payload).
    #[error("Flowise error: {status} - {snippet}")]
    Upstream { status: u16, snippet: String },

    /// The upstream did not answer within the deadline.
    #[error("The assistant took too long to respond. Please try again.")]
    Timeout,

    /// Transport-level failure reaching the upstream (DNS, refused, TLS).
    #[error("Could not reach the chat backend. Please try again.")]
    Network,
}

impl RelayError {
    /// HTTP status used when the error is rejected pre-flight, before the
    /// streaming headers have been committed.
    pub fn preflight_status(&self) -> u16 {
        match self {
            RelayError::Validation => 400,
            RelayError::Configuration(_) => 500,
            RelayError::Upstream { .. } | RelayError::Timeout | RelayError::Network => 502,
        }
    }
}
