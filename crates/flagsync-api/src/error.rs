use thiserror::Error;

/// Top-level error type for the `flagsync-api` crate.
///
/// Covers every failure mode of the HTTP-facing layer: client construction,
/// transport, non-success responses, and event-stream framing.
/// `flagsync-core` maps these into data-source errors.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// No data arrived on an open stream within the read timeout.
    #[error("Read timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// TLS setup or HTTP client construction failed.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Responses ───────────────────────────────────────────────────
    /// The server answered with a non-success status.
    #[error("Received error {status} for {context}")]
    HttpStatus { status: u16, context: String },

    // ── Event stream ────────────────────────────────────────────────
    /// The stream body could not be read as server-sent events.
    #[error("Malformed event stream: {0}")]
    Stream(String),
}

impl Error {
    /// HTTP status associated with this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
