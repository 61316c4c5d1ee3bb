//! Transport contracts consumed by the data-source layer.
//!
//! A [`Requests`] implementation opens push-stream connections. Everything
//! a connection reports (open, close, retry scheduling, named data events and
//! retry-or-stop questions) arrives as [`TransportEvent`]s on one ordered
//! channel held by the [`EventSourceHandle`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use reqwest::Method;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

/// Request headers, kept ordered so requests are reproducible.
pub type Headers = BTreeMap<String, String>;

// ── Failed attempts ──────────────────────────────────────────────────

/// A failed connection attempt as seen by the error filter.
///
/// `status` is `None` when the attempt failed before any HTTP response
/// (DNS, refused connection, read timeout, broken body).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpErrorResponse {
    pub status: Option<u16>,
    pub message: String,
}

impl HttpErrorResponse {
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

impl From<&Error> for HttpErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for HttpErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {status}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Whether a response status leaves room for a later attempt to succeed.
///
/// Client errors are final, except request timeouts and rate limiting.
/// Everything else (server errors, unexpected codes) is worth retrying.
pub fn is_http_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        return matches!(status, 408 | 429);
    }
    true
}

/// Shared retryability predicate for failed attempts.
pub fn should_retry(err: &HttpErrorResponse) -> bool {
    err.status.is_none_or(is_http_recoverable)
}

/// Human-readable description of a failed attempt, for logs.
pub fn http_error_message(
    err: &HttpErrorResponse,
    context: &str,
    retry_message: Option<&str>,
) -> String {
    let what = match err.status {
        Some(401) => "error 401 (invalid credential)".to_owned(),
        Some(status) => format!("error {status}"),
        None => format!("I/O error ({})", err.message),
    };
    let outcome = retry_message.unwrap_or("giving up permanently");
    format!("Received {what} for {context} - {outcome}")
}

// ── Event stream contract ────────────────────────────────────────────

/// Answer to an [`TransportEvent::ErrorFilterQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Stop,
}

impl RetryDecision {
    pub fn should_retry(self) -> bool {
        self == Self::Retry
    }
}

/// Everything a push-stream connection can report, in delivery order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A connection attempt succeeded.
    Open,
    /// An open connection ended.
    Close,
    /// The next attempt is scheduled after `delay`.
    Retrying { delay: Duration },
    /// A named server event. `data` is `None` when the event had no payload.
    Data {
        event_name: String,
        data: Option<String>,
    },
    /// An attempt failed; the transport waits on `reply` before retrying.
    /// Dropping `reply` counts as [`RetryDecision::Stop`].
    ErrorFilterQuery {
        error: HttpErrorResponse,
        reply: oneshot::Sender<RetryDecision>,
    },
}

/// Parameters for opening a push stream.
#[derive(Debug, Clone)]
pub struct EventSourceOptions {
    pub headers: Headers,
    /// Overrides the default `GET`.
    pub method: Option<Method>,
    pub body: Option<String>,
    pub initial_retry_delay: Duration,
    /// Maximum silence on an open connection before it is considered dead.
    pub read_timeout: Duration,
    /// A connection that stays up this long resets the backoff.
    pub retry_reset_interval: Duration,
}

impl Default for EventSourceOptions {
    fn default() -> Self {
        Self {
            headers: Headers::new(),
            method: None,
            body: None,
            initial_retry_delay: Duration::from_secs(1),
            read_timeout: Duration::from_secs(5 * 60),
            retry_reset_interval: Duration::from_secs(60),
        }
    }
}

/// Optional features a transport may support for push streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventSourceCapabilities {
    /// Methods other than `GET`, with a request body.
    pub custom_method: bool,
    pub read_timeout: bool,
    pub headers: bool,
}

/// Handle to one push-stream connection (including its reconnects).
///
/// Cancelling the token closes the connection; no further events are
/// delivered once the transport observes the cancellation.
#[derive(Debug)]
pub struct EventSourceHandle {
    events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
}

impl EventSourceHandle {
    pub fn new(events: mpsc::Receiver<TransportEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    pub fn into_parts(self) -> (mpsc::Receiver<TransportEvent>, CancellationToken) {
        (self.events, self.cancel)
    }
}

/// The HTTP capability the data-source layer is built on.
pub trait Requests: Send + Sync {
    fn event_source_capabilities(&self) -> EventSourceCapabilities;

    /// Open a push stream. Returns immediately; connecting happens in the
    /// background and is reported through the handle's events.
    fn create_event_source(&self, uri: Url, options: EventSourceOptions) -> EventSourceHandle;
}
