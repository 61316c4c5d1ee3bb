//! Server-sent-events client with auto-reconnect.
//!
//! [`HttpRequests`] fulfils the [`Requests`] contract over reqwest. Each
//! event source runs as a background task that connects, decodes the body
//! into named events, and on failure asks the consumer (through an
//! [`TransportEvent::ErrorFilterQuery`]) whether to try again. Retries use
//! exponential backoff + jitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use flagsync_api::{EventSourceOptions, HttpRequests, Requests, TransportConfig, TransportEvent};
//!
//! let requests = HttpRequests::new(&TransportConfig::default())?;
//! let handle = requests.create_event_source(uri, EventSourceOptions::default());
//! let (mut events, cancel) = handle.into_parts();
//!
//! while let Some(event) = events.recv().await {
//!     if let TransportEvent::Data { event_name, data } = event {
//!         println!("{event_name}: {data:?}");
//!     }
//! }
//! ```

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Method;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::requests::{
    EventSourceCapabilities, EventSourceHandle, EventSourceOptions, HttpErrorResponse,
    Requests, RetryDecision, TransportEvent,
};
use crate::sse::SseDecoder;
use crate::transport::TransportConfig;

// ── Channel capacity ─────────────────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on backoff delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// ── HttpRequests ─────────────────────────────────────────────────────

/// reqwest-backed push-stream transport.
#[derive(Debug, Clone)]
pub struct HttpRequests {
    http: reqwest::Client,
    max_retry_delay: Duration,
}

impl HttpRequests {
    /// Build the transport with a streaming client from `transport`.
    pub fn new(transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self::with_client(transport.build_streaming_client()?))
    }

    /// Use a pre-built client. It must not carry a total request timeout.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            max_retry_delay: MAX_RETRY_DELAY,
        }
    }

    /// Override the backoff ceiling.
    pub fn with_max_retry_delay(mut self, max_retry_delay: Duration) -> Self {
        self.max_retry_delay = max_retry_delay;
        self
    }
}

impl Requests for HttpRequests {
    fn event_source_capabilities(&self) -> EventSourceCapabilities {
        EventSourceCapabilities {
            custom_method: true,
            read_timeout: true,
            headers: true,
        }
    }

    /// Spawns the connection loop; must be called inside a tokio runtime.
    fn create_event_source(&self, uri: Url, options: EventSourceOptions) -> EventSourceHandle {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let task = StreamTask {
            http: self.http.clone(),
            uri,
            options,
            max_retry_delay: self.max_retry_delay,
            events,
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run());

        EventSourceHandle::new(rx, cancel)
    }
}

// ── Background reconnection loop ─────────────────────────────────────

struct StreamTask {
    http: reqwest::Client,
    uri: Url,
    options: EventSourceOptions,
    max_retry_delay: Duration,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

/// State carried across reconnects of one event source.
#[derive(Debug, Default)]
struct Session {
    last_event_id: Option<String>,
    server_retry: Option<Duration>,
    opened_at: Option<Instant>,
}

impl StreamTask {
    /// Main loop: connect → read → on failure, ask the filter → backoff → reconnect.
    async fn run(self) {
        let mut session = Session::default();
        let mut attempt: u32 = 0;

        loop {
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                result = self.connect_and_read(&mut session) => result,
            };

            let failure = match outcome {
                Ok(()) => HttpErrorResponse::network("event stream ended"),
                Err(e) => HttpErrorResponse::from(&e),
            };

            if session
                .opened_at
                .take()
                .is_some_and(|opened| opened.elapsed() >= self.options.retry_reset_interval)
            {
                attempt = 0;
            }

            tracing::debug!(error = %failure, attempt, "Event stream attempt failed");

            let (reply, decision) = oneshot::channel();
            let query = TransportEvent::ErrorFilterQuery {
                error: failure,
                reply,
            };
            if self.events.send(query).await.is_err() {
                break;
            }

            let decision = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                decision = decision => decision.unwrap_or(RetryDecision::Stop),
            };
            if !decision.should_retry() {
                tracing::debug!("Error filter declined retry, closing event stream");
                break;
            }

            let base = session
                .server_retry
                .unwrap_or(self.options.initial_retry_delay);
            let delay = calculate_backoff(attempt, base, self.max_retry_delay);
            if self
                .events
                .send(TransportEvent::Retrying { delay })
                .await
                .is_err()
            {
                break;
            }

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }

            attempt = attempt.saturating_add(1);
        }

        tracing::debug!(uri = %self.uri, "Event source loop exiting");
    }

    // ── Single connection lifecycle ──────────────────────────────────

    /// Open one connection and forward events until it drops.
    ///
    /// `Ok(())` means the server ended the body cleanly.
    async fn connect_and_read(&self, session: &mut Session) -> Result<(), Error> {
        tracing::debug!(uri = %self.uri, "Connecting to event stream");

        let method = self.options.method.clone().unwrap_or(Method::GET);
        let mut request = self
            .http
            .request(method, self.uri.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(id) = &session.last_event_id {
            request = request.header("last-event-id", id.as_str());
        }
        if let Some(body) = &self.options.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                context: "event stream".into(),
            });
        }

        session.opened_at = Some(Instant::now());
        self.emit(TransportEvent::Open).await?;

        let result = self.read_body(response, session).await;
        // The receiver may already be gone; the loop notices on its next send.
        let _ = self.events.send(TransportEvent::Close).await;
        result
    }

    async fn read_body(
        &self,
        response: reqwest::Response,
        session: &mut Session,
    ) -> Result<(), Error> {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = match tokio::time::timeout(self.options.read_timeout, body.next()).await {
                Err(_) => {
                    return Err(Error::Timeout {
                        timeout_ms: duration_millis(self.options.read_timeout),
                    });
                }
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            for event in decoder.push(&chunk) {
                self.emit(TransportEvent::Data {
                    event_name: event.event,
                    data: event.data,
                })
                .await?;
            }

            if let Some(id) = decoder.last_event_id() {
                session.last_event_id = Some(id.to_owned());
            }
            if let Some(retry) = decoder.retry() {
                session.server_retry = Some(retry);
            }
        }
    }

    async fn emit(&self, event: TransportEvent) -> Result<(), Error> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::Stream("event receiver dropped".into()))
    }
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(base * 2^attempt, max) * jitter`, with jitter in `[0.75, 1.0]`
/// so the ceiling is never exceeded.
fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt.min(31)).unwrap_or(31);
    let raw = base.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = raw.min(max.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    // Not cryptographically random, but good enough for backoff spread.
    let jitter_factor = 1.0 - 0.125 * (1.0 + (f64::from(attempt) * 7.3).sin());

    Duration::from_secs_f64((capped * jitter_factor).max(0.0))
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_increases_exponentially() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        let d0 = calculate_backoff(0, base, max);
        let d1 = calculate_backoff(1, base, max);
        let d3 = calculate_backoff(3, base, max);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d3 > d1, "d3 ({d3:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_never_exceeds_max_delay() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);

        for attempt in 0..64 {
            let delay = calculate_backoff(attempt, base, max);
            assert!(delay <= max, "attempt {attempt}: {delay:?} exceeds {max:?}");
        }
    }

    #[test]
    fn backoff_stays_within_jitter_band() {
        let base = Duration::from_secs(1);
        let delay = calculate_backoff(0, base, Duration::from_secs(30));
        assert!(delay >= Duration::from_millis(750));
        assert!(delay <= base);
    }

    #[test]
    fn http_transport_supports_custom_methods() {
        let requests = HttpRequests::with_client(reqwest::Client::new());
        assert!(requests.event_source_capabilities().custom_method);
    }
}
