//! Push-stream lifecycle for one context.
//!
//! A [`StreamingProcessor`] opens one event source through the injected
//! [`Requests`] transport and dispatches everything the connection reports:
//! named data events go to the listener registry, `ping` events trigger a
//! one-shot poll whose result is fed to the `put` listener, and failed
//! attempts are answered with a retry decision.
//!
//! Dispatch runs on a spawned task that owns the connection's event channel,
//! so [`StreamingProcessor::start`] returns immediately. It must be called
//! from within a tokio runtime.

pub mod listeners;

use std::sync::Arc;
use std::time::Duration;

use flagsync_api::{
    EventSourceCapabilities, EventSourceOptions, Headers, HttpErrorResponse, PayloadRequestor,
    Requests, RetryDecision, TransportEvent, http_error_message, report_method, should_retry,
};
use serde_json::Value;
use strum::Display;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{Encoding, StreamingDataSourceConfig, query_with_reasons};
use crate::diagnostics::DiagnosticsRecorder;
use crate::error::{DataSourceError, ErrorHandler, ErrorKind};

pub use listeners::{EventListener, JsonListener, ListenerRegistry, is_falsy};

/// Payload-less signal: new data is available through polling.
pub const PING_EVENT: &str = "ping";
/// Full payload replacement.
pub const PUT_EVENT: &str = "put";

/// Silence on an open connection after which it is considered dead.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// A connection that stays up this long resets the reconnect backoff.
pub const RETRY_RESET_INTERVAL: Duration = Duration::from_secs(60);

const STREAMING_CONTEXT: &str = "streaming request";

// ── Path resolution ──────────────────────────────────────────────────

/// Which stream endpoint a processor connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum StreamPathKind {
    /// Context encoded into the URL.
    Get,
    /// Context sent as a `REPORT` body.
    Report,
    /// Ping-only stream; payloads are polled.
    Ping,
}

impl StreamPathKind {
    pub fn resolve(use_report: bool, capabilities: EventSourceCapabilities) -> Self {
        match (use_report, capabilities.custom_method) {
            (true, false) => Self::Ping,
            (true, true) => Self::Report,
            (false, _) => Self::Get,
        }
    }
}

// ── Built-in handlers ────────────────────────────────────────────────

/// Events handled by the processor itself, ahead of the caller's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinEvent {
    Ping,
}

const BUILTIN_EVENTS: &[(&str, BuiltinEvent)] = &[(PING_EVENT, BuiltinEvent::Ping)];

fn builtin_event(event_name: &str) -> Option<BuiltinEvent> {
    BUILTIN_EVENTS
        .iter()
        .find(|(name, _)| *name == event_name)
        .map(|(_, builtin)| *builtin)
}

// ── StreamingProcessor ───────────────────────────────────────────────

/// Owns the push-stream connection for one context.
pub struct StreamingProcessor {
    plain_context: String,
    stream_uri: Url,
    path_kind: StreamPathKind,
    use_report: bool,
    base_headers: Headers,
    initial_retry_delay: Duration,
    listeners: Arc<ListenerRegistry>,
    requests: Arc<dyn Requests>,
    requestor: Arc<dyn PayloadRequestor>,
    diagnostics: Option<Arc<dyn DiagnosticsRecorder>>,
    error_handler: Option<ErrorHandler>,
    connection: Option<CancellationToken>,
}

impl StreamingProcessor {
    /// The stream URI and path are fixed here and never re-evaluated.
    pub fn new(
        plain_context: impl Into<String>,
        config: &StreamingDataSourceConfig,
        listeners: Arc<ListenerRegistry>,
        requests: Arc<dyn Requests>,
        encoding: &dyn Encoding,
        requestor: Arc<dyn PayloadRequestor>,
    ) -> Self {
        let plain_context = plain_context.into();
        let path_kind =
            StreamPathKind::resolve(config.use_report, requests.event_source_capabilities());
        let path = match path_kind {
            StreamPathKind::Get => config.paths.path_get(encoding, &plain_context),
            StreamPathKind::Report => config.paths.path_report(encoding, &plain_context),
            StreamPathKind::Ping => config.paths.path_ping(encoding, &plain_context),
        };
        let parameters = query_with_reasons(&config.query_parameters, config.with_reasons);
        let stream_uri = config.endpoints.streaming_uri(&path, &parameters);

        Self {
            plain_context,
            stream_uri,
            path_kind,
            use_report: config.use_report,
            base_headers: config.base_headers.clone(),
            initial_retry_delay: config.initial_retry_delay,
            listeners,
            requests,
            requestor,
            diagnostics: None,
            error_handler: None,
            connection: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsRecorder>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_error_handler(mut self, error_handler: ErrorHandler) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    pub fn stream_uri(&self) -> &Url {
        &self.stream_uri
    }

    pub fn path_kind(&self) -> StreamPathKind {
        self.path_kind
    }

    pub fn is_started(&self) -> bool {
        self.connection.is_some()
    }

    /// Open the stream. A connection from an earlier `start` is closed first.
    pub fn start(&mut self) {
        self.stop();

        let mut session = self.new_session();
        session.log_connection_started();

        let mut options = EventSourceOptions {
            headers: self.base_headers.clone(),
            initial_retry_delay: self.initial_retry_delay,
            read_timeout: READ_TIMEOUT,
            retry_reset_interval: RETRY_RESET_INTERVAL,
            ..EventSourceOptions::default()
        };
        // Transports without custom-method support ignore method and body.
        if self.use_report {
            options
                .headers
                .insert("content-type".to_owned(), "application/json".to_owned());
            options.method = Some(report_method());
            options.body = Some(self.plain_context.clone());
        }

        info!(uri = %self.stream_uri, path = %self.path_kind, "Opening stream connection");
        let handle = self
            .requests
            .create_event_source(self.stream_uri.clone(), options);
        let (events, cancel) = handle.into_parts();
        session.cancel = cancel.clone();
        self.connection = Some(cancel);

        tokio::spawn(session.run(events));
    }

    /// Close the connection, if any. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if let Some(connection) = self.connection.take() {
            debug!(uri = %self.stream_uri, "Stopping stream connection");
            connection.cancel();
        }
    }

    pub fn close(&mut self) {
        self.stop();
    }

    fn new_session(&self) -> StreamSession {
        StreamSession {
            listeners: Arc::clone(&self.listeners),
            requestor: Arc::clone(&self.requestor),
            diagnostics: self.diagnostics.clone(),
            error_handler: self.error_handler.clone(),
            cancel: CancellationToken::new(),
            attempt_started_at: None,
        }
    }
}

impl Drop for StreamingProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StreamingProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingProcessor")
            .field("stream_uri", &self.stream_uri.as_str())
            .field("path_kind", &self.path_kind)
            .field("started", &self.is_started())
            .finish_non_exhaustive()
    }
}

// ── Per-connection dispatch ──────────────────────────────────────────

/// State of one started connection, owned by its dispatch task.
struct StreamSession {
    listeners: Arc<ListenerRegistry>,
    requestor: Arc<dyn PayloadRequestor>,
    diagnostics: Option<Arc<dyn DiagnosticsRecorder>>,
    error_handler: Option<ErrorHandler>,
    cancel: CancellationToken,
    /// Epoch millis of the pending attempt; cleared once its outcome is recorded.
    attempt_started_at: Option<i64>,
}

impl StreamSession {
    async fn run(mut self, mut events: mpsc::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event);
        }
        debug!("Stream dispatch ended");
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => info!("Opened stream connection"),
            TransportEvent::Close => info!("Closed stream connection"),
            TransportEvent::Retrying { delay } => {
                info!("Will retry stream connection in {} milliseconds", delay.as_millis());
            }
            TransportEvent::Data { event_name, data } => self.handle_data(&event_name, data),
            TransportEvent::ErrorFilterQuery { error, reply } => {
                let decision = self.retry_and_handle_error(&error);
                // The transport may already be gone; nothing to answer then.
                let _ = reply.send(decision);
            }
        }
    }

    fn handle_data(&mut self, event_name: &str, data: Option<String>) {
        debug!(event = event_name, "Received stream event");

        if let Some(builtin) = builtin_event(event_name) {
            match builtin {
                BuiltinEvent::Ping => {
                    self.log_connection_result(true);
                    self.spawn_ping_poll();
                }
            }
            return;
        }

        let Some(listener) = self.listeners.get(event_name) else {
            debug!(event = event_name, "No listener registered, ignoring event");
            return;
        };

        let Some(data) = data.filter(|data| !data.is_empty()) else {
            error!(event = event_name, "Unexpected payload from event stream");
            self.report(DataSourceError::streaming(
                ErrorKind::InvalidData,
                "Unexpected payload from event stream",
            ));
            return;
        };

        self.log_connection_result(true);
        match listener
            .deserialize_data(&data)
            .filter(|json| !is_falsy(json))
        {
            Some(json) => listener.process_json(json),
            None => {
                error!(event = event_name, "Received invalid data from event stream");
                debug!(event = event_name, payload = %data, "Invalid stream payload");
                self.report(DataSourceError::streaming(
                    ErrorKind::InvalidData,
                    "Malformed JSON data in event stream",
                ));
            }
        }
    }

    /// Answer an error-filter query: retry transient failures, give up on
    /// the rest and report them as unrecoverable.
    fn retry_and_handle_error(&mut self, err: &HttpErrorResponse) -> RetryDecision {
        self.log_connection_result(false);

        if !should_retry(err) {
            self.report(
                DataSourceError::streaming(ErrorKind::ErrorResponse, err.message.clone())
                    .with_status(err.status)
                    .unrecoverable(),
            );
            error!("{}", http_error_message(err, STREAMING_CONTEXT, None));
            return RetryDecision::Stop;
        }

        warn!("{}", http_error_message(err, STREAMING_CONTEXT, Some("will retry")));
        self.log_connection_started();
        RetryDecision::Retry
    }

    /// Fetch the full payload and hand it to the `put` listener. A poll
    /// still running when the stream stops is abandoned.
    fn spawn_ping_poll(&self) {
        let poll = PingPoll {
            listeners: Arc::clone(&self.listeners),
            error_handler: self.error_handler.clone(),
        };
        let requestor = Arc::clone(&self.requestor);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Stream stopped, discarding in-flight poll");
                    return;
                }
                result = requestor.request_payload() => result,
            };
            poll.deliver(result);
        });
    }

    fn log_connection_started(&mut self) {
        self.attempt_started_at = Some(now_millis());
    }

    /// Record the pending attempt's outcome, at most once per attempt.
    fn log_connection_result(&mut self, success: bool) {
        let Some(started_at) = self.attempt_started_at.take() else {
            return;
        };
        if let Some(diagnostics) = &self.diagnostics {
            let elapsed = u64::try_from(now_millis() - started_at).unwrap_or(0);
            diagnostics.record_stream_init(started_at, !success, elapsed);
        }
    }

    fn report(&self, err: DataSourceError) {
        if let Some(handler) = &self.error_handler {
            handler(err);
        }
    }
}

/// Delivery side of a ping-triggered poll.
struct PingPoll {
    listeners: Arc<ListenerRegistry>,
    error_handler: Option<ErrorHandler>,
}

impl PingPoll {
    fn deliver(&self, result: Result<String, flagsync_api::Error>) {
        let payload = match result {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "Polling request after ping failed");
                self.report(
                    DataSourceError::polling(ErrorKind::ErrorResponse, err.to_string())
                        .with_status(err.status()),
                );
                return;
            }
        };

        match serde_json::from_str::<Value>(&payload) {
            Ok(json) => match self.listeners.get(PUT_EVENT) {
                Some(listener) => listener.process_json(json),
                None => debug!("No put listener registered, dropping polled payload"),
            },
            Err(err) => {
                error!(error = %err, "Polling response after ping was not valid JSON");
                debug!(payload = %payload, "Invalid polling payload");
                self.report(DataSourceError::polling(
                    ErrorKind::InvalidData,
                    "Malformed JSON data in polling response",
                ));
            }
        }
    }

    fn report(&self, err: DataSourceError) {
        if let Some(handler) = &self.error_handler {
            handler(err);
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tracing_test::traced_test;

    use super::*;
    use crate::diagnostics::InMemoryDiagnostics;

    struct NeverRequestor;

    #[async_trait]
    impl PayloadRequestor for NeverRequestor {
        async fn request_payload(&self) -> Result<String, flagsync_api::Error> {
            std::future::pending().await
        }
    }

    fn session() -> (StreamSession, Arc<Mutex<Vec<DataSourceError>>>, Arc<InMemoryDiagnostics>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let diagnostics = Arc::new(InMemoryDiagnostics::new());
        let session = StreamSession {
            listeners: Arc::new(ListenerRegistry::new()),
            requestor: Arc::new(NeverRequestor),
            diagnostics: Some(Arc::clone(&diagnostics) as Arc<dyn DiagnosticsRecorder>),
            error_handler: Some(Arc::new(move |err: DataSourceError| sink.lock().unwrap().push(err))),
            cancel: CancellationToken::new(),
            attempt_started_at: None,
        };
        (session, errors, diagnostics)
    }

    #[test]
    fn path_kind_falls_back_to_ping_without_custom_method() {
        let plain = EventSourceCapabilities::default();
        let custom = EventSourceCapabilities {
            custom_method: true,
            ..plain
        };
        assert_eq!(StreamPathKind::resolve(true, plain), StreamPathKind::Ping);
        assert_eq!(StreamPathKind::resolve(true, custom), StreamPathKind::Report);
        assert_eq!(StreamPathKind::resolve(false, plain), StreamPathKind::Get);
        assert_eq!(StreamPathKind::resolve(false, custom), StreamPathKind::Get);
    }

    #[test]
    fn only_ping_is_builtin() {
        assert_eq!(builtin_event("ping"), Some(BuiltinEvent::Ping));
        assert_eq!(builtin_event("put"), None);
        assert_eq!(builtin_event("patch"), None);
    }

    #[test]
    #[traced_test]
    fn server_error_is_retried_with_warning() {
        let (mut session, errors, _) = session();

        let decision =
            session.retry_and_handle_error(&HttpErrorResponse::with_status(500, "internal"));

        assert_eq!(decision, RetryDecision::Retry);
        assert!(errors.lock().unwrap().is_empty());
        assert!(logs_contain("Received error 500 for streaming request - will retry"));
    }

    #[test]
    #[traced_test]
    fn client_error_gives_up_and_reports_unrecoverable() {
        let (mut session, errors, _) = session();

        let decision =
            session.retry_and_handle_error(&HttpErrorResponse::with_status(400, "bad request"));

        assert_eq!(decision, RetryDecision::Stop);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::ErrorResponse);
        assert_eq!(errors[0].status_code, Some(400));
        assert!(!errors[0].recoverable);
        assert!(logs_contain("giving up permanently"));
    }

    #[test]
    fn each_attempt_is_recorded_once() {
        let (mut session, _, diagnostics) = session();
        session.log_connection_started();

        session.retry_and_handle_error(&HttpErrorResponse::network("connection reset"));
        session.log_connection_result(true);
        session.log_connection_result(true);

        let records = diagnostics.take_stream_inits();
        assert_eq!(records.len(), 2);
        assert!(records[0].failed);
        assert!(!records[1].failed);
    }

    #[test]
    #[traced_test]
    fn missing_data_is_reported_without_processing() {
        let (mut session, errors, diagnostics) = session();
        let processed = Arc::new(Mutex::new(0_u32));
        let counter = Arc::clone(&processed);
        session.listeners.insert(
            "patch",
            Arc::new(JsonListener::new(move |_| *counter.lock().unwrap() += 1)),
        );
        session.log_connection_started();

        session.handle_data("patch", None);
        session.handle_data("patch", Some(String::new()));

        assert_eq!(*processed.lock().unwrap(), 0);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::InvalidData));
        assert!(diagnostics.take_stream_inits().is_empty());
    }

    #[test]
    #[traced_test]
    fn unknown_event_is_ignored() {
        let (mut session, errors, _) = session();

        session.handle_data("delete", Some("{}".into()));

        assert!(errors.lock().unwrap().is_empty());
        assert!(logs_contain("No listener registered"));
    }
}
