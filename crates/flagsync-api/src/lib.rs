// flagsync-api: HTTP transport for live flag delivery (push stream + one-shot poll)

pub mod error;
pub mod eventsource;
pub mod requestor;
pub mod requests;
pub mod sse;
pub mod transport;

pub use error::Error;
pub use eventsource::HttpRequests;
pub use requestor::{HttpRequestor, PayloadRequestor, report_method};
pub use requests::{
    EventSourceCapabilities, EventSourceHandle, EventSourceOptions, Headers, HttpErrorResponse,
    Requests, RetryDecision, TransportEvent, http_error_message, is_http_recoverable,
    should_retry,
};
pub use transport::{TlsMode, TransportConfig};

pub use reqwest::Method;
