//! Data-source reconciliation between `flagsync-api` and a flag cache.
//!
//! This crate keeps one context's flag data current and tells observers how
//! healthy that process is:
//!
//! - **[`StreamingProcessor`]**: owns a push-stream connection. Routes named
//!   events to the caller's [`ListenerRegistry`], turns `ping` events into a
//!   one-shot poll through a [`PayloadRequestor`](flagsync_api::PayloadRequestor),
//!   and decides per failed attempt whether to reconnect or give up.
//!
//! - **[`DataSourceStatusManager`]**: the single source of truth for
//!   connection health. Applies requested [`DataSourceState`] transitions
//!   through an explicit guard table and notifies subscribers in order.
//!   [`DataSourceStatusManager::error_handler`] wires processor errors into it.
//!
//! - **Configuration** ([`config`]): endpoints, path strategies and context
//!   encoding. Built by the embedding client; this crate never reads files.
//!
//! - **[`InMemoryDiagnostics`]**: collects one record per stream connection
//!   attempt for periodic diagnostic events.

pub mod config;
pub mod datasource;
pub mod diagnostics;
pub mod error;
pub mod streaming;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{
    Base64UrlEncoding, DataSourcePaths, Encoding, PollingDataSourceConfig, PollingPaths,
    QueryParameters, ServiceEndpoints, StreamingDataSourceConfig, StreamingPaths,
};
pub use datasource::{
    DataSourceState, DataSourceStatus, DataSourceStatusManager, ListenerId, StatusErrorInfo,
    StatusListener, make_requestor, resolve_transition,
};
pub use diagnostics::{DiagnosticsRecorder, InMemoryDiagnostics, StreamInitRecord};
pub use error::{CoreError, DataSourceError, ErrorHandler, ErrorKind, ErrorOrigin};
pub use streaming::{
    EventListener, JsonListener, ListenerRegistry, PING_EVENT, PUT_EVENT, StreamPathKind,
    StreamingProcessor,
};
