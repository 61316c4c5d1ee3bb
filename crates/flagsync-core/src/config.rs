// ── Data-source configuration ──
//
// These types describe *where* and *how* to fetch flag data for a context.
// They carry endpoints, headers and path strategies, but never touch disk.
// The embedding client builds them and hands them in.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use flagsync_api::Headers;
use url::Url;

use crate::error::CoreError;

/// Extra query parameters appended to every request URI, in order.
pub type QueryParameters = Vec<(String, String)>;

// ── Endpoints ────────────────────────────────────────────────────────

/// Base URIs for the streaming and polling services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub streaming: Url,
    pub polling: Url,
}

impl ServiceEndpoints {
    pub fn new(streaming: Url, polling: Url) -> Self {
        Self { streaming, polling }
    }

    /// Parse both base URIs.
    pub fn parse(streaming: &str, polling: &str) -> Result<Self, CoreError> {
        Ok(Self::new(parse_endpoint(streaming)?, parse_endpoint(polling)?))
    }

    pub fn streaming_uri(&self, path: &str, parameters: &[(String, String)]) -> Url {
        join_uri(&self.streaming, path, parameters)
    }

    pub fn polling_uri(&self, path: &str, parameters: &[(String, String)]) -> Url {
        join_uri(&self.polling, path, parameters)
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, CoreError> {
    let url = Url::parse(raw).map_err(|e| CoreError::InvalidEndpoint {
        url: raw.to_owned(),
        reason: e.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(CoreError::InvalidEndpoint {
            url: raw.to_owned(),
            reason: "not a base URL".into(),
        });
    }
    Ok(url)
}

/// Append `path` to the base path (keeping any base prefix) and add the
/// query parameters.
fn join_uri(base: &Url, path: &str, parameters: &[(String, String)]) -> Url {
    let mut uri = base.clone();
    let joined = format!(
        "{}/{}",
        base.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    uri.set_path(&joined);
    uri.set_query(None);
    if !parameters.is_empty() {
        let mut pairs = uri.query_pairs_mut();
        for (key, value) in parameters {
            pairs.append_pair(key, value);
        }
    }
    uri
}

// ── Encoding ─────────────────────────────────────────────────────────

/// Turns a serialized context into a string safe for URL paths.
pub trait Encoding: fmt::Debug + Send + Sync {
    fn btoa(&self, data: &str) -> String;
}

/// URL-safe base64 without padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct Base64UrlEncoding;

impl Encoding for Base64UrlEncoding {
    fn btoa(&self, data: &str) -> String {
        URL_SAFE_NO_PAD.encode(data.as_bytes())
    }
}

// ── Paths ────────────────────────────────────────────────────────────

/// Path strategy for one service.
pub trait DataSourcePaths: fmt::Debug + Send + Sync {
    /// Context embedded in the path.
    fn path_get(&self, encoding: &dyn Encoding, plain_context: &str) -> String;
    /// Context sent as the request body.
    fn path_report(&self, encoding: &dyn Encoding, plain_context: &str) -> String;
    /// Lightweight stream that only signals "new data available".
    fn path_ping(&self, encoding: &dyn Encoding, plain_context: &str) -> String;
}

/// Paths of the streaming service.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingPaths;

impl DataSourcePaths for StreamingPaths {
    fn path_get(&self, encoding: &dyn Encoding, plain_context: &str) -> String {
        format!("/meval/{}", encoding.btoa(plain_context))
    }

    fn path_report(&self, _encoding: &dyn Encoding, _plain_context: &str) -> String {
        "/meval".to_owned()
    }

    fn path_ping(&self, _encoding: &dyn Encoding, _plain_context: &str) -> String {
        "/mping".to_owned()
    }
}

/// Paths of the polling service.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingPaths;

impl DataSourcePaths for PollingPaths {
    fn path_get(&self, encoding: &dyn Encoding, plain_context: &str) -> String {
        format!("/msdk/evalx/contexts/{}", encoding.btoa(plain_context))
    }

    fn path_report(&self, _encoding: &dyn Encoding, _plain_context: &str) -> String {
        "/msdk/evalx/context".to_owned()
    }

    fn path_ping(&self, _encoding: &dyn Encoding, _plain_context: &str) -> String {
        "/mping".to_owned()
    }
}

// ── Data-source configs ──────────────────────────────────────────────

/// Configuration of the push-stream data source.
#[derive(Debug, Clone)]
pub struct StreamingDataSourceConfig {
    pub endpoints: ServiceEndpoints,
    /// Sent with every stream request (auth, user agent, tags...).
    pub base_headers: Headers,
    pub query_parameters: QueryParameters,
    /// Send the context as a `REPORT` body instead of in the URL.
    pub use_report: bool,
    /// Ask the service to include evaluation reasons.
    pub with_reasons: bool,
    /// Delay before the first reconnect; grows with backoff afterwards.
    pub initial_retry_delay: Duration,
    pub paths: Arc<dyn DataSourcePaths>,
}

impl StreamingDataSourceConfig {
    pub fn new(endpoints: ServiceEndpoints) -> Self {
        Self {
            endpoints,
            base_headers: Headers::new(),
            query_parameters: QueryParameters::new(),
            use_report: false,
            with_reasons: false,
            initial_retry_delay: Duration::from_secs(1),
            paths: Arc::new(StreamingPaths),
        }
    }
}

/// Configuration of the one-shot polling requestor.
#[derive(Debug, Clone)]
pub struct PollingDataSourceConfig {
    pub endpoints: ServiceEndpoints,
    pub base_headers: Headers,
    pub query_parameters: QueryParameters,
    pub use_report: bool,
    pub with_reasons: bool,
    pub paths: Arc<dyn DataSourcePaths>,
}

impl PollingDataSourceConfig {
    pub fn new(endpoints: ServiceEndpoints) -> Self {
        Self {
            endpoints,
            base_headers: Headers::new(),
            query_parameters: QueryParameters::new(),
            use_report: false,
            with_reasons: false,
            paths: Arc::new(PollingPaths),
        }
    }
}

/// `parameters` plus `withReasons=true` when requested.
pub(crate) fn query_with_reasons(parameters: &[(String, String)], with_reasons: bool) -> QueryParameters {
    let mut all = parameters.to_vec();
    if with_reasons {
        all.push(("withReasons".to_owned(), "true".to_owned()));
    }
    all
}
