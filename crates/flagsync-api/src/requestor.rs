// One-shot payload requests.
//
// A `PayloadRequestor` fetches the complete current payload for one context
// in a single request/response exchange. The data-source layer uses it when a
// push stream signals that new data is available without carrying it.

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, trace};
use url::Url;

use crate::error::Error;
use crate::requests::Headers;
use crate::transport::TransportConfig;

/// Fetches the complete current payload as raw JSON text.
#[async_trait]
pub trait PayloadRequestor: Send + Sync {
    /// Fails with [`Error::HttpStatus`] for non-success responses, or a
    /// transport error when no response arrived.
    async fn request_payload(&self) -> Result<String, Error>;
}

/// reqwest-backed [`PayloadRequestor`] bound to one URI.
#[derive(Debug, Clone)]
pub struct HttpRequestor {
    http: reqwest::Client,
    uri: Url,
    method: Method,
    headers: Headers,
    body: Option<String>,
}

impl HttpRequestor {
    /// A `GET` requestor.
    pub fn new(http: reqwest::Client, uri: Url, headers: Headers) -> Self {
        Self {
            http,
            uri,
            method: Method::GET,
            headers,
            body: None,
        }
    }

    /// A `GET` requestor with a polling client built from `transport`.
    pub fn from_transport(
        transport: &TransportConfig,
        uri: Url,
        headers: Headers,
    ) -> Result<Self, Error> {
        Ok(Self::new(transport.build_polling_client()?, uri, headers))
    }

    /// Switch to a `REPORT` request carrying `body` as JSON.
    pub fn with_report_body(mut self, body: String) -> Self {
        self.method = report_method();
        self.headers
            .insert(CONTENT_TYPE.as_str().to_owned(), "application/json".to_owned());
        self.body = Some(body);
        self
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn method(&self) -> &Method {
        &self.method
    }
}

#[async_trait]
impl PayloadRequestor for HttpRequestor {
    async fn request_payload(&self) -> Result<String, Error> {
        debug!(method = %self.method, uri = %self.uri, "Requesting payload");

        let mut request = self
            .http
            .request(self.method.clone(), self.uri.clone())
            .header(ACCEPT, "application/json");
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                context: "polling request".into(),
            });
        }

        let text = response.text().await?;
        trace!(bytes = text.len(), "Payload received");
        Ok(text)
    }
}

/// The `REPORT` extension method (RFC 3253).
pub fn report_method() -> Method {
    // A static, valid token: parsing cannot fail.
    Method::from_bytes(b"REPORT").unwrap_or(Method::POST)
}
