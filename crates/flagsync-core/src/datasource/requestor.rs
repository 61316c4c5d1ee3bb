// Builds the polling requestor for one context.

use flagsync_api::{HttpRequestor, TransportConfig};

use crate::config::{Encoding, PollingDataSourceConfig, query_with_reasons};
use crate::error::CoreError;

/// A requestor fetching the full payload for `plain_context`.
///
/// With `use_report` the context travels as a `REPORT` body; otherwise it is
/// encoded into the path.
pub fn make_requestor(
    plain_context: &str,
    config: &PollingDataSourceConfig,
    transport: &TransportConfig,
    encoding: &dyn Encoding,
) -> Result<HttpRequestor, CoreError> {
    let parameters = query_with_reasons(&config.query_parameters, config.with_reasons);
    let path = if config.use_report {
        config.paths.path_report(encoding, plain_context)
    } else {
        config.paths.path_get(encoding, plain_context)
    };
    let uri = config.endpoints.polling_uri(&path, &parameters);

    let requestor = HttpRequestor::from_transport(transport, uri, config.base_headers.clone())?;
    Ok(if config.use_report {
        requestor.with_report_body(plain_context.to_owned())
    } else {
        requestor
    })
}
