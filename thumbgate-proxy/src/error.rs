//! Mapping of [`GatewayError`] to HTTP responses.
//!
//! The mapper is an ordered chain of single-type handlers. Each handler
//! either produces a response or hands the error back unchanged, and the
//! next one gets a turn; whatever is left reaches the fallback, which
//! answers 500.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thumbgate_core::{GatewayError, Headers};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::config::GatewayConfig;

/// Body of a 404 for a switched-off feature
pub const FEATURE_DISABLED_BODY: &str =
    "The Web page you seek\ncannot be located but\nendless others exist";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// What a handler may know about the failed request
pub struct ErrorContext<'a> {
    pub suppress_diagnostics: bool,
    pub developer_mode: bool,
    /// Raw query string of the failed request
    pub query: &'a str,
}

type Handler = fn(GatewayError, &ErrorContext<'_>) -> Result<Response, GatewayError>;

const HANDLERS: &[Handler] = &[
    handle_validation,
    handle_not_allowed,
    handle_feature_disabled,
    handle_upstream,
    handle_timeout,
    handle_not_modified,
    handle_unsupported,
];

/// Converts errors into client responses
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseMapper {
    suppress_diagnostics: bool,
    developer_mode: bool,
}

impl ResponseMapper {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            suppress_diagnostics: config.suppress_error_diagnostics,
            developer_mode: config.developer_mode,
        }
    }

    /// Build the response for `err` raised while serving `query`
    pub fn respond(&self, err: GatewayError, query: &str) -> Response {
        let context = ErrorContext {
            suppress_diagnostics: self.suppress_diagnostics,
            developer_mode: self.developer_mode,
            query,
        };

        let mut err = err;
        for handler in HANDLERS {
            match handler(err, &context) {
                Ok(response) => return response,
                Err(unhandled) => err = unhandled,
            }
        }
        handle_fallback(err, &context)
    }
}

fn text(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, TEXT_PLAIN)], body).into_response()
}

/// Plain-text response whose body is dropped when diagnostics are suppressed
fn diagnostic(status: StatusCode, body: String, context: &ErrorContext<'_>) -> Response {
    if context.suppress_diagnostics {
        status.into_response()
    } else {
        text(status, body)
    }
}

fn handle_validation(err: GatewayError, context: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    let message = match err {
        GatewayError::Validation { ref message } => message.clone(),
        other => return Err(other),
    };
    warn!("{}", err.log_message());

    let pairs: Vec<(String, String)> = form_urlencoded::parse(context.query.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut body = format!("{}\n\nQuery parameters:\n", message);
    if pairs.is_empty() {
        body.push_str("  (none supplied)\n");
    } else {
        for (key, value) in &pairs {
            body.push_str(&format!("  {}: {}\n", key, value));
        }
    }
    Ok(diagnostic(StatusCode::BAD_REQUEST, body, context))
}

fn handle_not_allowed(err: GatewayError, context: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    if !matches!(err, GatewayError::NotAllowed { .. }) {
        return Err(err);
    }
    warn!("{}", err.log_message());
    Ok(diagnostic(StatusCode::FORBIDDEN, err.to_string(), context))
}

fn handle_feature_disabled(err: GatewayError, _: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    let feature = match err {
        GatewayError::FeatureDisabled(feature) => feature,
        other => return Err(other),
    };
    debug!(feature = %feature, "Disabled feature requested");
    Ok(text(StatusCode::NOT_FOUND, FEATURE_DISABLED_BODY.to_string()))
}

fn handle_upstream(err: GatewayError, context: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    let (status, request_headers, response_headers) = match err {
        GatewayError::Upstream {
            status,
            ref request_headers,
            ref response_headers,
            ..
        } => (status, request_headers.clone(), response_headers.clone()),
        other => return Err(other),
    };
    warn!("{}", err.log_message());

    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = format!(
        "{}\n\nRequest headers:\n{}\nResponse headers:\n{}",
        err,
        dump_headers(&request_headers),
        dump_headers(&response_headers)
    );
    Ok(diagnostic(status, body, context))
}

fn handle_timeout(err: GatewayError, _: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    let (url, headers) = match err {
        GatewayError::Timeout { url, headers } => (url, headers),
        other => return Err(other),
    };
    let upstream = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("x-upstream"))
        .map(|(_, value)| value.as_str())
        .unwrap_or("(Upstream unknown)");
    warn!(upstream = %upstream, "Timed out fetching {}, redirecting client to the source", url);

    Ok((
        StatusCode::MOVED_PERMANENTLY,
        [
            (header::LOCATION, url.as_str()),
            (header::CONTENT_TYPE, TEXT_PLAIN),
        ],
        "Moved",
    )
        .into_response())
}

fn handle_not_modified(err: GatewayError, _: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    if err != GatewayError::NotModified {
        return Err(err);
    }
    info!("Upstream image not modified");
    Ok(StatusCode::NOT_MODIFIED.into_response())
}

fn handle_unsupported(err: GatewayError, context: &ErrorContext<'_>) -> Result<Response, GatewayError> {
    if !matches!(err, GatewayError::UnsupportedFeature(_)) {
        return Err(err);
    }
    warn!("{}", err.log_message());
    Ok(diagnostic(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
        context,
    ))
}

fn handle_fallback(err: GatewayError, context: &ErrorContext<'_>) -> Response {
    error!(query = %context.query, "{}", err.log_message());
    if context.developer_mode {
        let details = serde_json::to_string_pretty(&err.details()).unwrap_or_else(|_| err.to_string());
        text(StatusCode::INTERNAL_SERVER_ERROR, details)
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

fn dump_headers(headers: &Headers) -> String {
    if headers.is_empty() {
        return "  (none)\n".to_string();
    }
    headers
        .iter()
        .map(|(name, value)| format!("  {}: {}\n", name, value))
        .collect()
}
