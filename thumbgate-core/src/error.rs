//! Error types for the thumbgate gateway
//!
//! Every stage of a resize request fails with a specific [`GatewayError`]
//! variant rather than a generic failure, so the HTTP layer can map each
//! one to exactly one response.
//!
//! # Error Hierarchy
//!
//! ```text
//! GatewayError
//! ├── Validation          - missing or malformed query parameters (400)
//! ├── NotAllowed          - source host rejected by the whitelist (403)
//! ├── FeatureDisabled     - optional route switched off (404)
//! ├── UnsupportedFeature  - unknown image format, size limits (500)
//! ├── Upstream            - origin answered with an error status
//! ├── Timeout             - origin did not answer in time (301)
//! ├── NotModified         - origin answered 304 (304)
//! └── Unhandled           - anything else (500)
//! ```
//!
//! [`SizeExceeded`] is raised by [`BoundedBuffer`](crate::buffer::BoundedBuffer)
//! through `std::io` and converts into `UnsupportedFeature`. A body reader
//! can likewise carry a whole `GatewayError` (such as a `Timeout`) out
//! through `std::io` with [`GatewayError::into_io`].

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::io;

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Header name to value, as sent to or received from an origin.
pub type Headers = BTreeMap<String, String>;

/// Raised when a bounded buffer would grow past its configured maximum
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("buffer may not exceed {max} bytes")]
pub struct SizeExceeded {
    pub max: u64,
}

impl SizeExceeded {
    /// Wrap into an `io::Error` so it can travel through `Read`/`Write`/`Seek`
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }

    /// Recover a `SizeExceeded` carried by an `io::Error`, if any
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<SizeExceeded>())
            .copied()
    }
}

/// Errors raised while servicing a resize request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// A required parameter is missing or a value could not be parsed
    #[error("{message}")]
    Validation { message: String },

    /// The source host does not match the domain whitelist
    #[error("Image source not allowed: {url}")]
    NotAllowed { url: String },

    /// An optional feature was requested but is disabled by configuration
    #[error("{0}")]
    FeatureDisabled(String),

    /// The input or output cannot be handled (format, size)
    #[error("{0}")]
    UnsupportedFeature(String),

    /// The origin answered with a status we cannot use
    #[error("Unable to retrieve image at {url} (status {status})")]
    Upstream {
        status: u16,
        url: String,
        request_headers: Headers,
        response_headers: Headers,
    },

    /// The origin did not answer within the fetch timeout
    #[error("Request timed out: {url}")]
    Timeout { url: String, headers: Headers },

    /// The origin reported the resource as not modified
    #[error("Upstream image not modified")]
    NotModified,

    /// Anything not covered above
    #[error("Unhandled error: {0}")]
    Unhandled(String),
}

impl GatewayError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-allowed error for the given source url
    pub fn not_allowed(url: impl Into<String>) -> Self {
        Self::NotAllowed { url: url.into() }
    }

    /// Create an unsupported-feature error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedFeature(msg.into())
    }

    /// Create an unhandled error
    pub fn unhandled(msg: impl Into<String>) -> Self {
        Self::Unhandled(msg.into())
    }

    /// Wrap into an `io::Error` so it can surface from a body reader
    pub fn into_io(self) -> io::Error {
        let kind = match self {
            Self::Timeout { .. } => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// Short type name used in structured log output
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "ValidationError",
            Self::NotAllowed { .. } => "NotAllowedError",
            Self::FeatureDisabled(_) => "FeatureDisabledError",
            Self::UnsupportedFeature(_) => "UnsupportedFeatureError",
            Self::Upstream { .. } => "UpstreamError",
            Self::Timeout { .. } => "TimeoutError",
            Self::NotModified => "NotModifiedError",
            Self::Unhandled(_) => "UnhandledError",
        }
    }

    /// Serialize the error's metadata as an ordered JSON object:
    /// type name first, then the variant's own fields, the message, and
    /// the backtrace last.
    pub fn details(&self) -> Value {
        let mut map = Map::new();
        map.insert("Type".into(), json!(self.kind_name()));
        match self {
            Self::NotAllowed { url } => {
                map.insert("Url".into(), json!(url));
            }
            Self::Upstream {
                status,
                url,
                request_headers,
                response_headers,
            } => {
                map.insert("StatusCode".into(), json!(status));
                map.insert("Url".into(), json!(url));
                map.insert("RequestHeaders".into(), json!(request_headers));
                map.insert("ResponseHeaders".into(), json!(response_headers));
            }
            Self::Timeout { url, headers } => {
                map.insert("Url".into(), json!(url));
                map.insert("Headers".into(), json!(headers));
            }
            _ => {}
        }
        map.insert("Message".into(), json!(self.to_string()));
        map.insert(
            "Backtrace".into(),
            json!(Backtrace::capture().to_string()),
        );
        Value::Object(map)
    }

    /// Human-readable line with the JSON metadata appended
    pub fn log_message(&self) -> String {
        format!("{} exception::{}", self, self.details())
    }
}

impl From<SizeExceeded> for GatewayError {
    fn from(err: SizeExceeded) -> Self {
        Self::UnsupportedFeature(format!("input exceeds configured size: {}", err))
    }
}

impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        if let Some(exceeded) = SizeExceeded::from_io(&err) {
            return exceeded.into();
        }
        match err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<GatewayError>())
        {
            Some(carried) => carried.clone(),
            None => Self::Unhandled(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::not_allowed("http://evil.com/a.png");
        assert_eq!(err.to_string(), "Image source not allowed: http://evil.com/a.png");

        let err = GatewayError::Timeout {
            url: "http://slow.com/a.png".into(),
            headers: Headers::new(),
        };
        assert_eq!(err.to_string(), "Request timed out: http://slow.com/a.png");
    }

    #[test]
    fn test_size_exceeded_survives_io_round_trip() {
        let io_err = SizeExceeded { max: 10 }.into_io();
        assert_eq!(SizeExceeded::from_io(&io_err), Some(SizeExceeded { max: 10 }));

        let err: GatewayError = io_err.into();
        assert!(matches!(err, GatewayError::UnsupportedFeature(ref m) if m.contains("10 bytes")));
    }

    #[test]
    fn test_timeout_survives_io_round_trip() {
        let timeout = GatewayError::Timeout {
            url: "http://slow.com/a.png".into(),
            headers: Headers::new(),
        };
        let io_err = timeout.clone().into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);

        let err: GatewayError = io_err.into();
        assert_eq!(err, timeout);
    }

    #[test]
    fn test_plain_io_error_is_unhandled() {
        let err: GatewayError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, GatewayError::Unhandled(_)));
    }

    #[test]
    fn test_details_order() {
        let mut response_headers = Headers::new();
        response_headers.insert("server".into(), "nginx".into());
        let err = GatewayError::Upstream {
            status: 404,
            url: "http://a.com/b.png".into(),
            request_headers: Headers::new(),
            response_headers,
        };

        let details = err.details();
        let keys: Vec<&str> = details
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        assert_eq!(keys.first(), Some(&"Type"));
        assert_eq!(keys.last(), Some(&"Backtrace"));
        assert!(keys.contains(&"StatusCode"));
        assert_eq!(details["Type"], "UpstreamError");
        assert_eq!(details["ResponseHeaders"]["server"], "nginx");
    }

    #[test]
    fn test_log_message_appends_json() {
        let err = GatewayError::validation("Url is required");
        let line = err.log_message();
        assert!(line.starts_with("Url is required exception::{"));
        assert!(line.contains("\"Type\":\"ValidationError\""));
    }
}
