//! Upstream image fetching.
//!
//! Each attempt is bounded by the configured fetch timeout; failed attempts
//! are retried after a short fixed backoff until `max_url_fetch_retries`
//! extra attempts have been spent. A successful body is not read here: it
//! is wrapped in a [`BoundedBuffer`] that pulls from the connection lazily
//! and refuses to grow past `max_input_image_size`. The fetch timeout also
//! covers that later body read; running out of time there surfaces from the
//! reader as [`GatewayError::Timeout`].

use std::io::{self, Read};
use std::time::{Duration, Instant};

use axum::http::{
    header::{ACCEPT, CONNECTION, HOST, LOCATION, ORIGIN, REFERER},
    HeaderMap, HeaderName, HeaderValue,
};
use futures::TryStreamExt;
use reqwest::{Client, Response};
use thumbgate_core::{BoundedBuffer, GatewayError, Headers, SizeExceeded};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::metrics;

/// Blocking reader over an upstream response body
pub type SourceReader = Box<dyn Read + Send>;

/// Size-capped, seekable view of an upstream response body
pub type SourceBuffer = BoundedBuffer<SourceReader>;

/// Pause between attempts
pub const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Connection-level headers never forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Client headers that describe the client's own body or decoding abilities
const DROPPED_REQUEST_HEADERS: &[&str] = &["content-length", "accept-encoding", "host"];

/// Upstream headers describing the upstream body, which is re-encoded
const DROPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "content-type", "content-encoding"];

/// A successful fetch
pub struct FetchResult {
    /// Lazily filled body; reading it blocks, so consume it off the runtime
    pub body: SourceBuffer,
    /// Upstream response headers worth passing on to the client
    pub headers: Headers,
}

impl std::fmt::Debug for FetchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResult")
            .field("buffered", &self.body.buffered())
            .field("headers", &self.headers)
            .finish()
    }
}

/// HTTP client with per-attempt timeouts and bounded retry
#[derive(Debug, Clone)]
pub struct ResilientFetcher {
    client: Client,
    timeout: Duration,
    max_retries: u32,
    keep_alive: bool,
    max_input_size: u64,
    backoff: Duration,
}

impl ResilientFetcher {
    /// Create a fetcher from the gateway configuration
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut builder = Client::builder();
        if !config.enable_connection_keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::unhandled(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout: config.fetch_timeout(),
            max_retries: config.max_url_fetch_retries,
            keep_alive: config.enable_connection_keep_alive,
            max_input_size: config.max_input_image_size,
            backoff: RETRY_BACKOFF,
        })
    }

    /// Override the pause between attempts
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Fetch `url`, forwarding a sanitized copy of the client's headers.
    ///
    /// Makes at most `max_retries + 1` attempts and returns the last error
    /// once they are spent. A 304 and an oversized body end the loop early.
    #[instrument(skip(self, incoming), fields(url = %url))]
    pub async fn fetch(&self, url: &str, incoming: &HeaderMap) -> Result<FetchResult, GatewayError> {
        let target = Url::parse(url)
            .map_err(|e| GatewayError::validation(format!("Invalid url '{}': {}", url, e)))?;
        let headers = sanitize_headers(&target, incoming, self.keep_alive);
        let attempts = self.max_retries.saturating_add(1);

        let mut attempt = 1;
        loop {
            match self.attempt(&target, &headers).await {
                Ok(result) => {
                    metrics::record_fetch_attempt("ok");
                    debug!(attempt, "Fetched source image");
                    return Ok(result);
                }
                Err(err) => {
                    metrics::record_fetch_attempt(attempt_outcome(&err));
                    if is_terminal(&err) || attempt >= attempts {
                        if matches!(err, GatewayError::Timeout { .. }) {
                            metrics::record_fetch_timeout();
                        }
                        return Err(err);
                    }
                    warn!(attempt, attempts, error = %err, "Fetch attempt failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(&self, target: &Url, headers: &HeaderMap) -> Result<FetchResult, GatewayError> {
        let started = Instant::now();
        let request = self
            .client
            .get(target.clone())
            .headers(headers.clone())
            .timeout(self.timeout);

        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Err(_) => return Err(self.timeout_error(target, headers)),
            Ok(Err(e)) if e.is_timeout() => return Err(self.timeout_error(target, headers)),
            Ok(Err(e)) => {
                debug!(error = %e, "Transport failure");
                return Err(GatewayError::Upstream {
                    status: 502,
                    url: target.to_string(),
                    request_headers: to_headers(headers),
                    response_headers: Headers::new(),
                });
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if status.as_u16() == 200 {
            return self.buffer_body(response, target, headers, started);
        }
        if status.as_u16() == 304 {
            return Err(GatewayError::NotModified);
        }

        let response_headers = to_headers(response.headers());
        let status = if status.is_redirection() && !response.headers().contains_key(LOCATION) {
            // a redirect nobody can follow must not look cacheable downstream
            500
        } else if status.is_client_error() || status.is_server_error() {
            status.as_u16()
        } else {
            500
        };
        Err(GatewayError::Upstream {
            status,
            url: target.to_string(),
            request_headers: to_headers(headers),
            response_headers,
        })
    }

    fn buffer_body(
        &self,
        response: Response,
        target: &Url,
        headers: &HeaderMap,
        started: Instant,
    ) -> Result<FetchResult, GatewayError> {
        if let Some(length) = response.content_length() {
            if length > self.max_input_size {
                return Err(SizeExceeded {
                    max: self.max_input_size,
                }
                .into());
            }
        }

        let forwarded = forwardable_response_headers(response.headers());
        let timeout = self.timeout_error(target, headers);
        let deadline = started + self.timeout;
        let stream = response.bytes_stream().map_err(move |e| {
            if e.is_timeout() || Instant::now() >= deadline {
                debug!(error = %e, "Timed out reading upstream body");
                metrics::record_fetch_timeout();
                timeout.clone().into_io()
            } else {
                io::Error::new(io::ErrorKind::Other, e)
            }
        });
        let reader: SourceReader = Box::new(SyncIoBridge::new(StreamReader::new(Box::pin(stream))));

        Ok(FetchResult {
            body: BoundedBuffer::with_source(reader, self.max_input_size),
            headers: forwarded,
        })
    }

    fn timeout_error(&self, target: &Url, headers: &HeaderMap) -> GatewayError {
        GatewayError::Timeout {
            url: target.to_string(),
            headers: to_headers(headers),
        }
    }
}

/// Errors that another attempt cannot change
fn is_terminal(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::NotModified
            | GatewayError::UnsupportedFeature(_)
            | GatewayError::Validation { .. }
    )
}

fn attempt_outcome(err: &GatewayError) -> &'static str {
    match err {
        GatewayError::Timeout { .. } => "timeout",
        GatewayError::NotModified => "not_modified",
        GatewayError::Upstream { status: 502, .. } => "transport",
        GatewayError::Upstream { .. } => "status",
        GatewayError::UnsupportedFeature(_) => "too_large",
        _ => "error",
    }
}

/// Build the upstream request headers from the client's.
///
/// Host, Referer, Referrer and Origin all name the target host, Accept is
/// pinned to images and Connection follows the keep-alive setting.
pub fn sanitize_headers(target: &Url, incoming: &HeaderMap, keep_alive: bool) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 6);
    for (name, value) in incoming {
        let key = name.as_str();
        if HOP_BY_HOP.contains(&key) || DROPPED_REQUEST_HEADERS.contains(&key) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Ok(host) = HeaderValue::from_str(&host_with_port(target)) {
        headers.insert(HOST, host.clone());
        headers.insert(REFERER, host.clone());
        headers.insert(HeaderName::from_static("referrer"), host.clone());
        headers.insert(ORIGIN, host);
    }
    headers.insert(ACCEPT, HeaderValue::from_static("image/*"));
    headers.insert(
        CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );
    headers
}

fn host_with_port(target: &Url) -> String {
    let host = target.host_str().unwrap_or_default();
    match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Upstream response headers minus hop-by-hop and body-describing ones
pub fn forwardable_response_headers(upstream: &HeaderMap) -> Headers {
    let mut headers = to_headers(upstream);
    headers.retain(|name, _| {
        !HOP_BY_HOP.contains(&name.as_str()) && !DROPPED_RESPONSE_HEADERS.contains(&name.as_str())
    });
    headers
}

/// Lossy conversion for error metadata; non-UTF-8 values are skipped
fn to_headers(map: &HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(retries: u32, timeout_ms: u64) -> ResilientFetcher {
        let config = GatewayConfig {
            max_url_fetch_retries: retries,
            max_image_fetch_time_ms: timeout_ms,
            max_input_image_size: 1024,
            ..Default::default()
        };
        ResilientFetcher::new(&config)
            .unwrap()
            .with_backoff(Duration::from_millis(1))
    }

    async fn read_body(result: FetchResult) -> Vec<u8> {
        tokio::task::spawn_blocking(move || result.body.into_bytes())
            .await
            .unwrap()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn test_sanitize_headers() {
        let target = Url::parse("http://img.example.com:8080/a.png").unwrap();
        let mut incoming = HeaderMap::new();
        incoming.insert("accept-encoding", HeaderValue::from_static("gzip"));
        incoming.insert("content-length", HeaderValue::from_static("12"));
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert("host", HeaderValue::from_static("gateway.local"));
        incoming.insert("accept", HeaderValue::from_static("text/html"));
        incoming.insert("if-none-match", HeaderValue::from_static("\"abc\""));

        let headers = sanitize_headers(&target, &incoming, false);
        assert_eq!(headers["host"], "img.example.com:8080");
        assert_eq!(headers["referer"], "img.example.com:8080");
        assert_eq!(headers["referrer"], "img.example.com:8080");
        assert_eq!(headers["origin"], "img.example.com:8080");
        assert_eq!(headers["accept"], "image/*");
        assert_eq!(headers["connection"], "close");
        assert_eq!(headers["if-none-match"], "\"abc\"");
        assert!(!headers.contains_key("accept-encoding"));
        assert!(!headers.contains_key("content-length"));

        let headers = sanitize_headers(&target, &HeaderMap::new(), true);
        assert_eq!(headers["connection"], "keep-alive");
    }

    #[test]
    fn test_forwardable_response_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert("cache-control", HeaderValue::from_static("max-age=60"));
        upstream.insert("content-type", HeaderValue::from_static("image/bmp"));
        upstream.insert("content-length", HeaderValue::from_static("100"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));

        let headers = forwardable_response_headers(&upstream);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers["cache-control"], "max-age=60");
    }

    #[tokio::test]
    async fn test_fetch_success_sends_sanitized_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .and(header("accept", "image/*"))
            .and(header("connection", "close"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_bytes(b"image-bytes".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/a.png", server.uri());
        let result = fetcher(0, 1000).fetch(&url, &HeaderMap::new()).await.unwrap();
        assert_eq!(result.headers["etag"], "\"v1\"");
        assert_eq!(read_body(result).await, b"image-bytes");
    }

    #[tokio::test]
    async fn test_retry_bound() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let url = format!("{}/a.png", server.uri());
        let err = fetcher(2, 1000).fetch(&url, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_single_attempt_without_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/missing.png", server.uri());
        let err = fetcher(0, 1000).fetch(&url, &HeaderMap::new()).await.unwrap_err();
        match err {
            GatewayError::Upstream {
                status,
                request_headers,
                ..
            } => {
                assert_eq!(status, 404);
                assert_eq!(request_headers["accept"], "image/*");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_not_modified_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/a.png", server.uri());
        let err = fetcher(3, 1000).fetch(&url, &HeaderMap::new()).await.unwrap_err();
        assert_eq!(err, GatewayError::NotModified);
    }

    #[tokio::test]
    async fn test_redirect_without_location_is_500() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(302))
            .mount(&server)
            .await;

        let url = format!("{}/a.png", server.uri());
        let err = fetcher(0, 1000).fetch(&url, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Upstream { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_redirect_with_location_is_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old.png"))
            .respond_with(ResponseTemplate::new(301).insert_header("location", "/new.png"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"moved".to_vec()))
            .mount(&server)
            .await;

        let url = format!("{}/old.png", server.uri());
        let result = fetcher(0, 1000).fetch(&url, &HeaderMap::new()).await.unwrap();
        assert_eq!(read_body(result).await, b"moved");
    }

    #[tokio::test]
    async fn test_timeout_carries_url_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .expect(2)
            .mount(&server)
            .await;

        let url = format!("{}/slow.png", server.uri());
        let err = fetcher(1, 50).fetch(&url, &HeaderMap::new()).await.unwrap_err();
        match err {
            GatewayError::Timeout { url: timed_out, headers } => {
                assert_eq!(timed_out, url);
                assert_eq!(headers["accept"], "image/*");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_declared_oversized_body_rejected_early() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/big.png", server.uri());
        let err = fetcher(2, 1000).fetch(&url, &HeaderMap::new()).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedFeature(_)));
    }

    /// Origin that sends headers and the first part of a body, then goes quiet
    async fn stalling_origin(partial: Vec<u8>, declared: usize, stall: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/bmp\r\nContent-Length: {}\r\n\r\n",
                declared
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&partial).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(stall).await;
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stalled_body_read_is_timeout() {
        let origin = stalling_origin(vec![7u8; 100], 1000, Duration::from_millis(400)).await;
        let url = format!("{}/slow.bmp", origin);

        let result = fetcher(0, 200).fetch(&url, &HeaderMap::new()).await.unwrap();
        let err = tokio::task::spawn_blocking(move || result.body.into_bytes())
            .await
            .unwrap()
            .unwrap_err();

        match GatewayError::from(err) {
            GatewayError::Timeout { url: timed_out, headers } => {
                assert_eq!(timed_out, url);
                assert_eq!(headers["accept"], "image/*");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let err = fetcher(0, 1000)
            .fetch("not a url", &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }
}
