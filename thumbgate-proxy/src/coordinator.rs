//! Request coalescing with bounded concurrency.
//!
//! Identical concurrent requests (same fingerprint) share one execution:
//!
//! ```text
//!   request A ──┐ insert wins ──> acquire permit ──> compute ──> settle ──> remove
//!   request B ──┤ insert loses ─────────────────────── wait ──────┘
//!   request C ──┘ insert loses ─────────────────────── wait ──────┘
//! ```
//!
//! The in-flight table is a `DashMap` so test-and-insert is a single atomic
//! entry operation. Each entry carries a `watch` channel that is written
//! exactly once; waiters clone its receiver before the entry is removed, so
//! removal never races with subscription.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use thumbgate_core::GatewayError;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, Level};
use url::form_urlencoded;

use crate::metrics;

/// A fully buffered successful response, shared read-only by all waiters
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self { headers, body }
    }

    /// First header value with the given (case-insensitive) name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Build a 200 response; headers that are not valid HTTP are skipped
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(self.body.clone()));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %name, "Skipping invalid response header"),
            }
        }
        response
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> Response {
        self.to_response()
    }
}

/// Settled result of one execution
pub type Outcome = Result<Arc<CachedResponse>, GatewayError>;

struct InFlightEntry {
    settled: watch::Receiver<Option<Outcome>>,
    created_at: Instant,
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Waiter(watch::Receiver<Option<Outcome>>, Instant),
}

/// Deduplicates identical concurrent requests and caps concurrent executions
pub struct RequestCoordinator {
    share: bool,
    limiter: Arc<Semaphore>,
    in_flight: DashMap<String, InFlightEntry>,
    max_concurrency: usize,
    log_requests: bool,
    coalesced: AtomicU64,
}

impl RequestCoordinator {
    /// Create a coordinator running at most `max_concurrency` computations
    pub fn new(max_concurrency: usize, share: bool, log_requests: bool) -> Self {
        let max_concurrency = max_concurrency.max(1);
        metrics::set_max_concurrency(max_concurrency);
        Self {
            share,
            limiter: Arc::new(Semaphore::new(max_concurrency)),
            in_flight: DashMap::new(),
            max_concurrency,
            log_requests,
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Executions that may start right now
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Distinct fingerprints currently executing
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_sharing(&self) -> bool {
        self.share
    }

    /// Requests answered with another request's result so far
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Run `computation` for `fingerprint`, or join an identical one that
    /// is already running and return its result.
    pub async fn execute<F, Fut>(&self, fingerprint: &str, computation: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, GatewayError>>,
    {
        if !self.share {
            let outcome = self.run_limited(computation).await;
            if outcome.is_ok() {
                self.log_serviced(fingerprint);
            }
            return outcome;
        }

        let role = match self.in_flight.entry(fingerprint.to_string()) {
            Entry::Occupied(existing) => {
                let entry = existing.get();
                Role::Waiter(entry.settled.clone(), entry.created_at)
            }
            Entry::Vacant(vacant) => {
                let (sender, receiver) = watch::channel(None);
                vacant.insert(InFlightEntry {
                    settled: receiver,
                    created_at: Instant::now(),
                });
                Role::Leader(sender)
            }
        };

        match role {
            Role::Waiter(receiver, created_at) => {
                self.await_existing(fingerprint, receiver, created_at).await
            }
            Role::Leader(sender) => {
                metrics::set_in_flight(self.in_flight.len());
                let guard = SettleGuard {
                    coordinator: self,
                    fingerprint,
                    sender: Some(sender),
                };

                let outcome = self.run_limited(computation).await;
                if outcome.is_ok() {
                    self.log_serviced(fingerprint);
                }
                guard.settle(outcome.clone());
                outcome
            }
        }
    }

    async fn run_limited<F, Fut>(&self, computation: F) -> Outcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, GatewayError>>,
    {
        let _permit = self.acquire().await?;
        computation().await.map(Arc::new)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GatewayError::unhandled("Concurrency limiter closed"))
    }

    async fn await_existing(
        &self,
        fingerprint: &str,
        mut receiver: watch::Receiver<Option<Outcome>>,
        created_at: Instant,
    ) -> Outcome {
        let outcome = match receiver.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => None,
        };
        let outcome = outcome.unwrap_or_else(|| {
            Err(GatewayError::unhandled(
                "In-flight request ended without a result",
            ))
        });

        if outcome.is_ok() {
            self.coalesced.fetch_add(1, Ordering::Relaxed);
            metrics::record_coalesced();
            if self.log_requests {
                info!(
                    waited_ms = created_at.elapsed().as_millis() as u64,
                    "Re-used: {}",
                    fingerprint
                );
            }
        }
        outcome
    }

    fn log_serviced(&self, fingerprint: &str) {
        // building the description is not free; skip it unless it is emitted
        if self.log_requests && tracing::enabled!(Level::INFO) {
            info!("{}", describe_query(fingerprint));
        }
    }

    fn finish(&self, fingerprint: &str) {
        self.in_flight.remove(fingerprint);
        metrics::set_in_flight(self.in_flight.len());
    }
}

/// Settles the leader's entry exactly once, even if the leader is dropped
struct SettleGuard<'a> {
    coordinator: &'a RequestCoordinator,
    fingerprint: &'a str,
    sender: Option<watch::Sender<Option<Outcome>>>,
}

impl SettleGuard<'_> {
    fn settle(mut self, outcome: Outcome) {
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome));
        }
        self.coordinator.finish(self.fingerprint);
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            debug!(fingerprint = %self.fingerprint, "In-flight request abandoned");
            sender.send_replace(Some(Err(GatewayError::unhandled(
                "In-flight request was abandoned",
            ))));
            self.coordinator.finish(self.fingerprint);
        }
    }
}

/// Multi-line description of a query: url first, then the other parameters,
/// keys padded to a common width and values url-decoded.
pub fn describe_query(query: &str) -> String {
    let mut url = None;
    let mut rest = Vec::new();
    for (key, value) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
        if url.is_none() && key.eq_ignore_ascii_case("url") {
            url = Some(value.into_owned());
        } else {
            rest.push((key.into_owned(), value.into_owned()));
        }
    }

    let width = rest.iter().map(|(k, _)| k.len()).fold(3, usize::max);
    let mut lines = vec![
        "  Serviced request:".to_string(),
        format!(
            "  {:<width$}: {}",
            "url",
            url.as_deref().unwrap_or("(not set)"),
            width = width
        ),
    ];
    lines.extend(
        rest.iter()
            .map(|(k, v)| format!("  {:<width$}: {}", k, v, width = width)),
    );
    lines.join("\n")
}
