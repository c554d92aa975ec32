//! Non-blocking admission control.
//!
//! Unlike the coordinator's concurrency limit, the admission gate never
//! queues: once `max_clients` requests are inside, further requests are
//! refused immediately with 503.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::metrics;
use crate::state::AppState;

/// Counting gate in front of the work routes
#[derive(Debug, Clone)]
pub struct AdmissionController {
    /// `None` when unlimited
    permits: Option<Arc<Semaphore>>,
    max_clients: usize,
}

/// Held for the lifetime of an admitted request; releases on drop
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionController {
    /// Create a gate admitting at most `max_clients` requests (0 = unlimited)
    pub fn new(max_clients: usize) -> Self {
        let permits = (max_clients > 0).then(|| Arc::new(Semaphore::new(max_clients)));
        Self {
            permits,
            max_clients,
        }
    }

    /// Try to admit a request without waiting.
    ///
    /// Returns `None` when the gate is full.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        match &self.permits {
            None => Some(AdmissionPermit { _permit: None }),
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| AdmissionPermit {
                    _permit: Some(permit),
                }),
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Free slots, `None` when unlimited
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|s| s.available_permits())
    }
}

/// Middleware refusing requests with 503 once the gate is full
pub async fn admit(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    match state.admission.try_admit() {
        Some(_permit) => next.run(request).await,
        None => {
            metrics::record_rejected();
            state.stats.lock().await.requests_rejected += 1;
            warn!(
                max_clients = state.admission.max_clients(),
                "Refusing request: max clients reached"
            );
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_client_gate() {
        let gate = AdmissionController::new(1);
        let first = gate.try_admit();
        assert!(first.is_some());
        assert!(gate.try_admit().is_none());
        assert_eq!(gate.available(), Some(0));

        drop(first);
        assert!(gate.try_admit().is_some());
    }

    #[test]
    fn test_unlimited_gate() {
        let gate = AdmissionController::new(0);
        let held: Vec<_> = (0..100).map(|_| gate.try_admit()).collect();
        assert!(held.iter().all(Option::is_some));
        assert_eq!(gate.available(), None);
    }

    #[test]
    fn test_permit_released_once() {
        let gate = AdmissionController::new(2);
        {
            let _a = gate.try_admit().unwrap();
            let _b = gate.try_admit().unwrap();
            assert!(gate.try_admit().is_none());
        }
        assert_eq!(gate.available(), Some(2));
    }
}
