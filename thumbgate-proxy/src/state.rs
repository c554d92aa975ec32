//! Application state for the thumbgate gateway.

use tokio::sync::Mutex;

use thumbgate_core::GatewayError;

use crate::admission::AdmissionController;
use crate::config::GatewayConfig;
use crate::coordinator::RequestCoordinator;
use crate::error::ResponseMapper;
use crate::pipeline::ResizePipeline;

/// Application state shared across all handlers
pub struct AppState {
    /// Non-blocking gate in front of the work routes
    pub admission: AdmissionController,

    /// Coalesces identical requests and caps concurrent executions
    pub coordinator: RequestCoordinator,

    /// Fetch, resize and encode
    pub pipeline: ResizePipeline,

    /// Error to response mapping
    pub responses: ResponseMapper,

    /// Runtime statistics
    pub stats: Mutex<GatewayStats>,

    /// Configuration
    pub config: GatewayConfig,
}

impl AppState {
    /// Create new application state from a normalized configuration
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            admission: AdmissionController::new(config.max_clients),
            coordinator: RequestCoordinator::new(
                config.max_concurrency,
                config.share_concurrent_requests,
                config.logs_requests(),
            ),
            pipeline: ResizePipeline::new(&config)?,
            responses: ResponseMapper::new(&config),
            stats: Mutex::new(GatewayStats::default()),
            config,
        })
    }
}

/// Runtime statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    /// Work requests admitted
    pub requests_total: u64,

    /// Requests answered with an image
    pub requests_success: u64,

    /// Requests answered with an error
    pub requests_failed: u64,

    /// Requests refused by admission control
    pub requests_rejected: u64,
}

impl GatewayStats {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            1.0
        } else {
            self.requests_success as f64 / self.requests_total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_calculations() {
        let stats = GatewayStats {
            requests_total: 100,
            requests_success: 80,
            requests_failed: 20,
            requests_rejected: 7,
        };

        assert!((stats.success_rate() - 0.8).abs() < 0.001);
    }

    #[test]
    fn test_empty_stats() {
        let stats = GatewayStats::default();
        assert_eq!(stats.success_rate(), 1.0);
    }

    #[tokio::test]
    async fn test_state_from_config() {
        let config = GatewayConfig {
            max_clients: 3,
            max_concurrency: 2,
            ..Default::default()
        };
        let state = AppState::new(config).unwrap();
        assert_eq!(state.admission.max_clients(), 3);
        assert_eq!(state.coordinator.max_concurrency(), 2);
        assert!(state.coordinator.is_sharing());
    }
}
