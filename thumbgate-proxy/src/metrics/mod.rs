//! Metrics module for the thumbgate gateway
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use self::prometheus::{
    encode_metrics, record_coalesced, record_fetch_attempt, record_fetch_timeout, record_rejected,
    register_metrics, set_in_flight, set_max_concurrency, RequestTimer,
};
