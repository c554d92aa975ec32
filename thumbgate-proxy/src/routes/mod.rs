//! HTTP route handlers for the thumbgate gateway.
//!
//! - `resize`: the image resize endpoint
//! - `test_page`: optional source fetch check
//! - `health`: health, configuration and metrics endpoints

pub mod health;
pub mod resize;
pub mod test_page;

// Re-export handlers for convenience
pub use health::{config, health, metrics, metrics_prometheus};
pub use resize::resize;
pub use test_page::test_page;
