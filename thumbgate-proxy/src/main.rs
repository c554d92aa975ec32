//! Thumbgate - image resizing gateway.
//!
//! Fetches an image from an upstream url, resizes and re-encodes it, and
//! protects itself and the upstream with admission control, request
//! coalescing and bounded retries.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (port 8000, any source host)
//! thumbgate
//!
//! # Custom configuration
//! THUMBGATE_PORT=9000 THUMBGATE_DOMAIN_WHITELIST="*.example.com" thumbgate
//!
//! # Resize
//! curl "http://localhost:8000/?url=https://img.example.com/cat.bmp&width=400" -o cat.jpg
//! ```

use thumbgate_proxy::{run_server, GatewayConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("thumbgate_proxy=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load configuration
    let config = GatewayConfig::from_env().load_defaults()?.normalized();

    run_server(config).await
}
