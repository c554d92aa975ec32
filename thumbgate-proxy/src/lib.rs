//! Thumbgate Proxy Library
//!
//! HTTP gateway that fetches an image from an upstream url, resizes and
//! re-encodes it, and returns the result.
//!
//! Request flow for `GET /`:
//!
//! ```text
//! admission (503 when full)
//!   -> coordinator (coalesce identical queries, cap concurrent executions)
//!     -> pipeline (whitelist, fetch with retry, detect, resize, encode)
//! errors -> response mapper
//! ```

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod admission;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod pipeline;
pub mod routes;
pub mod state;

pub use config::GatewayConfig;
pub use state::AppState;

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the gateway router.
///
/// Admission control wraps only the work routes; health, configuration and
/// metrics stay reachable when the gateway is saturated.
pub fn build_router(state: Arc<AppState>) -> Router {
    let work = Router::new()
        .route("/", get(routes::resize))
        .route("/test", post(routes::test_page))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admission::admit,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .route("/config", get(routes::config))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        .merge(work)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the thumbgate server.
///
/// This function starts the HTTP server and blocks until it's shut down.
///
/// # Example
/// ```no_run
/// use thumbgate_proxy::{run_server, GatewayConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = GatewayConfig {
///         port: 8080,
///         ..Default::default()
///     };
///     run_server(config.normalized()).await
/// }
/// ```
pub async fn run_server(config: GatewayConfig) -> anyhow::Result<()> {
    init_metrics();

    info!(
        port = config.port,
        max_concurrency = config.max_concurrency,
        max_clients = config.max_clients,
        "Starting thumbgate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = Arc::new(AppState::new(config.clone())?);
    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Thumbgate listening on http://{}", addr);
    print_banner(&addr, &state);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Print the startup banner
fn print_banner(addr: &str, state: &AppState) {
    let config = &state.config;
    let on_off = |flag: bool| if flag { "enabled" } else { "disabled" };

    println!();
    println!("==================================================");
    println!("  Thumbgate v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://{}", addr);
    println!();
    println!("  Throttling:");
    println!("    Max concurrency: {}", config.max_concurrency);
    match config.max_clients {
        0 => println!("    Max clients: unlimited"),
        n => println!("    Max clients: {}", n),
    }
    println!(
        "    Request sharing: {}",
        on_off(config.share_concurrent_requests)
    );
    println!();
    println!("  Upstream:");
    println!(
        "    Fetch timeout: {}ms, retries: {}",
        config.max_image_fetch_time_ms, config.max_url_fetch_retries
    );
    println!("    Domain whitelist: {}", config.domain_whitelist);
    println!(
        "    Keep-alive: {}",
        on_off(config.enable_connection_keep_alive)
    );
    println!();
    println!("  Endpoints:");
    println!("    Resize:  GET  /?url=...&width=...&height=...");
    println!(
        "    Test:    POST /test ({})",
        on_off(config.enable_test_page)
    );
    println!("    Health:  GET  /health, /config, /metrics");
    println!("    Prometheus: GET /metrics/prometheus");
    println!("==================================================");
    println!();
}
