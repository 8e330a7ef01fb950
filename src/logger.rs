use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init_logger(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();
}

pub fn log_request(method: &str, path: &str, status: u16, duration: Duration) {
    info!(
        target: "request",
        method = %method,
        path = %path,
        status = status,
        duration_ms = %duration.as_millis(),
        "Request completed"
    );
}
