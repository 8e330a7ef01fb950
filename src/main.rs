use http_proxy_cache::logger::init_logger;
use http_proxy_cache::prelude::*;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_logger(&config.logging.filter);

    info!("Starting HTTP proxy cache");
    info!(
        "Store backend: {:?}, rate limit {} per {}s, upstream timeout {}s",
        config.store.backend,
        config.rate_limit.max_requests,
        config.rate_limit.window_secs,
        config.upstream.timeout_secs
    );

    let server = ProxyServer::from_config(&config)?;
    server.run_until(wait_for_shutdown()).await?;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
    info!("Shutting down, draining connections...");
}
