use std::sync::Arc;

use tracing::{error, info};

use omnibus::config::load_config;
use omnibus::manager::MessagingManager;
use omnibus::transport::start_websocket_server;
use omnibus::utils::logging;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // .env is optional; real environments set variables directly.
    let _ = dotenvy::dotenv();

    let settings = load_config()?;
    logging::init(&settings.server.log_level);

    let manager = Arc::new(MessagingManager::new(&settings));
    manager.init().await?;

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let server_manager = Arc::clone(&manager);
    let server = tokio::spawn(async move {
        if let Err(e) = start_websocket_server(&addr, server_manager).await {
            error!("websocket server stopped: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    server.abort();
    manager.shutdown().await;
    Ok(())
}
