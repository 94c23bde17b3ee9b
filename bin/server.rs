// TPI Evoluto - Web Server
// REST API + cruscotto with Axum

use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tpi_evoluto::{create_router, AppState, Config};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tpi_evoluto::init_tracing("info")?;

    info!("🌐 TPI Evoluto - Web Server v{}", tpi_evoluto::VERSION);

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .ensure_directories()
        .context("Failed to create directories")?;

    let repo = config.open_repository()?;
    info!(
        "Catalog backend: {} (data: {}, logs: {})",
        repo.backend(),
        config.data_dir.display(),
        config.logs_dir.display()
    );

    let address = config.api_address();
    let app = create_router(AppState::new(config, repo));

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind to {}", address))?;

    info!("🚀 Server running on http://{}", address);
    info!("   Health:    http://{}/health", address);
    info!("   Catalog:   http://{}/api/dpi/csv/catalogo", address);
    info!("   Cruscotto: http://{}/", address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
