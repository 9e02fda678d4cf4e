//! Pulse gateway binary entry point.
//!
//! Parses configuration, initializes logging and runs the server until
//! interrupted. For library usage, see the pulse-gateway crate documentation.

use anyhow::Result;
use pulse_gateway::{Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // reqwest is built without a default crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = ServerConfig::from_args();
    tracing::info!(
        "Configuration loaded: bind={}, upstream={}, config_file={:?}",
        config.bind,
        config.upstream_url,
        config.config_file
    );
    config.validate()?;

    let server = Server::new(config)?;
    server.run().await?;

    Ok(())
}
