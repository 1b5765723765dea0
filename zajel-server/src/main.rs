use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // rustls needs an explicit provider selection before any TLS usage.
    let _ = tokio_rustls::rustls::crypto::aws_lc_rs::default_provider().install_default();
    // Use JSON logs in production (ZAJEL_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("ZAJEL_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("zajel_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = zajel_server::config::ServerConfig::parse();
    config.validate()?;
    tracing::info!("Starting Zajel server on port {}", config.port);
    if config.tls_enabled() {
        tracing::info!("TLS enabled on the client listener");
    }
    tracing::info!("Federation listener on port {}", config.federation_port);
    for endpoint in config.bootstrap_endpoints() {
        tracing::info!("Bootstrapping from {endpoint}");
    }

    let server = zajel_server::server::Server::new(config)?;
    server.run().await
}
