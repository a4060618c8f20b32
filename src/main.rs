use agentbox::config::{AppConfig, Args};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agentbox=info")),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args)?;

    info!(bind_addr = %config.bind_addr, "starting agentbox");
    agentbox::http::serve(config).await
}
