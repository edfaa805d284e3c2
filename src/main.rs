use anyhow::Result;
use clap::Parser;
use docker_registry::{api, cli::Cli, config::Config, storage};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let storage = storage::from_config(&config.storage).await?;
    let api = api::RegistryApi::new(config.api, storage);
    api::serve(api).await
}
