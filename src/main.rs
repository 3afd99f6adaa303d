mod cli;
mod commands;

use anyhow::Context;
use clap::Parser;
use quarry_core::AppContext;
use quarry_core::config::{Config, resolve_config_path};
use tokio_util::sync::CancellationToken;

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_subscriber();
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let app = AppContext::build(config).await?;

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e:#}");
            return;
        }
        tracing::info!("received shutdown signal, finishing in-flight files");
        signal.cancel();
    });

    let mut stdout = std::io::stdout().lock();
    let result = commands::run(&app, cli.command, &cancel, &mut stdout).await;
    app.shutdown();
    result
}

fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
