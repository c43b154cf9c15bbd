mod cli;
mod settings;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ingest_store::{Database, EnvelopeSink, SqliteSink};
use ingest_telemetry::init_telemetry;

use crate::cli::Cli;
use crate::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    cli.apply(&mut settings);

    let server_config = settings.server_config()?;
    let telemetry = init_telemetry(settings.telemetry_config()?);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting apex-ingest");

    let db = Database::connect(&settings.database)
        .with_context(|| format!("opening database {}", settings.database))?;
    tracing::info!(path = %db.path().display(), "database opened");
    let sink: Arc<dyn EnvelopeSink> = Arc::new(SqliteSink::new(db));

    let handle = ingest_server::start(server_config, sink, telemetry.metrics())
        .await
        .with_context(|| format!("binding {}", settings.bind))?;
    tracing::info!(port = handle.port, "apex-ingest ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}
