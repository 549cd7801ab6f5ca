//! Command line entry point for the chargEV check-in synchronizer.

use std::sync::Arc;

use anyhow::bail;
use clap::Parser;
use log::info;

use chargev_db_client::ChargevDbClient;
use chargev_registry::GoingElectricFetcher;
use chargev_sync_core::{ForeignSources, RunOptions, SyncOrchestrator};
use plugfinder_store::PlugFinderClient;

#[derive(Debug, Parser)]
#[command(name = "chargev-sync", version, about = "Synchronizes chargEV DB check-ins with the PlugFinder record store")]
struct Cli {
    /// Pull new events from the chargEV DB into the PlugFinder store
    #[arg(long)]
    download: bool,

    /// Push natively authored check-ins back into the chargEV DB
    #[arg(long)]
    upload: bool,

    /// Log what would be written without mutating either store
    #[arg(long)]
    dry_run: bool,

    /// Purge previously synchronized records and re-process from scratch
    #[arg(long)]
    init: bool,

    /// Cap on the number of items processed per direction
    #[arg(long)]
    limit: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Base URL of the chargEV DB API
    #[arg(long, env = "CHARGEV_DB_API_URL")]
    chargev_db_url: String,

    /// JWT for the chargEV DB API
    #[arg(long, env = "CHARGEV_DB_API_JWT", hide_env_values = true)]
    chargev_db_jwt: String,

    /// GoingElectric API key
    #[arg(long, env = "GE_API_KEY", hide_env_values = true)]
    ge_api_key: String,

    /// Override for the GoingElectric API endpoint
    #[arg(long, env = "GE_API_URL")]
    ge_api_url: Option<String>,

    /// Base URL of the PlugFinder record store
    #[arg(long, env = "PLUGFINDER_API_URL")]
    plugfinder_url: String,

    /// API token for the PlugFinder record store
    #[arg(long, env = "PLUGFINDER_API_TOKEN", hide_env_values = true)]
    plugfinder_token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        if cli.verbose { "debug" } else { "info" },
    ))
    .init();

    if !cli.download && !cli.upload {
        bail!("nothing to do: pass --download and/or --upload");
    }

    let source = Arc::new(ChargevDbClient::new(&cli.chargev_db_url, &cli.chargev_db_jwt)?);
    let target = Arc::new(PlugFinderClient::new(
        &cli.plugfinder_url,
        cli.plugfinder_token.clone(),
    )?);
    let registry = Arc::new(GoingElectricFetcher::new(
        &cli.ge_api_key,
        cli.ge_api_url.clone(),
    )?);

    let caller = target.sign_in().await?;
    info!("signed in to the record store as {caller}");

    let options = RunOptions {
        dry_run: cli.dry_run,
        limit: cli.limit,
        init: cli.init,
    };
    if options.dry_run {
        info!("dry run: no store will be mutated");
    }

    let orchestrator = SyncOrchestrator::new(
        source,
        target,
        registry.clone(),
        options,
        ForeignSources::default(),
    );

    if cli.download {
        let summary = orchestrator.download().await?;
        info!("download: {summary}");
    }
    if cli.upload {
        let summary = orchestrator.upload().await?;
        info!("upload: {summary}");
    }

    info!("registry requests issued: {}", registry.request_count());
    Ok(())
}
