//! Bounty Board Server
//!
//! Funds GitHub issues and pays out merged pull requests.

use std::sync::Arc;
use std::time::Duration;

use bounty_board::{
    Config, Engine, GitHubClient, HttpNotifier, NoopNotifier, Notifier, PayoutSigner, PgStorage,
    RpcSigner, SqliteStorage, Storage,
};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "bounty-board-server", version, about = "Bounty Board server")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Override the bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load_from(&args.config)?;

    info!("Starting Bounty Board Server");

    let database_url = config.database_url();
    let callback_token = config.payouts.resolved_callback_token();
    if bounty_board::config::payout_confirmation_unauthenticated(
        database_url.as_deref(),
        callback_token.as_deref(),
    ) {
        anyhow::bail!(
            "server mode requires a payout callback token; \
             set PAYOUT_CALLBACK_TOKEN or payouts.callback_token"
        );
    }

    // PostgreSQL when DATABASE_URL is set, local SQLite otherwise.
    let storage: Arc<dyn Storage> = match database_url {
        Some(url) => {
            let pg = PgStorage::new(&url).await?;
            info!("PostgreSQL storage initialized");
            Arc::new(pg)
        }
        None => {
            let path = &config.database.sqlite_path;
            let sqlite = SqliteStorage::new(path)?;
            info!("SQLite storage initialized at {}", path);
            Arc::new(sqlite)
        }
    };

    let github = Arc::new(GitHubClient::new(&config.github)?);

    let notifier: Arc<dyn Notifier> = match config.notifications.resolved_sink_url() {
        Some(url) => Arc::new(HttpNotifier::new(
            url,
            Duration::from_secs(config.notifications.timeout_secs),
        )?),
        None => Arc::new(NoopNotifier),
    };

    let signer: Option<Arc<dyn PayoutSigner>> = match config.payouts.resolved_signer_url() {
        Some(url) => {
            info!("Automated payout signing enabled via {}", url);
            Some(Arc::new(RpcSigner::new(
                url,
                Duration::from_secs(config.payouts.request_timeout_secs),
            )?))
        }
        None => {
            info!("No payout signer configured; all payouts take the manual path");
            None
        }
    };

    let engine = Arc::new(Engine::new(
        storage.clone(),
        github,
        notifier,
        signer,
        config.github.resolved_app_webhook_secret(),
    ));

    // Background sweep flipping access keys past their expiry.
    let sweep_storage = storage.clone();
    let sweep_interval = config.sweeper.interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        loop {
            interval.tick().await;
            match sweep_storage.expire_access_keys(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => info!("expired {} access key(s)", n),
                Err(e) => error!("access key sweep failed: {}", e),
            }
        }
    });
    info!("Access key sweeper started (every {} seconds)", sweep_interval);

    let host = args.host.unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);
    bounty_board::server::run_server(&host, port, engine, callback_token).await?;

    Ok(())
}
