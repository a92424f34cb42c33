// SPDX-License-Identifier: MIT

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use driftmail::config::EngineConfig;
use driftmail::engine::Engine;
use driftmail::events::EngineEvent;
use driftmail::source::ImapSource;

#[derive(Parser)]
#[command(
    name = "driftmaild",
    about = "driftmail — disposable-mailbox lifecycle daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config.toml (default: {data_dir}/config.toml)
    #[arg(long, env = "DRIFTMAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory for the SQLite database
    #[arg(long, env = "DRIFTMAIL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DRIFTMAIL_LOG")]
    log: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default when no subcommand given).
    Serve,
    /// Check mail source connectivity and credentials, then exit.
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref(), args.data_dir, args.log);

    init_tracing(&config);

    if let Err(problems) = config.validate() {
        bail!("configuration invalid: {problems}");
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Probe => probe(config).await,
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.clone()));
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).compact().init();
    }
}

async fn serve(config: EngineConfig) -> Result<()> {
    let config = Arc::new(config);
    let source = Arc::new(ImapSource::new(config.imap.clone()));
    let engine = Engine::new(Arc::clone(&config), source)
        .await
        .context("opening mailbox store")?;

    info!(
        domain = %config.addresses.domain,
        data_dir = %config.data_dir.display(),
        poll_interval_secs = config.polling.poll_interval_secs,
        sweep_interval_secs = config.polling.sweep_interval_secs,
        "driftmail starting"
    );

    // Surface push events in the log until a real notifier is attached.
    let mut events = engine.subscribe();
    let notifier = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Delivered { owner_id, message }) => {
                    info!(owner = %owner_id, address = %message.address, subject = %message.subject, "new mail");
                }
                Ok(EngineEvent::Expired { owner_id, address }) => {
                    info!(owner = %owner_id, address = %address, "mailbox expired");
                }
                Ok(EngineEvent::ExpiringSoon { owner_id, address, expires_at }) => {
                    info!(owner = %owner_id, address = %address, expires_at = %expires_at, "mailbox expiring soon");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let (poll_task, sweep_task) = engine.start();

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown signal received");

    poll_task.abort();
    sweep_task.abort();
    notifier.abort();

    let health = engine.health().await;
    info!(
        cycles = health.poll.cycles_completed,
        delivered = health.poll.delivered,
        uptime_secs = health.uptime_secs,
        "driftmail stopped"
    );
    Ok(())
}

async fn probe(config: EngineConfig) -> Result<()> {
    let source = ImapSource::new(config.imap.clone());
    use driftmail::source::MailSource as _;

    info!(host = %config.imap.host, port = config.imap.port, "probing mail source");
    match source.probe().await {
        Ok(()) => {
            info!("mail source reachable, credentials accepted");
            Ok(())
        }
        Err(e) => {
            error!(err = %e, "mail source probe failed");
            bail!("probe failed: {e}");
        }
    }
}
