//! Ferrite - synthetic monitoring agent.

use ferrite::config::{self, Config};
use ferrite::error::{Error, Result};
use ferrite::internal_metrics;
use ferrite::job::manager::JobManager;
use ferrite::storage;

use clap::Parser;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ferrite", version, about = "Synthetic monitoring agent")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferrite=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<()> {
    let mut cfg = Config::load(&args.config)?;

    if let Some(url) = cfg.general.job_configuration_url.clone() {
        let fetched = config::fetch_job_configuration(&url, cfg.request_timeout()?).await?;
        tracing::info!("fetched {} job(s) from {}", fetched.len(), url);
        cfg.jobs.extend(fetched);
        if cfg.jobs.is_empty() {
            return Err(Error::ConfigInvalid("no jobs were configured".to_string()));
        }
    }

    // Root cancellation scope; every job, engine, and in-flight request
    // inherits it.
    let cancel = CancellationToken::new();

    let (storage, storage_runtime) = storage::start(&cfg, &cancel).await?;

    let internal = if cfg.general.report_internal_metrics {
        let interval = Duration::from_secs(
            cfg.general
                .internal_metrics_gathering_interval
                .unwrap_or(internal_metrics::DEFAULT_GATHERING_INTERVAL),
        );
        Some(tokio::spawn(internal_metrics::run(
            interval,
            storage.clone(),
            cancel.clone(),
        )))
    } else {
        None
    };

    let mut manager = JobManager::build(&cfg, storage, cancel.clone())?;
    manager.start();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling all tasks");
        signal_cancel.cancel();
    });

    manager.wait().await;
    storage_runtime.wait().await;
    if let Some(task) = internal {
        let _ = task.await;
    }

    tracing::info!("all tasks drained, exiting");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install SIGINT handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
