// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use dnsync::{
    catalog::{self, CatalogSettings},
    config::Config,
    constants::{
        DEFAULT_CONFIG_PATH, ENGINE_INPUT_CHANNEL_CAPACITY, RUNTIME_WORKER_THREADS,
        SHUTDOWN_DRAIN_TIMEOUT_SECS,
    },
    context::Context,
    directory::{freeipa::FreeIpaSettings, DirectoryClient, FreeIpaClient, MemoryDirectory},
    reconcilers::{Engine, EngineSettings},
    source::{self, SourceSettings},
};
use kube::Client;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Sync Kubernetes service hostnames into FreeIPA DNS and certificates.
#[derive(Debug, Parser)]
#[command(name = "dnsync", version, about)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log format; overrides RUST_LOG_FORMAT
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,

    /// Watch the cluster but keep DNS and certificates in memory
    #[arg(long)]
    dry_run: bool,
}

/// Flag first, then `RUST_LOG_FORMAT`, then text.
fn resolve_log_format(flag: Option<LogFormat>, env: Option<&str>) -> LogFormat {
    flag.unwrap_or_else(|| match env.map(str::to_lowercase).as_deref() {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Text,
    })
}

fn init_tracing(format: LogFormat) {
    // Format: timestamp file:line LEVEL message
    // Respects RUST_LOG if set, otherwise defaults to INFO
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_format = std::env::var("RUST_LOG_FORMAT").ok();
    init_tracing(resolve_log_format(cli.log_format, env_format.as_deref()));

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(
        path = %cli.config.display(),
        zone = %config.zone(),
        certificates = config.certificates.enabled,
        catalog = config.catalog.enabled,
        "Configuration loaded"
    );
    if cli.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    // kube and reqwest both link rustls; the process uses the ring provider.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(RUNTIME_WORKER_THREADS)
        .thread_name("dnsync-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config, cli.dry_run))
}

async fn async_main(config: Config, dry_run: bool) -> Result<()> {
    info!("Starting dnsync");

    let directory: Arc<dyn DirectoryClient> = if dry_run {
        warn!("Dry run: DNS records and certificates are kept in memory only");
        Arc::new(MemoryDirectory::new().with_zone(&config.zone()))
    } else {
        let settings = FreeIpaSettings::from_config(&config);
        debug!(settings = ?settings, "Creating FreeIPA client");
        Arc::new(FreeIpaClient::new(settings)?)
    };

    let ctx = Arc::new(Context::from_config(&config, directory));
    let engine = Engine::new(ctx, EngineSettings::from_config(&config));
    let snapshots = engine.subscribe();
    let (tx, rx) = mpsc::channel(ENGINE_INPUT_CHANNEL_CAPACITY);

    debug!("Initializing Kubernetes client");
    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let source_settings = SourceSettings::from_config(&config);
    let api = source::service_api(client, &source_settings);

    let mut engine_task = tokio::spawn(engine.run(rx));

    let mut feeders = JoinSet::new();
    feeders.spawn(named("service watch", source::run_watch(api.clone(), tx.clone())));
    feeders.spawn(named(
        "periodic resync",
        source::run_periodic_resync(api, source_settings, tx),
    ));
    if config.catalog.enabled {
        let bind_address = config.catalog.bind_address.clone();
        let settings = CatalogSettings::from_config(&config);
        feeders.spawn(named("catalog", async move {
            catalog::serve(&bind_address, settings, snapshots).await
        }));
    } else {
        info!("Catalog disabled");
    }

    // Every task should run until shutdown; if one stops, the process stops.
    let outcome = tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            info!(signal = signal, "Shutdown signal received, stopping");
            Ok(())
        }
        joined = &mut engine_task => {
            error!("CRITICAL: reconciliation engine exited unexpectedly");
            joined??;
            anyhow::bail!("reconciliation engine exited unexpectedly without error");
        }
        Some(joined) = feeders.join_next() => {
            let (name, result) = joined?;
            error!(task = name, "CRITICAL: task exited unexpectedly");
            result.and_then(|()| Err(anyhow::anyhow!("{name} exited unexpectedly without error")))
        }
    };

    // Dropping the feeders closes the engine's input; it then finishes in-flight tasks.
    feeders.abort_all();
    while feeders.join_next().await.is_some() {}

    match tokio::time::timeout(Duration::from_secs(SHUTDOWN_DRAIN_TIMEOUT_SECS), engine_task).await {
        Ok(joined) => joined??,
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_DRAIN_TIMEOUT_SECS,
            "Engine did not finish in-flight tasks before the shutdown timeout"
        ),
    }

    info!("dnsync stopped");
    outcome
}

async fn named(
    name: &'static str,
    task: impl Future<Output = Result<()>>,
) -> (&'static str, Result<()>) {
    (name, task.await)
}

/// Wait for SIGINT or SIGTERM and return its name.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT")
    }
}
