use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use clap::Parser;
use outway::config::{ConfigFile, Store};
use outway::proxy::Proxy;
use outway::server::Servers;

/// A policy-aware DNS proxy that steers selected destinations through
/// specific network interfaces.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "OUTWAY_CONFIG", default_value = "outway.toml")]
    config: PathBuf,

    /// Log filter directives, e.g. "debug" or "resolver=trace".
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log: String,

    /// Emit logs as JSON.
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Validate the configuration and exit.
    #[arg(long, default_value_t = false)]
    check: bool,

    /// Answer queries without installing any routes or firewall state.
    #[arg(long, env = "OUTWAY_NO_STEERING", default_value_t = false)]
    no_steering: bool,
}

#[expect(
    clippy::print_stderr,
    reason = "No logger is active when we are printing this error."
)]
fn main() {
    match try_main() {
        Ok(()) => {}
        Err(e) => {
            // Print chain of errors manually to avoid it looking like a crash with stacktrace.
            eprintln!("{e:#}");

            std::process::exit(1);
        }
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    if cli.check {
        ConfigFile::load(&cli.config)?.validate()?;

        return Ok(());
    }

    logging::setup_global_subscriber(&cli.log, cli.json)?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = ConfigFile::load(&cli.config)?
        .validate()
        .context("Invalid configuration")?;

    let store = Arc::new(Store::new(config));

    let backend = match cli.no_steering {
        true => Arc::new(steer::Disabled) as Arc<dyn steer::Steering>,
        false => steer::probe(),
    };

    tracing::info!(backend = backend.name(), "Selected steering backend");

    let proxy = Proxy::new(store, backend.clone());

    // Entries that are never queried again would otherwise only leave via
    // LRU pressure.
    tokio::spawn({
        let cache = proxy.cache.clone();

        async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));

            loop {
                interval.tick().await;
                cache.purge_expired(std::time::Instant::now());
            }
        }
    });

    let servers = Servers::bind(proxy).context("Failed to start DNS listeners")?;

    wait_for_shutdown().await?;

    tracing::info!("Shutting down");

    servers.shutdown().await;

    if let Err(e) = backend.cleanup_all().await {
        tracing::warn!("Failed to clean up steering state: {e:#}");
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
        _ = sigterm.recv() => {}
    }

    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
