//! Channel dispatcher daemon entry point.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use channel_dispatcher::bus::fake::FakeBus;
use channel_dispatcher::bus::BusConnection;
use channel_dispatcher::config::Config;
use channel_dispatcher::dispatcher::{Dispatcher, Notification};
use channel_dispatcher::registry::ClientRegistry;

/// Resolve the configuration path from CLI arguments.
/// Supports `-c <path>`, `--config <path>`, or a bare path. Falls back
/// to `config.toml` when no argument is provided.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);

    let raw_path = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("missing path after {flag}");
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };

    match std::fs::canonicalize(Path::new(&raw_path)) {
        Ok(p) => p.to_string_lossy().into_owned(),
        Err(_) => raw_path,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: failed to load config from {config_path}: {e}");
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.filter.clone()));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).with_target(true).init();
    }

    info!(
        well_known_name = %config.bus.well_known_name,
        client_prefix = %config.bus.client_prefix,
        "starting channel dispatcher"
    );

    if config.metrics.enabled {
        channel_dispatcher::metrics::init();
    }

    // spec.md's non-goals exclude the concrete bus wire protocol, so the
    // daemon speaks to an in-process FakeBus; a real transport would
    // provide its own BusConnection and slot in unchanged.
    let bus: Arc<dyn BusConnection> = FakeBus::new();
    if let Err(e) = bus.request_name(&config.bus.well_known_name).await {
        error!(error = %e, "failed to claim well-known bus name");
        return Err(anyhow::anyhow!("could not claim {}: {e}", config.bus.well_known_name));
    }

    let registry = ClientRegistry::new(
        Arc::clone(&bus),
        config.bus.client_prefix.clone(),
        std::iter::once(config.clients.user_data_dir.clone())
            .chain(config.clients.system_data_dirs.clone())
            .collect(),
    );

    let dispatcher = Dispatcher::new(registry, bus, Vec::new());
    if let Err(e) = dispatcher.bootstrap(Vec::new()).await {
        error!(error = %e, "bootstrap failed");
        return Err(e.into());
    }

    let mut notifications = dispatcher.subscribe();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = async {
            loop {
                match notifications.recv().await {
                    Ok(Notification::DispatchCompleted { account }) => {
                        info!(%account, "dispatch batch completed");
                    }
                    Ok(Notification::DispatchFailed { channel, error }) => {
                        warn!(%channel, %error, "channel dispatch failed");
                    }
                    Ok(Notification::NewDispatchOperation { path, .. }) => {
                        info!(%path, "dispatch operation awaiting approval");
                    }
                    Ok(Notification::DispatchOperationFinished { path }) => {
                        info!(%path, "dispatch operation finished");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "notification receiver lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        } => {}
    }

    Ok(())
}
