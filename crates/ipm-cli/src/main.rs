mod api;
mod options;
mod rules;

use anyhow::{Context, Result};
use clap::Parser;
use ipm_cluster::{Dialer, Hosts, Hub, SyncProtocol, RECONNECT_INTERVAL};
use ipm_ipt::{Engine, Iptables};
use ipm_metrics::Metrics;
use ipm_registry::Registry;
use options::{bind_address, Cli, Settings};
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Time allowed for open connections to finish after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_logging(log_file: Option<&str>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path))?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn log_settings(settings: &Settings) {
    info!("Option config-file: {}", settings.config_file);
    info!("Option data-path: {}", settings.data_path.display());
    info!("Option log-file: {}", settings.log_file.as_deref().unwrap_or("-"));
    info!("Option listen: {}", settings.listen);
    info!("Option peers: {}", settings.peers.join(","));
    info!("Option purge-on-exit: {}", settings.purge_on_exit);
    info!("Option priority: {}", settings.priority);
}

async fn shutdown_signal() -> Result<&'static str> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    let settings = cli.resolve(&config);

    init_logging(settings.log_file.as_deref())?;
    log_settings(&settings);

    let iptables = Iptables::new();
    if !iptables.available().await {
        warn!("iptables binary not found, firewall commands will fail");
    }

    let registry = Registry::open(&settings.data_path).with_context(|| {
        format!("Failed to open registry under {}", settings.data_path.display())
    })?;
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);
    let engine = Arc::new(Engine::new(
        Arc::new(iptables),
        Arc::new(registry),
        metrics.clone(),
    ));

    for (table, chain) in config.chains.iter() {
        engine
            .create_chain(table, chain)
            .await
            .with_context(|| format!("Failed to create chain {} in table {}", chain.name, table))?;
        info!("Chain {} ready in table {}", chain.name, table);
    }

    rules::load_rules(&engine, &settings.data_path, true)
        .await
        .context("Failed to load static rules")?;

    let restored = engine
        .restore_registry()
        .await
        .context("Failed to restore rule sets")?;
    info!("Restored {} rule set(s) from the registry", restored);

    let uuid = uuid::Uuid::new_v4().to_string();
    info!("Instance UUID {} with priority {}", uuid, settings.priority);
    let hub = Hub::new(
        &uuid,
        settings.priority,
        Hosts::new(settings.peers.clone()),
        SyncProtocol::new(engine.clone()),
        metrics.clone(),
    )
    .spawn();

    let dialer = Dialer::new(hub.clone());
    tokio::spawn(async move {
        dialer.connect_all().await;
        tokio::time::sleep(RECONNECT_INTERVAL).await;
        dialer.reconnect_loop(RECONNECT_INTERVAL).await;
    });

    let app = api::router(api::AppState {
        engine: engine.clone(),
        hub,
        metrics,
    });

    let addr = bind_address(&settings.listen);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("API listening on {}", addr);

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .await
    });

    let finished = tokio::select! {
        result = &mut server => Some(result),
        signal = shutdown_signal() => {
            info!("Received {}, shutting down", signal?);
            None
        }
    };

    let served = match finished {
        Some(result) => result,
        None => {
            let _ = stop_tx.send(());
            match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Connections still open after {:?}, exiting", SHUTDOWN_GRACE);
                    Ok(Ok(()))
                }
            }
        }
    };
    if let Err(e) = served.context("API server task failed")? {
        error!("API server failed: {}", e);
    }

    if settings.purge_on_exit {
        info!("Purging managed chains");
        engine
            .purge_chains()
            .await
            .context("Failed to purge chains")?;
    }

    info!("Shutdown complete");
    Ok(())
}
