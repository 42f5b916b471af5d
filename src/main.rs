//! latticed - Lattice IRC Daemon.

use latticed::config::{self, Config};
use latticed::db::Database;
use latticed::handlers::Registry;
use latticed::network::Gateway;
use latticed::security::BanKind;
use latticed::state::Fabric;
use latticed::{metrics, sync};
use std::sync::Arc;
use tracing::{error, info};

/// Resolve the configuration path from CLI arguments: `-c <path>`,
/// `--config <path>`, a bare path, or `config.toml`.
fn resolve_config_path() -> String {
    let mut args = std::env::args().skip(1);
    let raw = match args.next() {
        Some(flag) if flag == "-c" || flag == "--config" => args.next().unwrap_or_else(|| {
            eprintln!("Missing path after {}", flag);
            std::process::exit(1);
        }),
        Some(path) => path,
        None => "config.toml".to_string(),
    };
    // Canonicalize so REHASH is independent of the working directory.
    std::fs::canonicalize(&raw)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or(raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = resolve_config_path();
    let config = Config::load(&config_path).map_err(|e| {
        eprintln!("ERROR: Failed to load config from {}: {}", config_path, e);
        e
    })?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match config.server.log_format {
        config::LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        config::LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }

    if let Err(errors) = config::validate(&config) {
        for err in &errors {
            error!(error = %err, "Configuration validation failed");
        }
        anyhow::bail!("Configuration validation failed with {} error(s)", errors.len());
    }

    info!(
        server = %config.server.name,
        network = %config.server.network,
        sid = %config.server.sid,
        "Starting latticed"
    );

    metrics::init();

    let db = Database::connect(&config.database.path).await?;
    let fabric = Fabric::new(Arc::new(config.clone()), db);
    fabric.set_config_path(&config_path);

    // Registered channels survive emptiness; load them up front.
    match fabric.db.list_registered_channels().await {
        Ok(channels) => {
            info!(count = channels.len(), "Loaded registered channels");
            for chan in channels {
                fabric
                    .registered_channels
                    .insert(lattice_proto::irc_to_lower(&chan.name), chan.founder);
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load registered channels");
        }
    }

    // Server bans are pushed into the in-memory table at startup.
    for kind in [BanKind::KLine, BanKind::GLine, BanKind::ZLine] {
        match fabric.db.list_server_bans(kind).await {
            Ok(bans) => {
                info!(kind = %kind.letter(), count = bans.len(), "Loaded server bans");
                for ban in bans {
                    fabric.bans.insert(ban);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, kind = %kind.letter(), "Failed to load server bans");
            }
        }
    }

    // Graceful shutdown on SIGINT/SIGTERM.
    {
        let shutdown_tx = fabric.shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT - shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM - shutting down"),
            }
            let _ = shutdown_tx.send(());
        });
    }

    // Maintenance: expire server bans, prune limiter maps and WHOWAS.
    {
        let fabric = fabric.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut shutdown_rx = fabric.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = chrono::Utc::now().timestamp();
                        let removed = fabric.bans.prune_expired(now);
                        if removed > 0 {
                            info!(removed, "Expired server bans pruned");
                        }
                        fabric.rate_limiter.prune();
                        let cutoff = chrono::Utc::now().timestamp_millis() - 7 * 86_400_000;
                        fabric.prune_whowas(cutoff);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    // Message-history retention.
    {
        let fabric = fabric.clone();
        let retention_days = config.database.message_retention_days as i64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(86_400));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut shutdown_rx = fabric.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let cutoff =
                            chrono::Utc::now().timestamp_millis() - retention_days * 86_400_000;
                        match fabric.db.prune_messages(cutoff).await {
                            Ok(removed) if removed > 0 => {
                                info!(removed, "Old messages pruned from history");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!(error = %e, "Failed to prune message history");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    let registry = Arc::new(Registry::new());

    // Outgoing peer links.
    for link in &config.links {
        if link.auto_connect {
            sync::link::connect_outbound(fabric.clone(), link.clone());
        }
    }
    // Inbound S2S listeners.
    sync::link::start_inbound_listeners(fabric.clone());

    // Client listeners; runs until shutdown.
    let gateway = Gateway::bind(&fabric).await?;
    gateway.run(fabric.clone(), registry).await;

    info!("Gateway stopped, flushing...");
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    Ok(())
}
