//! Guild DKP ledger and auction house driven by chat slash commands.
//!
//! The core is event-sourced: every state change is a domain event appended
//! to a durable log keyed by `(aggregate_id, version)`, live auctions are
//! in-memory aggregates replayable from that log, and a database lease
//! elects the single replica that serves commands. Standbys run only the
//! health endpoints until they win the lease, then recover in-flight
//! auctions from the log before accepting traffic.

pub mod auction;
pub mod bot;
pub mod config;
pub mod dkp;
pub mod event;
pub mod health;
pub mod leader;
pub mod store;
pub mod telemetry;

pub use telemetry::{setup_tracing, TelemetryError, TelemetryGuard};

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::auction::coordinator::Coordinator;
use crate::bot::commands::Handlers;
use crate::config::Config;
use crate::dkp::DkpManager;
use crate::health::{DatabaseChecker, Health};
use crate::leader::LeaderElector;
use crate::store::Registry;

/// Wires the system together and serves until shutdown. With leader
/// election enabled this blocks until the lease is won, serves while it is
/// held, and returns an error when it is lost so the process can exit and
/// let a standby take over.
pub async fn launch(config: Config) -> anyhow::Result<()> {
    let registry = Registry::builtin();
    let stores = registry.open(&config.database).await?;
    info!(driver = %config.database.driver, "store opened");

    let dkp = Arc::new(DkpManager::new(stores.players.clone()));
    let coordinator = Arc::new(Coordinator::new(&stores, dkp.clone()));
    let health = Health::new(vec![Box::new(DatabaseChecker::new(stores.ping.clone()))]);

    let health_server = spawn_health_server(&config, health.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_listener(shutdown_tx);

    let result = if config.leader_election.enabled {
        info!("leader election enabled, waiting for leadership");
        let elector =
            LeaderElector::connect(&config.database, config.leader_election.clone()).await?;

        let serve_config = config.clone();
        let serve_health = health.clone();
        elector
            .run(shutdown_rx, move |stop| async move {
                if let Err(err) = serve(serve_config, dkp, coordinator, serve_health, stop).await {
                    error!(error = %err, "serving failed");
                }
            })
            .await
            .map_err(Into::into)
    } else {
        serve(config, dkp, coordinator, health, shutdown_rx).await
    };

    health_server.abort();
    info!("shutdown complete");
    result
}

/// The leader's serving loop: recover in-flight auctions, open the chat
/// gateway, and hold until the stop signal fires.
async fn serve(
    config: Config,
    dkp: Arc<DkpManager>,
    coordinator: Arc<Coordinator>,
    health: Arc<Health>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let recovered = coordinator.recover_open().await?;
    if recovered > 0 {
        info!(count = recovered, "recovered open auctions from the log");
    }

    let gateway = bot::start(&config.chat, Handlers::new(dkp, coordinator)).await?;
    health.set_ready(true);
    info!(version = env!("CARGO_PKG_VERSION"), "dkpbot is serving");

    while !*stop.borrow() {
        if stop.changed().await.is_err() {
            break;
        }
    }

    health.set_ready(false);
    info!("closing chat gateway");
    if tokio::time::timeout(config.server.shutdown_timeout(), gateway.stop())
        .await
        .is_err()
    {
        error!("gateway did not shut down within the grace period");
    }
    Ok(())
}

/// The health endpoints run on every replica, leader or not, so the
/// cluster can probe liveness and route readiness to the leader.
fn spawn_health_server(config: &Config, health: Arc<Health>) -> JoinHandle<()> {
    let figment = rocket::Config::figment()
        .merge(("port", config.server.port))
        .merge(("address", "0.0.0.0"));
    let rocket = rocket::custom(figment)
        .mount("/", health::routes())
        .manage(health);

    tokio::spawn(async move {
        if let Err(err) = rocket.launch().await {
            error!(error = %err, "health server failed");
        }
    })
}

fn spawn_signal_listener(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received interrupt, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(err) => {
                error!(error = %err, "installing SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received interrupt, shutting down");
                }
            }
        }
        let _ = shutdown.send(true);
    });
}
