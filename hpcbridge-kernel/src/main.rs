/**
 * HPC BRIDGE KERNEL - head node side of the worker bridge
 *
 * ROLE: Builds every component once, wires them together explicitly and
 * runs the background loops (hosts reload, identity resync, metric catalog,
 * metric config push, registration pump) next to the callback gateway.
 *
 * SHUTDOWN: Ctrl-C cancels the shared token; loops stop, the dispatcher stops
 * retrying and the HTTP server drains.
 */

mod communicator;
mod config;
mod dispatcher;
mod health;
mod hosts;
mod http;
mod identity;
mod metrics;
mod models;
mod registration;
mod scheduler;
mod state;

use crate::communicator::{MetricConfigPusher, NodeCommunicator};
use crate::config::load_config;
use crate::dispatcher::{DispatchSettings, RequestDispatcher};
use crate::health::HealthTracker;
use crate::hosts::HostsTableManager;
use crate::http::AppState;
use crate::identity::NodeIdentityCache;
use crate::metrics::{CounterTransport, MetricConfigManager, PollSettings, RestMetricStore};
use crate::registration::RegistrationPump;
use crate::scheduler::RestScheduler;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        error!(error = %format!("{e:#}"), "kernel stopped");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = Arc::new(load_config().await.context("loading kernel configuration")?);
    let cancel = CancellationToken::new();
    info!(version = env!("CARGO_PKG_VERSION"), "starting kernel");

    let scheduler = Arc::new(
        RestScheduler::new(&cfg.scheduler.url, Duration::from_secs(cfg.scheduler.request_timeout_secs))
            .context("building scheduler client")?,
    );
    let store = Arc::new(
        RestMetricStore::new(&cfg.monitoring.store_url, Duration::from_secs(cfg.scheduler.request_timeout_secs))
            .context("building metric store client")?,
    );

    let identity = Arc::new(NodeIdentityCache::new(scheduler.clone(), cfg.identity.location.clone()));
    let hosts = Arc::new(HostsTableManager::new(cfg.hosts.path.clone()));
    let metrics = Arc::new(MetricConfigManager::new(store));
    let transport = Arc::new(CounterTransport::new(cfg.collector_host(), cfg.monitoring.collector_port));

    let dispatcher = RequestDispatcher::new(DispatchSettings::from_config(&cfg), cancel.child_token())
        .context("building request dispatcher")?;
    let communicator = Arc::new(NodeCommunicator::new(dispatcher, &cfg, identity.clone(), metrics.clone()));

    let (registrations, registration_rx) = registration::channel();
    let pump = RegistrationPump::new(scheduler.clone(), identity.clone(), communicator.clone());
    let pusher = MetricConfigPusher::new(communicator.clone(), identity.clone());

    // background loops
    tokio::spawn(hosts.clone().run(Duration::from_secs(cfg.hosts.reload_interval_secs), cancel.clone()));
    tokio::spawn(identity.clone().run(Duration::from_secs(cfg.identity.refresh_interval_secs), cancel.clone()));
    tokio::spawn(metrics.clone().run(
        PollSettings {
            connect_retry: Duration::from_secs(cfg.monitoring.connect_retry_secs),
            poll_interval: Duration::from_secs(cfg.monitoring.poll_interval_secs),
        },
        cancel.clone(),
    ));
    tokio::spawn(pusher.run(metrics.subscribe(), cancel.clone()));
    tokio::spawn(pump.run(registration_rx, cancel.clone()));

    let app_state = AppState {
        config: cfg.clone(),
        scheduler,
        identity,
        hosts,
        metrics,
        transport,
        communicator,
        registrations,
        health: HealthTracker::new(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.gateway.listen)
        .await
        .with_context(|| format!("binding {}", cfg.gateway.listen))?;
    info!(listen = %cfg.gateway.listen, callback_base = %cfg.callback_base(), "callback gateway listening");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(e) => {
                error!(error = %e, "cannot listen for ctrl-c");
                return;
            }
        }
        shutdown.cancel();
    });

    let drained = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { drained.cancelled().await })
        .await
        .context("http server failed")?;
    info!("kernel stopped");
    Ok(())
}
