// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node wiring: builds every component once, runs recovery, then spawns the
//! background tasks. No global service registry - all collaborators are
//! passed in and threaded through constructors.

use crate::claim::ClaimQueue;
use crate::config::FaucetNodeConfig;
use crate::hooks::ModulePipeline;
use crate::metrics::FaucetMetrics;
use crate::notify::ClaimNotifier;
use crate::registry::SessionRegistry;
use crate::server::{run_server, AppState};
use crate::session::SessionContext;
use crate::store::SessionStore;
use crate::wallet::WalletGateway;
use anyhow::anyhow;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct FaucetNodeHandle {
    pub registry: Arc<SessionRegistry>,
    pub queue: Arc<ClaimQueue>,
    pub notifier: Arc<ClaimNotifier>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    server: JoinHandle<()>,
}

impl FaucetNodeHandle {
    /// Stop background work and flush dirty write-back state.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.registry.flush_all().await;
        for task in self.tasks {
            task.abort();
        }
        self.server.abort();
    }
}

pub async fn run_faucet_node(
    config: FaucetNodeConfig,
    store: Arc<dyn SessionStore>,
    wallet: Arc<dyn WalletGateway>,
    modules: ModulePipeline,
    prometheus_registry: prometheus::Registry,
) -> anyhow::Result<FaucetNodeHandle> {
    config.validate()?;
    let metrics = Arc::new(FaucetMetrics::new(&prometheus_registry));
    let modules = Arc::new(modules);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(SessionContext {
        config: config.faucet.clone(),
        store: store.clone(),
        modules: modules.clone(),
        events: events_tx,
    });
    let registry = Arc::new(SessionRegistry::new(ctx).with_metrics(metrics.clone()));
    let queue = Arc::new(
        ClaimQueue::new(
            config.faucet.clone(),
            config.claim.clone(),
            store.clone(),
            wallet,
            modules,
        )
        .with_metrics(metrics.clone()),
    );
    let notifier = Arc::new(
        ClaimNotifier::new(store, queue.clone(), config.notify.clone())
            .with_metrics(metrics.clone()),
    );

    // Recovery before any traffic: rebuild running sessions, then the queue
    let restored = registry
        .restore()
        .await
        .map_err(|e| anyhow!("session recovery failed: {}", e))?;
    queue
        .initialize()
        .await
        .map_err(|e| anyhow!("claim queue recovery failed: {}", e))?;
    info!(
        "recovery complete: {} sessions, {} queued and {} pending claims",
        restored,
        queue.queue_len().await,
        queue.pending_count().await
    );

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(registry.spawn_event_loop(events_rx, cancel.clone()));
    tasks.push(registry.spawn_sweeper(cancel.clone()));
    tasks.push(spawn_drain_ticker(
        queue.clone(),
        cancel.clone(),
        Duration::from_secs(config.claim.drain_interval_secs.max(1)),
    ));
    tasks.push(notifier.spawn(cancel.clone()));
    tasks.push(spawn_uptime_task(metrics.clone()));

    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.server_listen_port,
    );
    let server = run_server(
        &socket_address,
        AppState {
            registry: registry.clone(),
            queue: queue.clone(),
            prometheus: prometheus_registry,
        },
    );

    Ok(FaucetNodeHandle {
        registry,
        queue,
        notifier,
        cancel,
        tasks,
        server,
    })
}

fn spawn_drain_ticker(
    queue: Arc<ClaimQueue>,
    cancel: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => queue.process_queue().await,
            }
        }
    })
}

fn spawn_uptime_task(metrics: Arc<FaucetMetrics>) -> JoinHandle<()> {
    let start_time = std::time::Instant::now();
    tokio::spawn(async move {
        loop {
            metrics
                .server_uptime_seconds
                .set(start_time.elapsed().as_secs() as i64);
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    })
}
