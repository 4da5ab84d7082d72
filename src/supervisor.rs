//! Process lifecycle: start the scheduler, wait for a shutdown signal,
//! propagate cancellation, and join every spawned task — spec.md §4's
//! Supervisor row and §5 "Cancellation".

use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;

use crate::config::Config;
use crate::exclusions::ExclusionCache;
use crate::master_list::MasterListClient;
use crate::querier::GameSpyClient;
use crate::scheduler::Scheduler;
use crate::store::Store;

/// Owns the process-scoped resources the teacher's design note (spec.md §9,
/// "global singletons... re-express as process-scoped resources held by the
/// Supervisor") calls for: the database pool and the HTTP client are built
/// once here and handed down explicitly, never reached for through
/// module-level state.
pub struct Supervisor<C> {
    scheduler: Arc<Scheduler<C>>,
}

impl<C: GameSpyClient + 'static> Supervisor<C> {
    pub async fn bootstrap(config: Config, client: C) -> anyhow::Result<Self> {
        let store = Arc::new(Store::connect(&config.postgres_dsn).await?);
        let exclusions = Arc::new(ExclusionCache::new());
        let master_list = MasterListClient::new(config.master_list_url());

        let scheduler = Arc::new(Scheduler::new(config, store, exclusions, master_list, client));
        scheduler.seed().await?;

        Ok(Supervisor { scheduler })
    }

    /// Spawns every task, then blocks until ctrl-c (or `SIGTERM` on Unix),
    /// at which point it broadcasts shutdown and waits for every task to
    /// release its held Poll Entry and connection (spec.md §5
    /// "Cancellation").
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = self.scheduler.spawn(shutdown_rx);

        info!("bf1942-ingestd running with {} worker tasks", handles.len());
        wait_for_shutdown_signal().await;
        info!("shutdown signal received; propagating cancellation to {} tasks", handles.len());

        shutdown_tx.send(true).ok();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("task panicked during shutdown: {e}");
            }
        }
        info!("all tasks released their work; exiting");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
