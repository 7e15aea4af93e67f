//! Daemon wiring: build every component from the config, spawn the loops,
//! and shut them down in order.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use relay_channels::TelegramChannel;
use relay_core::config::Config;
use relay_core::shellexpand;
use relay_core::traits::{Channel, Store};
use relay_store::SqliteStore;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::dispatch::Dispatcher;
use crate::ipc::{IpcWatcher, IpcWatcherConfig};
use crate::message_loop::{self, MessageLoopConfig};
use crate::queries::QueryAdapter;
use crate::queue::GroupQueue;
use crate::sandbox::mounts::load_allowlist;
use crate::sandbox::runner::{cleanup_orphans, RunnerConfig};
use crate::scheduler::{self, SchedulerConfig};
use crate::state::SharedState;

/// Run the daemon until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let project_root = std::env::current_dir().context("failed to resolve working directory")?;
    let data_root = project_root.join(&config.relay.data_root);
    let groups_root = project_root.join(&config.store.groups_dir);

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::connect(&config.store.dsn)
            .await
            .context("failed to open store")?,
    );
    let state = SharedState::load(&store).await;

    let mut channels: Vec<Arc<dyn Channel>> = Vec::new();
    if let Some(tg) = &config.channel.telegram {
        if tg.enabled && !tg.bot_token.trim().is_empty() {
            channels.push(Arc::new(TelegramChannel::new(tg)));
            info!("telegram channel enabled");
        }
    }
    if channels.is_empty() {
        warn!("no channels configured; outbound delivery is disabled");
    }
    let channels = Arc::new(channels);

    let allowlist = config
        .mounts
        .allowlist_path
        .as_deref()
        .map(shellexpand)
        .and_then(|p| load_allowlist(Path::new(&p), &config.mounts.blocked_prefixes));
    let runner = RunnerConfig::from_config(&config, project_root.clone(), allowlist);

    // Previous daemon runs may have left sandboxes behind.
    cleanup_orphans(&config.runtimes.engine).await;

    let queue = GroupQueue::new(
        config.orchestrator.max_concurrent_sandboxes,
        config.runtimes.engine.clone(),
        data_root.clone(),
    );

    let dispatcher = Arc::new(Dispatcher {
        config: config.clone(),
        runner,
        store: store.clone(),
        queue: queue.clone(),
        state: state.clone(),
        channels: channels.clone(),
    });
    queue
        .set_message_batch_fn(dispatcher.clone().message_batch_fn())
        .await;
    queue
        .set_batch_dropped_fn(dispatcher.clone().batch_dropped_fn())
        .await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ipc_watcher = IpcWatcher {
        config: IpcWatcherConfig {
            ipc_root: data_root.join("ipc"),
            poll_interval: Duration::from_millis(config.ipc.poll_interval_ms),
            main_group_folder: config.orchestrator.main_group_folder.clone(),
            assistant_name: config.relay.name.clone(),
            timezone: config.scheduler.timezone.clone(),
        },
        store: store.clone(),
        state: state.clone(),
        channels: channels.clone(),
        queries: Arc::new(QueryAdapter::new(
            config.query_adapter.clone(),
            project_root.clone(),
        )),
    };
    let ipc_shutdown = shutdown_rx.clone();
    let ipc_handle = tokio::spawn(async move {
        ipc_watcher.run(ipc_shutdown).await;
    });

    let loop_config = MessageLoopConfig {
        poll_interval: Duration::from_millis(config.orchestrator.poll_interval_ms),
        assistant_name: config.relay.name.clone(),
        main_group_folder: config.orchestrator.main_group_folder.clone(),
    };
    let loop_handle = tokio::spawn(message_loop::run_message_loop(
        loop_config,
        store.clone(),
        queue.clone(),
        state.clone(),
        shutdown_rx.clone(),
    ));

    let scheduler_config = SchedulerConfig {
        poll_interval: Duration::from_millis(config.scheduler.poll_interval_ms),
        timezone: config.scheduler.timezone.clone(),
    };
    let scheduler_handle = tokio::spawn(scheduler::run_scheduler_loop(
        scheduler_config,
        store.clone(),
        dispatcher.clone().due_task_fn(),
        shutdown_rx.clone(),
    ));

    let app_state = AppState {
        started_at: Instant::now(),
        config: config.clone(),
        store,
        queue: queue.clone(),
        state,
        channels,
        groups_root,
    };
    let server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(app_state, server_shutdown).await {
            warn!(err = %e, "http surface exited with error");
        }
    });

    info!("relay daemon running");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    queue
        .shutdown(Duration::from_millis(config.orchestrator.shutdown_grace_ms))
        .await;

    let _ = ipc_handle.await;
    let _ = loop_handle.await;
    let _ = scheduler_handle.await;
    let _ = server_handle.await;

    info!("shutdown complete");
    Ok(())
}
