use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use molview_render::backend::RenderBackend;
use molview_render::config::QueueConfig;
use molview_render::events::RenderEvent;
use molview_render::RenderQueue;
use molview_worker::config::WorkerConfig;
use molview_worker::events::WorkerEvent;
use molview_worker::{health, WorkerProcessManager};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "molview_daemon=info,molview_worker=info,molview_render=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let worker_config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let queue_config = QueueConfig::from_env().context("invalid render queue configuration")?;
    tracing::info!(
        binary = %worker_config.worker_binary.display(),
        base_port = worker_config.base_port,
        max_instances = worker_config.max_instances,
        output_dir = %queue_config.output_dir.display(),
        max_concurrent_jobs = queue_config.max_concurrent_jobs,
        "Loaded configuration",
    );

    tokio::fs::create_dir_all(&queue_config.output_dir)
        .await
        .with_context(|| format!("cannot create {}", queue_config.output_dir.display()))?;

    // --- Worker manager ---
    let health_interval = worker_config.health_check_interval;
    let manager = WorkerProcessManager::with_os_defaults(worker_config);
    let cancel = CancellationToken::new();

    let health_handle = tokio::spawn(health::run(
        Arc::clone(&manager),
        health_interval,
        cancel.child_token(),
    ));

    // --- Render queue ---
    let queue = RenderQueue::new(queue_config, Arc::clone(&manager) as Arc<dyn RenderBackend>);
    let queue_handle = queue.start();

    let log_handle = tokio::spawn(log_events(
        manager.subscribe(),
        queue.subscribe(),
        cancel.child_token(),
    ));

    tracing::info!("molview daemon running");
    shutdown_signal().await;

    // --- Shutdown ---
    queue.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), queue_handle).await;
    tracing::info!("Render queue stopped");

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), health_handle).await;

    manager.shutdown().await;
    let _ = log_handle.await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Forward lifecycle events to the log until cancelled.
async fn log_events(
    mut workers: broadcast::Receiver<WorkerEvent>,
    mut jobs: broadcast::Receiver<RenderEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = workers.recv() => match event {
                Ok(event) => tracing::debug!(?event, "Worker event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Worker event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = jobs.recv() => match event {
                Ok(RenderEvent::Failed { job_id, error }) => {
                    tracing::warn!(job_id = %job_id, error = %error, "Render job failed");
                }
                Ok(event) => tracing::debug!(?event, "Render event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Render event log lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown"),
        () = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
