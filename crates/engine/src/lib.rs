#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Bootstraps the fixed three-stage topology: the ingest HTTP server, the
//! window aggregator, and the shared store/queue they both depend on. Wires
//! them together through [`task::TaskManager`] the way this codebase already
//! spawns and joins long-running work.

use std::{collections::HashSet, sync::Arc, time::Duration};

use aggregator::{AggregatorConfig, AggregatorMetrics};
use config::AppConfig;
use ingest::{IngestConfig, SchemaValidationMode};
use queue::{nats::NatsQueue, nats::NatsQueueConfig, Queue};
use store::{postgres, Store};
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio::sync::watch;
use tracing::{error, info};

/// Errors that can prevent the engine from starting.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The aggregate/dedup store could not be reached.
    #[error("store connection failed: {0}")]
    Store(#[from] store::Error),

    /// The queue broker could not be reached.
    #[error("queue connection failed: {0}")]
    Queue(#[from] queue::Error),

    /// The ingest HTTP listener could not bind.
    #[error("ingest listener failed to bind {addr}: {reason}")]
    Listener {
        /// The address that failed to bind.
        addr: String,
        /// The OS-reported reason.
        reason: String,
    },
}

/// Runs the service until SIGINT/SIGTERM, then drains and returns.
pub async fn run(app_config: AppConfig, process_labels: ProcessLabels) -> Result<(), Error> {
    let store: Arc<dyn Store> = Arc::new(postgres::connect(&app_config.store_url).await?);

    let queue_config = NatsQueueConfig {
        server_url: app_config.queue_url.clone(),
        max_in_flight: app_config.max_in_flight,
        ack_wait: Duration::from_secs(app_config.ack_wait_secs),
        max_deliver: app_config.max_deliver,
        ..Default::default()
    };
    let queue: Arc<dyn Queue> = Arc::new(NatsQueue::connect(queue_config).await?);

    let mut task_manager = TaskManager::with_process_labels(process_labels);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_ingest_server(&mut task_manager, app_config.clone(), queue.clone());
    spawn_aggregator(&mut task_manager, app_config.clone(), store, queue, shutdown_rx);

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    if shutdown_tx.send(true).is_err() {
        error!("aggregator shutdown receiver already dropped");
    }

    task_manager.join().await;
    Ok(())
}

fn ingest_config(app_config: &AppConfig) -> IngestConfig {
    let auth_tokens: HashSet<String> = app_config.auth_tokens.iter().cloned().collect();
    let known_schema_versions: HashSet<String> = app_config.known_schema_versions.iter().cloned().collect();
    let schema_validation_mode = match app_config.schema_validation_mode {
        config::SchemaValidationMode::Strict => SchemaValidationMode::Strict,
        config::SchemaValidationMode::Lenient => SchemaValidationMode::Lenient,
    };

    IngestConfig {
        auth_tokens,
        rate_limit_per_client: app_config.rate_limit_per_client,
        rate_burst_per_client: app_config.rate_burst_per_client,
        known_schema_versions,
        schema_validation_mode,
    }
}

fn aggregator_config(app_config: &AppConfig) -> AggregatorConfig {
    AggregatorConfig {
        window_size_ms: app_config.window_size_secs as i64 * 1_000,
        flush_delay_ms: app_config.flush_delay_secs as i64 * 1_000,
        late_tolerance_ms: app_config.late_tolerance_secs as i64 * 1_000,
        flush_interval: Duration::from_secs(5),
        percentile_sample_cap: app_config.percentile_sample_cap,
    }
}

fn spawn_ingest_server(task_manager: &mut TaskManager, app_config: AppConfig, queue: Arc<dyn Queue>) {
    let process_labels = task_manager.process_labels();
    let task_labels = TaskLabels::new("ingest", "http", "service");
    let task_labels_clone = task_labels.clone();

    let join_handle = tokio::task::spawn(async move {
        let state = ingest::AppState::new(ingest_config(&app_config), queue);
        let router = ingest::router(state);

        match tokio::net::TcpListener::bind(&app_config.ingest_bind_addr).await {
            Ok(listener) => {
                info!(addr = %app_config.ingest_bind_addr, "ingest server listening");
                if let Err(err) = axum::serve(listener, router).await {
                    error!(error = %err, "ingest server exited with an error");
                }
            }
            Err(err) => {
                error!(addr = %app_config.ingest_bind_addr, error = %err, "ingest listener failed to bind");
            }
        }

        TaskManager::no_task_cleaner(process_labels, task_labels_clone)
    });

    task_manager.register(join_handle, &task_labels);
}

fn spawn_aggregator(
    task_manager: &mut TaskManager,
    app_config: AppConfig,
    store: Arc<dyn Store>,
    queue: Arc<dyn Queue>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let process_labels = task_manager.process_labels();
    let task_labels = TaskLabels::new("aggregator", "window", "queue");
    let task_labels_clone = task_labels.clone();

    let join_handle = tokio::task::spawn(async move {
        let metrics = Arc::new(AggregatorMetrics::default());
        if let Err(err) = aggregator::run(queue, store, aggregator_config(&app_config), metrics, shutdown_rx).await {
            error!(error = %err, "aggregator stopped with an error");
        }

        TaskManager::no_task_cleaner(process_labels, task_labels_clone)
    });

    task_manager.register(join_handle, &task_labels);
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let _ = signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
