use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ServeArgs, ServerConfig};
use crate::error::ServerError;
use crate::store::MemoryPositionStore;
use fleet_api::{PositionStore, PositionStream};
use ingest_worker::Worker;
use live_server::broker::Broker;
use stream_engine::MemoryStream;

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("fleet-server starting");

    // --- Load config ---
    let config = if std::path::Path::new(&args.config).exists() {
        let cfg = ServerConfig::load(&args.config)?;
        tracing::info!(config = %args.config, "loaded config");
        cfg
    } else {
        tracing::info!(config = %args.config, "config file not found, using defaults");
        toml::from_str("").map_err(|e| ServerError::Config {
            context: "defaults",
            detail: e.to_string(),
        })?
    };

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Stream + consumer group ---
    let memory_stream = Arc::new(MemoryStream::new(config.stream_max_entries));
    let stream: Arc<dyn PositionStream> = memory_stream.clone();
    stream.create_group(&config.group).await?;
    tracing::info!(
        group = %config.group,
        max_entries = config.stream_max_entries,
        "position stream ready"
    );

    // --- Store: connectivity is checked before any worker starts ---
    let store: Arc<dyn PositionStore> = Arc::new(MemoryPositionStore::new(config.stream_max_entries));
    store.ping().await?;
    tracing::info!("position store ready");

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // --- Broker ---
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(config.event_buffer);
    let (broker, broker_handle) = Broker::new(events_rx, config.ws_buffer);
    let broker_token = token.clone();
    handles.push(tokio::spawn(broker.run(broker_token)));
    tracing::info!(ws_buffer = config.ws_buffer, "broker started");

    // --- Workers ---
    for i in 0..config.worker_instances.max(1) {
        let worker = Worker::new(
            stream.clone(),
            store.clone(),
            events_tx.clone(),
            config.worker_config(i),
        );
        handles.push(tokio::spawn(worker.run(token.clone())));
    }
    tracing::info!(
        instances = config.worker_instances.max(1),
        group = %config.group,
        "ingestion workers started"
    );
    // Workers hold their own clones of the event sender.
    drop(events_tx);

    // --- API server (HTTP + WS) ---
    let api_stream = stream.clone();
    let api_port = config.api_port;
    let timing = config.ws_timing();
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move {
        if let Err(e) = live_server::run(api_port, api_stream, broker_handle, timing, api_token).await {
            tracing::error!(error = %e, "api server error");
        }
    });

    tracing::info!(port = config.api_port, "api server (http+ws) listening");
    tracing::info!("server ready");

    // --- Wait for Ctrl+C ---
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    // Signal all tasks to stop cooperatively. The stream stays open so
    // workers can still ack their in-flight batches.
    token.cancel();

    // Drain: wait up to 5s total for tasks to finish gracefully, then
    // abort stragglers
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    for mut h in handles {
        if tokio::time::timeout_at(deadline, &mut h).await.is_err() {
            h.abort();
            let _ = h.await;
        }
    }
    if tokio::time::timeout_at(deadline, &mut api_handle).await.is_err() {
        api_handle.abort();
        let _ = api_handle.await;
    }

    // Every worker has drained and acked; the stream can go away now.
    memory_stream.close();

    tracing::info!("shutdown complete");
    Ok(())
}
