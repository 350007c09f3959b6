use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_api::{ConfirmedEvent, PositionReport, PositionStore, PositionStream, StreamEntry};

// ═══════════════════════════════════════════════════════════════
//  WorkerConfig
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Consumer group shared by all worker instances.
    pub group: String,
    /// Identity of this instance within the group.
    pub consumer: String,
    /// Max entries claimed per poll.
    pub batch_size: usize,
    /// How long one poll blocks waiting for new entries.
    pub block: Duration,
    /// Delay before retrying after a transient stream failure.
    pub retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: "workers".to_string(),
            consumer: "worker-0".to_string(),
            batch_size: 200,
            block: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Worker
// ═══════════════════════════════════════════════════════════════

/// Ingestion worker: drains the position stream as part of a consumer
/// group, persists validated reports, and republishes confirmed events.
///
/// At-least-once: an entry is acknowledged only after its persistence
/// call succeeds. Validation and persistence failures leave the entry
/// pending. The confirmed-event publish is best-effort and never
/// affects ack state.
pub struct Worker {
    stream: Arc<dyn PositionStream>,
    store: Arc<dyn PositionStore>,
    events: mpsc::Sender<ConfirmedEvent>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        stream: Arc<dyn PositionStream>,
        store: Arc<dyn PositionStore>,
        events: mpsc::Sender<ConfirmedEvent>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            stream,
            store,
            events,
            config,
        }
    }

    /// Poll loop. Runs until `shutdown` is cancelled; the cancellation is
    /// observed between batches, so an in-flight batch always drains.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            group = %self.config.group,
            consumer = %self.config.consumer,
            "worker starting"
        );

        loop {
            let batch = tokio::select! {
                result = self.stream.read_group(
                    &self.config.group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.block,
                ) => result,
                _ = shutdown.cancelled() => break,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    // Transient: back off and retry forever, but stay
                    // responsive to shutdown during the delay.
                    tracing::warn!(
                        consumer = %self.config.consumer,
                        error = %e,
                        "stream read failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_delay) => continue,
                        _ = shutdown.cancelled() => break,
                    }
                }
            };

            for entry in batch {
                self.process_entry(entry).await;
            }
        }

        tracing::info!(consumer = %self.config.consumer, "worker stopped");
    }

    async fn process_entry(&self, entry: StreamEntry) {
        let report = match PositionReport::decode(&entry.fields) {
            Ok(report) => report,
            Err(e) => {
                // Not acknowledged: the malformed entry stays pending.
                tracing::warn!(entry = %entry.id, error = %e, "invalid entry, skipping");
                return;
            }
        };

        if let Err(e) = self
            .store
            .insert_position(
                &report.bus_id,
                report.timestamp,
                report.latitude,
                report.longitude,
                report.speed_kph,
                &entry.fields,
            )
            .await
        {
            // Not acknowledged: redelivered on a future poll.
            tracing::warn!(entry = %entry.id, error = %e, "persist failed, leaving pending");
            return;
        }

        if let Err(e) = self.stream.ack(&self.config.group, entry.id).await {
            tracing::warn!(entry = %entry.id, error = %e, "ack failed");
        }

        // The row is already durable; the notification is best-effort.
        let msg_id = entry
            .fields
            .get("msgId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| entry.id.to_string());
        let event = ConfirmedEvent::from_report(msg_id, &report);
        if let Err(e) = self.events.try_send(event) {
            tracing::warn!(entry = %entry.id, error = %e, "event publish failed");
        }
    }
}
