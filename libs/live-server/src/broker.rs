use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_api::ConfirmedEvent;

pub type SubscriberId = u64;

/// Registry mutation requests. All register/unregister traffic funnels
/// through the broker's control loop; nothing else touches the registry.
enum Command {
    Register {
        id: SubscriberId,
        outbound: mpsc::Sender<String>,
    },
    Unregister {
        id: SubscriberId,
    },
}

// ═══════════════════════════════════════════════════════════════
//  Broker
// ═══════════════════════════════════════════════════════════════

/// Fan-out broker: one task owns the live-subscriber registry and relays
/// confirmed events to every subscriber's bounded outbound buffer.
///
/// Broadcast never awaits a subscriber. A full buffer drops that one
/// subscriber on the spot (its write pump observes the closed channel
/// and sends a Close frame); everyone else still receives the event.
/// One event is fully fanned out before the next is taken.
pub struct Broker {
    commands: mpsc::Receiver<Command>,
    events: mpsc::Receiver<ConfirmedEvent>,
    subscribers: HashMap<SubscriberId, mpsc::Sender<String>>,
}

/// What connections hold: a way to register and unregister, nothing
/// more. No reference back into the broker's internals.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<Command>,
    next_id: Arc<AtomicU64>,
    outbound_buffer: usize,
}

impl Broker {
    pub fn new(
        events: mpsc::Receiver<ConfirmedEvent>,
        outbound_buffer: usize,
    ) -> (Self, BrokerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let broker = Self {
            commands: cmd_rx,
            events,
            subscribers: HashMap::new(),
        };
        let handle = BrokerHandle {
            commands: cmd_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            outbound_buffer,
        };
        (broker, handle)
    }

    /// Control loop. Exits on cancellation or when both inbound channels
    /// close; on the way out every outbound sender is dropped, which
    /// makes each write pump deliver a Close frame and finish.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Register { id, outbound }) => {
                        self.subscribers.insert(id, outbound);
                        tracing::info!(subscriber = id, total = self.subscribers.len(), "registered");
                    }
                    Some(Command::Unregister { id }) => {
                        if self.subscribers.remove(&id).is_some() {
                            tracing::info!(subscriber = id, total = self.subscribers.len(), "unregistered");
                        }
                    }
                    None => break,
                },

                event = self.events.recv() => match event {
                    Some(event) => self.broadcast(&event),
                    None => break,
                },
            }
        }

        let remaining = self.subscribers.len();
        self.subscribers.clear();
        tracing::info!(subscribers = remaining, "broker stopped");
    }

    fn broadcast(&mut self, event: &ConfirmedEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "event serialization failed");
                return;
            }
        };

        self.subscribers.retain(|id, outbound| {
            match outbound.try_send(payload.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, "outbound buffer full, dropping subscriber");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

impl BrokerHandle {
    /// Register a new subscriber. Returns its id and the receiving end of
    /// its bounded outbound buffer, or `None` if the broker is gone.
    pub async fn register(&self) -> Option<(SubscriberId, mpsc::Receiver<String>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        self.commands
            .send(Command::Register { id, outbound: tx })
            .await
            .ok()?;
        Some((id, rx))
    }

    pub async fn unregister(&self, id: SubscriberId) {
        // Broker already stopped is fine: registry is gone with it.
        let _ = self.commands.send(Command::Unregister { id }).await;
    }
}
