//! Internal event bus plus fan-out to transport-specific subscribers.
//!
//! Producers (ledger, settlement, scheduler) publish onto the [`EventBus`]
//! after their storage transaction commits. The [`StateNotifier`] drains the
//! bus on a background task and hands every event to each registered
//! [`EventSink`]. In-process consumers can also `subscribe()` directly.

use crate::error::Result;
use crate::types::{Phase, Side};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GameEvent {
    PhaseChanged {
        from: Phase,
        to: Phase,
        round_id: Option<String>,
        phase_ends_at: DateTime<Utc>,
    },
    RoundSettled {
        round_id: String,
        outcome: Side,
    },
    BalanceChanged {
        user_id: String,
        new_balance: i64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GameEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to whoever is listening. Having no listeners is not an error.
    pub fn publish(&self, event: GameEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No subscribers for game event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.sender.subscribe()
    }
}

/// A transport that receives every event (websocket hub, SSE stream, ...).
#[async_trait]
pub trait EventSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &GameEvent) -> Result<()>;
}

/// Sink that writes events to the log.
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, event: &GameEvent) -> Result<()> {
        match event {
            GameEvent::PhaseChanged { from, to, .. } => {
                tracing::info!("Phase changed: {} -> {}", from, to)
            }
            GameEvent::RoundSettled { round_id, outcome } => {
                tracing::info!("Round {} settled: {}", round_id, outcome)
            }
            GameEvent::BalanceChanged {
                user_id,
                new_balance,
            } => tracing::debug!("Balance of {} is now {}", user_id, new_balance),
        }
        Ok(())
    }
}

pub struct StateNotifier {
    bus: EventBus,
    sinks: Arc<RwLock<Vec<Arc<dyn EventSink>>>>,
}

impl StateNotifier {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            sinks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.bus.subscribe()
    }

    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        tracing::debug!("Registered event sink '{}'", sink.name());
        self.sinks.write().push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.read().len()
    }

    /// Start the fan-out task. It ends when every bus sender is dropped.
    pub fn spawn(&self) -> JoinHandle<()> {
        let mut receiver = self.bus.subscribe();
        let sinks = self.sinks.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        let targets: Vec<Arc<dyn EventSink>> = sinks.read().clone();
                        for sink in targets {
                            if let Err(e) = sink.deliver(&event).await {
                                tracing::warn!("Event sink '{}' failed: {}", sink.name(), e);
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("State notifier lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("State notifier stopped");
        })
    }
}
