// SPDX-License-Identifier: MIT
//! Engine event stream for the presentation layer.
//!
//! The engine never talks to a chat transport directly. Deliveries and
//! expiries are pushed onto a broadcast channel; whoever renders
//! notifications subscribes and formats them however it likes.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::mailbox::model::MessageSummary;

/// Push event emitted by the background tasks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EngineEvent {
    /// A new (non-duplicate) message landed in an active mailbox.
    Delivered {
        owner_id: String,
        message: MessageSummary,
    },
    /// A mailbox passed its TTL and was deactivated by the sweeper.
    Expired { owner_id: String, address: String },
    /// A mailbox enters its final warning window. Sent at most once.
    ExpiringSoon {
        owner_id: String,
        address: String,
        expires_at: String,
    },
}

/// Broadcasts [`EngineEvent`]s to all subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event. No subscribers is fine — the engine runs headless
    /// in tests and during startup.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
