// SPDX-License-Identifier: MIT
//! The engine facade — everything the presentation layer is allowed to
//! touch.
//!
//! One `Engine` instance owns the store, the mail source, and both
//! background tasks. Chat/transport glue calls the typed operations below
//! and subscribes to the event stream for push notifications; it never
//! reaches around the engine into shared state.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mailbox::addrgen::AddressGenerator;
use crate::mailbox::model::{Mailbox, MailboxStats, MessageSummary, StoredMessage};
use crate::mailbox::store::MailboxStore;
use crate::router::Router;
use crate::sched::poller::{CycleOutcome, PollStatsSnapshot, Poller};
use crate::sched::sweeper::{SweepOutcome, Sweeper};
use crate::source::MailSource;

// ─── Health ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub store_reachable: bool,
    pub uptime_secs: u64,
    pub poll: PollStatsSnapshot,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<MailboxStore>,
    source: Arc<dyn MailSource>,
    events: EventBus,
    addrgen: AddressGenerator,
    poller: Arc<Poller>,
    sweeper: Arc<Sweeper>,
    started_at: Instant,
}

impl Engine {
    /// Open the store under `config.data_dir` and wire up the engine.
    pub async fn new(config: Arc<EngineConfig>, source: Arc<dyn MailSource>) -> Result<Self> {
        let store =
            Arc::new(MailboxStore::open(&config.data_dir, config.limits.clone()).await?);
        Ok(Self::with_store(config, source, store))
    }

    /// Wire up the engine around an already-opened store (tests).
    pub fn with_store(
        config: Arc<EngineConfig>,
        source: Arc<dyn MailSource>,
        store: Arc<MailboxStore>,
    ) -> Self {
        let events = EventBus::new();
        let router = Router::new(Arc::clone(&store), &config.addresses.domain);
        let poller = Arc::new(Poller::new(
            Arc::clone(&store),
            Arc::clone(&source),
            router,
            events.clone(),
            config.polling.clone(),
        ));
        let sweeper = Arc::new(Sweeper::new(
            Arc::clone(&store),
            events.clone(),
            config.polling.clone(),
            config.limits.clone(),
        ));
        let addrgen = AddressGenerator::new(config.addresses.clone());

        Self {
            config,
            store,
            source,
            events,
            addrgen,
            poller,
            sweeper,
            started_at: Instant::now(),
        }
    }

    /// Spawn both background tasks. Returns their handles so the caller can
    /// abort them at shutdown.
    pub fn start(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        (
            tokio::spawn(Arc::clone(&self.poller).run()),
            tokio::spawn(Arc::clone(&self.sweeper).run()),
        )
    }

    /// Subscribe to delivery/expiry push events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // ── Mailbox operations ────────────────────────────────────────────────────

    /// Allocate a disposable address and bind it to `owner_id`.
    ///
    /// With the default `replace` policy an existing active mailbox is
    /// retired in the same call; with `reject` this fails instead.
    pub async fn create_mailbox(
        &self,
        owner_id: &str,
        prefix: Option<&str>,
    ) -> Result<Mailbox> {
        let address = self.addrgen.generate(&self.store, prefix).await?;
        let ttl = ChronoDuration::seconds(self.config.limits.ttl_secs as i64);
        self.store.create(owner_id, &address, ttl).await
    }

    /// The owner's active mailbox, if any.
    pub async fn get_status(&self, owner_id: &str) -> Result<Option<Mailbox>> {
        self.store.get_active(owner_id).await
    }

    /// Message summaries for the owner's active mailbox, newest first.
    pub async fn list_messages(&self, owner_id: &str) -> Result<Vec<MessageSummary>> {
        let mailbox = self
            .store
            .get_active(owner_id)
            .await?
            .ok_or(EngineError::NotFound("active mailbox"))?;
        self.store.list_messages(&mailbox.address).await
    }

    /// Full message by id, scoped to the owner's active mailbox.
    pub async fn get_message(&self, owner_id: &str, message_id: &str) -> Result<StoredMessage> {
        let mailbox = self
            .store
            .get_active(owner_id)
            .await?
            .ok_or(EngineError::NotFound("active mailbox"))?;
        self.store.get_message(&mailbox.address, message_id).await
    }

    /// Explicitly delete the owner's mailbox. Returns false when there was
    /// nothing to delete.
    pub async fn delete_mailbox(&self, owner_id: &str) -> Result<bool> {
        self.store.deactivate(owner_id).await
    }

    /// Statistics snapshot for the owner's latest mailbox (active or not).
    pub async fn stats(&self, owner_id: &str) -> Result<Option<MailboxStats>> {
        self.store.stats(owner_id).await
    }

    // ── Background task surface ───────────────────────────────────────────────

    /// Nudge the poll loop to run a cycle now instead of waiting for the
    /// next tick. Fire-and-forget.
    pub fn poll_now(&self) {
        self.poller.trigger();
    }

    /// Run one poll cycle to completion (serialized with the background
    /// loop). Used by tests and synchronous "refresh" flows.
    pub async fn poll_once(&self) -> Result<CycleOutcome> {
        self.poller.execute_cycle().await
    }

    /// Run one sweep pass at the current time.
    pub async fn sweep_once(&self) -> Result<SweepOutcome> {
        self.sweeper.run_once(Utc::now()).await
    }

    /// One-shot mail source reachability/auth check.
    pub async fn probe_source(&self) -> Result<()> {
        self.source
            .probe()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))
    }

    pub async fn health(&self) -> HealthReport {
        let store_reachable = self.store.ping().await;
        let poll = self.poller.stats().snapshot();
        let status = if store_reachable { "healthy" } else { "degraded" };
        HealthReport {
            status,
            store_reachable,
            uptime_secs: self.started_at.elapsed().as_secs(),
            poll,
        }
    }
}
