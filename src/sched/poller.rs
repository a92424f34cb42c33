// SPDX-License-Identifier: MIT
//! Poll scheduler — the recurring cycle that drains the mail source.
//!
//! Cycle shape: connect → list references since checkpoint → per reference
//! fetch → route → record → notify → advance checkpoint. The checkpoint is
//! persisted after every processed reference, so a crash or timeout loses at
//! most the in-flight message, and a restart re-fetches exactly the
//! unprocessed tail.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PollingConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::mailbox::store::MailboxStore;
use crate::router::{MatchResult, Router};
use crate::sched::backoff::{next_backoff, BackoffConfig};
use crate::source::{MailSource, SourceError};

// ─── Stats ────────────────────────────────────────────────────────────────────

/// Lifetime counters for the poll loop, shared with the health surface.
#[derive(Default)]
pub struct PollStats {
    pub cycles_completed: AtomicU64,
    pub cycles_failed: AtomicU64,
    pub cycles_timed_out: AtomicU64,
    pub delivered: AtomicU64,
    pub duplicates: AtomicU64,
    pub unmatched: AtomicU64,
    pub discarded_expired: AtomicU64,
    pub fetch_failures: AtomicU64,
    last_cycle_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStatsSnapshot {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_timed_out: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub unmatched: u64,
    pub discarded_expired: u64,
    pub fetch_failures: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl PollStats {
    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            cycles_timed_out: self.cycles_timed_out.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            discarded_expired: self.discarded_expired.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            last_cycle_at: *self.last_cycle_at.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }

    fn mark_cycle(&self) {
        *self.last_cycle_at.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
    }
}

/// Per-cycle tallies, mostly for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub listed: usize,
    pub delivered: u64,
    pub duplicates: u64,
    pub unmatched: u64,
    pub discarded_expired: u64,
    pub fetch_failures: u64,
}

// ─── Poller ───────────────────────────────────────────────────────────────────

pub struct Poller {
    store: Arc<MailboxStore>,
    source: Arc<dyn MailSource>,
    router: Router,
    events: EventBus,
    config: PollingConfig,
    stats: Arc<PollStats>,
    /// Bounds concurrent mail-source sessions to one: the scheduled loop and
    /// on-demand polls all run their cycle under this lock.
    cycle_gate: Mutex<()>,
    poll_now: Notify,
}

impl Poller {
    pub fn new(
        store: Arc<MailboxStore>,
        source: Arc<dyn MailSource>,
        router: Router,
        events: EventBus,
        config: PollingConfig,
    ) -> Self {
        Self {
            store,
            source,
            router,
            events,
            config,
            stats: Arc::new(PollStats::default()),
            cycle_gate: Mutex::new(()),
            poll_now: Notify::new(),
        }
    }

    pub fn stats(&self) -> Arc<PollStats> {
        Arc::clone(&self.stats)
    }

    /// Request an immediate cycle (e.g. a user hit "refresh"). Coalesces
    /// with any already-pending request.
    pub fn trigger(&self) {
        self.poll_now.notify_one();
    }

    /// The recurring loop. Runs until the task is aborted at shutdown.
    ///
    /// Errors never escape: a failed cycle is logged, connection-level
    /// failures back off exponentially, and the schedule continues. A tick
    /// that fires while a cycle is still running is skipped, not queued.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let backoff = BackoffConfig {
            base_ms: self.config.backoff_base_ms,
            max_ms: self.config.backoff_max_ms,
            ..BackoffConfig::default()
        };
        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.poll_now.notified() => {
                    debug!("on-demand poll requested");
                }
            }

            match self.execute_cycle().await {
                Ok(outcome) => {
                    consecutive_failures = 0;
                    if outcome.listed > 0 {
                        info!(
                            listed = outcome.listed,
                            delivered = outcome.delivered,
                            duplicates = outcome.duplicates,
                            unmatched = outcome.unmatched,
                            expired = outcome.discarded_expired,
                            fetch_failures = outcome.fetch_failures,
                            "poll cycle done"
                        );
                    }
                }
                Err(EngineError::Timeout { seconds }) => {
                    warn!(seconds, "poll cycle timed out — progress kept, waiting for next tick");
                }
                Err(EngineError::Connection(reason)) => {
                    consecutive_failures += 1;
                    let delay = next_backoff(consecutive_failures.saturating_sub(1), &backoff);
                    warn!(
                        err = %reason,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "mail source unreachable — backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Store-level trouble: nothing a backoff against the
                    // mail source would fix. Log and keep the schedule.
                    warn!(err = %e, "poll cycle aborted");
                }
            }
        }
    }

    /// Run one full poll cycle under the overlap gate and the cycle
    /// wall-clock budget. Public so the engine (and tests) can drive
    /// deterministic cycles.
    pub async fn execute_cycle(&self) -> Result<CycleOutcome> {
        let _gate = self.cycle_gate.lock().await;
        let budget = Duration::from_secs(self.config.cycle_timeout_secs.max(1));

        let result = match timeout(budget, self.cycle_inner()).await {
            Ok(result) => result,
            Err(_) => {
                self.stats.cycles_timed_out.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::Timeout {
                    seconds: budget.as_secs(),
                })
            }
        };

        match &result {
            Ok(outcome) => {
                self.stats.cycles_completed.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .delivered
                    .fetch_add(outcome.delivered, Ordering::Relaxed);
                self.stats
                    .duplicates
                    .fetch_add(outcome.duplicates, Ordering::Relaxed);
                self.stats
                    .unmatched
                    .fetch_add(outcome.unmatched, Ordering::Relaxed);
                self.stats
                    .discarded_expired
                    .fetch_add(outcome.discarded_expired, Ordering::Relaxed);
                self.stats
                    .fetch_failures
                    .fetch_add(outcome.fetch_failures, Ordering::Relaxed);
                self.stats.mark_cycle();
            }
            Err(_) => {
                self.stats.cycles_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn cycle_inner(&self) -> Result<CycleOutcome> {
        let stored = self.store.load_checkpoint().await?.unwrap_or_default();

        let mut session = self
            .source
            .connect()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        let (references, mut checkpoint) = session
            .list_new(&stored)
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        // A UIDVALIDITY rebase must be durable before we process under it.
        if checkpoint != stored {
            self.store.save_checkpoint(&checkpoint).await?;
        }

        let mut outcome = CycleOutcome {
            listed: references.len(),
            ..CycleOutcome::default()
        };
        // Once one reference fails to fetch, later references still process
        // (idempotency absorbs their re-delivery next cycle) but the
        // checkpoint stays put so the failed one is retried.
        let mut advancing = true;

        for reference in references {
            let incoming = match session.fetch(reference).await {
                Ok(message) => message,
                Err(SourceError::Fetch { uid, reason }) => {
                    warn!(uid, reason = %reason, "fetch failed — reference retried next cycle");
                    outcome.fetch_failures += 1;
                    advancing = false;
                    continue;
                }
                // A message we cannot parse will never parse; discarding it
                // counts as processed, otherwise it would poison the queue.
                Err(SourceError::Protocol(reason)) => {
                    warn!(uid = reference.uid, reason = %reason, "unparseable message — discarded");
                    outcome.unmatched += 1;
                    if advancing {
                        checkpoint.advance(reference.uid);
                        self.store.save_checkpoint(&checkpoint).await?;
                    }
                    continue;
                }
                Err(e) => {
                    session.logout().await;
                    return Err(EngineError::Connection(e.to_string()));
                }
            };

            match self.router.route(&incoming).await? {
                MatchResult::Delivered { owner_id, summary } => {
                    outcome.delivered += 1;
                    self.store.touch_last_checked(&summary.address).await?;
                    debug!(owner = %owner_id, address = %summary.address, subject = %summary.subject, "message delivered");
                    self.events.publish(EngineEvent::Delivered {
                        owner_id,
                        message: summary,
                    });
                }
                MatchResult::Duplicate { address } => {
                    outcome.duplicates += 1;
                    debug!(address = %address, "duplicate delivery — no notification");
                }
                MatchResult::Unmatched => {
                    outcome.unmatched += 1;
                }
                MatchResult::Expired { address } => {
                    outcome.discarded_expired += 1;
                    debug!(address = %address, "late mail for retired address — discarded");
                }
            }

            if advancing {
                checkpoint.advance(reference.uid);
                self.store.save_checkpoint(&checkpoint).await?;
            }
        }

        session.logout().await;
        Ok(outcome)
    }
}
