// SPDX-License-Identifier: MIT
//! Expiry sweeper — deactivates mailboxes past their TTL, warns the ones
//! about to go, and eventually drops long-retired rows.
//!
//! Runs on its own cadence, independent of the poll scheduler. Deactivation
//! happens under the same per-address serialization as message recording,
//! so an in-flight delivery can never resurrect or corrupt a swept mailbox.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::{LimitsConfig, PollingConfig};
use crate::error::Result;
use crate::events::{EngineEvent, EventBus};
use crate::mailbox::store::MailboxStore;

pub struct Sweeper {
    store: Arc<MailboxStore>,
    events: EventBus,
    polling: PollingConfig,
    limits: LimitsConfig,
}

/// Tallies for one sweep run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepOutcome {
    pub expired: usize,
    pub warned: usize,
    pub purged: u64,
}

impl Sweeper {
    pub fn new(
        store: Arc<MailboxStore>,
        events: EventBus,
        polling: PollingConfig,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            store,
            events,
            polling,
            limits,
        }
    }

    /// The recurring loop. Errors are logged at the task boundary and the
    /// schedule continues; a run that exceeds its budget is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.polling.sweep_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let budget = Duration::from_secs(self.polling.sweep_timeout_secs.max(1));

        loop {
            ticker.tick().await;

            match timeout(budget, self.run_once(Utc::now())).await {
                Ok(Ok(outcome)) => {
                    if outcome.expired > 0 || outcome.purged > 0 {
                        info!(
                            expired = outcome.expired,
                            warned = outcome.warned,
                            purged = outcome.purged,
                            "sweep done"
                        );
                    }
                }
                Ok(Err(e)) => warn!(err = %e, "sweep failed"),
                Err(_) => warn!(seconds = budget.as_secs(), "sweep timed out"),
            }
        }
    }

    /// One sweep pass at `now`. Public so tests (and shutdown paths) can
    /// drive sweeps deterministically.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepOutcome> {
        let mut outcome = SweepOutcome::default();

        for mailbox in self.store.sweep_expired(now).await? {
            info!(owner = %mailbox.owner_id, address = %mailbox.address, "mailbox expired");
            self.events.publish(EngineEvent::Expired {
                owner_id: mailbox.owner_id,
                address: mailbox.address,
            });
            outcome.expired += 1;
        }

        if self.polling.expiry_warn_secs > 0 {
            let window = ChronoDuration::seconds(self.polling.expiry_warn_secs as i64);
            for mailbox in self.store.warn_expiring(now, window).await? {
                self.events.publish(EngineEvent::ExpiringSoon {
                    owner_id: mailbox.owner_id,
                    address: mailbox.address,
                    expires_at: mailbox.expires_at.to_rfc3339(),
                });
                outcome.warned += 1;
            }
        }

        let retention = ChronoDuration::days(self.limits.retention_days as i64);
        outcome.purged = self.store.purge_retired(now, retention).await?;

        Ok(outcome)
    }
}
