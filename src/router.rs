// SPDX-License-Identifier: MIT
//! Maps a fetched message's recipients to the owning mailbox.

use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, Result};
use crate::mailbox::model::{Delivery, MessageSummary};
use crate::mailbox::store::MailboxStore;
use crate::source::IncomingMessage;

/// Routing outcome for one incoming message. Everything here counts as
/// "processed" for checkpoint purposes — only transport-level fetch failures
/// hold the checkpoint back.
#[derive(Debug)]
pub enum MatchResult {
    /// Matched an active mailbox and recorded as new.
    Delivered {
        owner_id: String,
        summary: MessageSummary,
    },
    /// Matched an active mailbox but this `source_id` was already recorded.
    Duplicate { address: String },
    /// No mailbox ever existed for any recipient. Discarded, never retried.
    Unmatched,
    /// A mailbox exists but is no longer active — late mail for a reclaimed
    /// address. Discarded.
    Expired { address: String },
}

pub struct Router {
    store: Arc<MailboxStore>,
    /// Lowercased domain suffix, e.g. `@drift.example`.
    domain_suffix: String,
}

impl Router {
    pub fn new(store: Arc<MailboxStore>, domain: &str) -> Self {
        Self {
            store,
            domain_suffix: format!("@{}", domain.to_lowercase()),
        }
    }

    /// Resolve the owning mailbox for `incoming` and hand it to the store.
    ///
    /// Recipient candidates are matched exactly (case-insensitive, trimmed)
    /// and must carry the disposable domain; foreign-domain recipients are
    /// ignored. The first candidate with a mailbox record decides the
    /// outcome.
    pub async fn route(&self, incoming: &IncomingMessage) -> Result<MatchResult> {
        for candidate in &incoming.recipients {
            let candidate = candidate.trim().to_lowercase();
            if !candidate.ends_with(&self.domain_suffix) {
                continue;
            }

            let mailbox = match self.store.get_by_address(&candidate).await? {
                Some(mb) => mb,
                None => continue,
            };

            if !mailbox.active {
                return Ok(MatchResult::Expired { address: candidate });
            }

            return match self.store.record_message(&candidate, incoming).await {
                Ok(Delivery::Delivered(summary)) => Ok(MatchResult::Delivered {
                    owner_id: mailbox.owner_id,
                    summary,
                }),
                Ok(Delivery::Duplicate) => Ok(MatchResult::Duplicate { address: candidate }),
                // Retired between our read and the store's re-check: treat
                // exactly like any other late arrival.
                Err(EngineError::NotFound(_)) => Ok(MatchResult::Expired { address: candidate }),
                Err(e) => Err(e),
            };
        }

        debug!(
            source_id = %incoming.source_id,
            recipients = ?incoming.recipients,
            "no mailbox for any recipient — discarding"
        );
        Ok(MatchResult::Unmatched)
    }
}
