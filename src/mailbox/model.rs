// SPDX-License-Identifier: MIT
// Mailbox data model — one disposable address bound to one owner.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

// ─── Mailbox ──────────────────────────────────────────────────────────────────

/// A disposable mailbox: the record binding an owner to a generated address
/// and its message history. Soft-deleted (`active = false`) on expiry or
/// explicit deletion; the row survives until the retention purge so the
/// address can never be handed to a new owner while stale mail might still
/// arrive for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mailbox {
    pub id: String,
    /// Opaque identifier of the requesting principal (chat user, API key, …).
    pub owner_id: String,
    pub address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    /// Last poll cycle that attended to this mailbox's traffic.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Messages currently in the inbox (capped; oldest evicted first).
    pub message_count: i64,
    /// Lifetime deliveries. Never decremented.
    pub total_received: i64,
    pub deactivated_at: Option<DateTime<Utc>>,
    /// "expired" | "deleted" | "replaced".
    pub deactivation_reason: Option<String>,
}

impl Mailbox {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, clamped at zero.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> ChronoDuration {
        (self.expires_at - now).max(ChronoDuration::zero())
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// Lightweight view of a stored message, newest-first in listings and
/// carried in `Delivered` events. Bodies and attachment bytes stay behind
/// `get_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    pub id: String,
    pub address: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub attachment_count: i64,
}

/// A fully materialized stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub address: String,
    /// Source-mail-system identifier; the idempotency key for delivery.
    pub source_id: String,
    pub received_at: DateTime<Utc>,
    pub subject: String,
    pub sender: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<StoredAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAttachment {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub data: Vec<u8>,
}

/// Outcome of `record_message` — at-most-once notification hangs off this:
/// only `Delivered` produces an event.
#[derive(Debug, Clone)]
pub enum Delivery {
    Delivered(MessageSummary),
    /// Same `source_id` was already recorded for this address. No counter
    /// moves, no new event.
    Duplicate,
}

// ─── Stats ────────────────────────────────────────────────────────────────────

/// Per-owner statistics snapshot for presentation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxStats {
    pub address: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub time_remaining_secs: i64,
    pub message_count: i64,
    pub total_received: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl MailboxStats {
    pub fn from_mailbox(mailbox: &Mailbox, now: DateTime<Utc>) -> Self {
        Self {
            address: mailbox.address.clone(),
            active: mailbox.active,
            created_at: mailbox.created_at,
            expires_at: mailbox.expires_at,
            time_remaining_secs: if mailbox.active {
                mailbox.time_remaining(now).num_seconds()
            } else {
                0
            },
            message_count: mailbox.message_count,
            total_received: mailbox.total_received,
            last_checked_at: mailbox.last_checked_at,
        }
    }
}
