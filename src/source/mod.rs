// SPDX-License-Identifier: MIT
//! Mail source seam.
//!
//! The poll scheduler drives a [`MailSource`] — a polling client over the
//! remote mailbox that receives all incoming mail for the disposable domain.
//! One [`MailSession`] is opened per poll cycle and owned exclusively by
//! that cycle. The production implementation is IMAP ([`imap::ImapSource`]);
//! tests script an in-memory source against the same traits.

pub mod imap;
pub mod parse;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use self::imap::ImapSource;

// ─── Checkpoint ───────────────────────────────────────────────────────────────

/// Durable poll position: the highest fully processed UID plus the
/// UIDVALIDITY generation it belongs to. Persisted by the store so a
/// restart never re-delivers already-processed mail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollCheckpoint {
    pub uid_validity: u32,
    pub last_uid: u32,
}

impl PollCheckpoint {
    /// Advance past a processed reference. UIDs only ever grow within one
    /// UIDVALIDITY generation.
    pub fn advance(&mut self, uid: u32) {
        if uid > self.last_uid {
            self.last_uid = uid;
        }
    }
}

/// Reference to one not-yet-fetched message in the source mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRef {
    pub uid: u32,
}

// ─── Fetched mail ─────────────────────────────────────────────────────────────

/// A fully fetched and parsed message, ready for routing.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Source-mail-system identifier (Message-ID header when present,
    /// otherwise derived from the UID). Idempotency key for delivery.
    pub source_id: String,
    /// Candidate recipient addresses (Delivered-To / To / Cc), lowercased
    /// and trimmed. The router picks the one that maps to a mailbox.
    pub recipients: Vec<String>,
    pub sender: String,
    pub subject: String,
    /// Assigned at fetch time, not taken from the (spoofable) Date header.
    pub received_at: DateTime<Utc>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<IncomingAttachment>,
}

#[derive(Debug, Clone)]
pub struct IncomingAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SourceError {
    /// Session-level failure (TCP, TLS, auth, folder selection). The whole
    /// cycle is aborted and retried with backoff.
    #[error("mail source connection failed: {0}")]
    Connection(String),

    /// One reference could not be fetched. The rest of the batch still
    /// processes; this reference is retried next cycle because the
    /// checkpoint does not advance past it.
    #[error("fetch failed for uid {uid}: {reason}")]
    Fetch { uid: u32, reason: String },

    /// The source returned something we could not interpret.
    #[error("mail source protocol error: {0}")]
    Protocol(String),
}

// ─── Traits ───────────────────────────────────────────────────────────────────

#[async_trait]
pub trait MailSource: Send + Sync {
    /// Open a session for one poll cycle.
    async fn connect(&self) -> Result<Box<dyn MailSession>, SourceError>;

    /// One-shot reachability/auth check for diagnostics. Default: open and
    /// close a session.
    async fn probe(&self) -> Result<(), SourceError> {
        let mut session = self.connect().await?;
        session.logout().await;
        Ok(())
    }
}

#[async_trait]
pub trait MailSession: Send {
    /// List references newer than `checkpoint`, in receive order. The
    /// returned checkpoint carries a possibly rebased UIDVALIDITY; the
    /// caller advances `last_uid` per processed reference.
    async fn list_new(
        &mut self,
        checkpoint: &PollCheckpoint,
    ) -> Result<(Vec<MessageRef>, PollCheckpoint), SourceError>;

    /// Fetch and parse one message.
    async fn fetch(&mut self, reference: MessageRef) -> Result<IncomingMessage, SourceError>;

    /// Best-effort logout. Errors are swallowed — the session is gone either
    /// way.
    async fn logout(&mut self);
}
