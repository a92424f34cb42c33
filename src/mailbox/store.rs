// SPDX-License-Identifier: MIT
// Mailbox SQLite storage — single source of truth for ownership, expiry,
// message history, and the poll checkpoint.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{LimitsConfig, OnExisting};
use crate::error::{EngineError, Result};
use crate::mailbox::model::{
    Delivery, Mailbox, MailboxStats, MessageSummary, StoredAttachment, StoredMessage,
};
use crate::source::{IncomingMessage, PollCheckpoint};

// ─── Raw DB rows ──────────────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct MailboxRow {
    id: String,
    owner_id: String,
    address: String,
    created_at: String,
    expires_at: String,
    active: i64,
    last_checked_at: Option<String>,
    message_count: i64,
    total_received: i64,
    deactivated_at: Option<String>,
    deactivation_reason: Option<String>,
}

impl From<MailboxRow> for Mailbox {
    fn from(r: MailboxRow) -> Mailbox {
        Mailbox {
            id: r.id,
            owner_id: r.owner_id,
            address: r.address,
            created_at: parse_ts(&r.created_at),
            expires_at: parse_ts(&r.expires_at),
            active: r.active != 0,
            last_checked_at: r.last_checked_at.as_deref().map(parse_ts),
            message_count: r.message_count,
            total_received: r.total_received,
            deactivated_at: r.deactivated_at.as_deref().map(parse_ts),
            deactivation_reason: r.deactivation_reason,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    address: String,
    source_id: String,
    received_at: String,
    subject: String,
    sender: String,
    body_text: String,
    body_html: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    address: String,
    subject: String,
    sender: String,
    received_at: String,
    attachment_count: i64,
}

impl From<SummaryRow> for MessageSummary {
    fn from(r: SummaryRow) -> MessageSummary {
        MessageSummary {
            id: r.id,
            address: r.address,
            subject: r.subject,
            sender: r.sender,
            received_at: parse_ts(&r.received_at),
            attachment_count: r.attachment_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: String,
    filename: String,
    content_type: String,
    size: i64,
    data: Vec<u8>,
}

/// RFC 3339 text column → UTC timestamp. Rows are only ever written by us,
/// so a parse failure means external tampering; fall back to "now" rather
/// than poisoning the read path.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Per-address serialization ────────────────────────────────────────────────

/// Async lock registry keyed by address. Every mutating path for a mailbox
/// (record, evict, deactivate, purge) holds its lock, so counters and
/// eviction order are deterministic no matter which background task or
/// request triggered the write.
#[derive(Default)]
struct AddressLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AddressLocks {
    async fn acquire(&self, address: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(address.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }
}

// ─── MailboxStore ─────────────────────────────────────────────────────────────

/// SQLite-backed store for mailboxes, messages, and the poll checkpoint.
pub struct MailboxStore {
    pool: SqlitePool,
    locks: AddressLocks,
    limits: LimitsConfig,
}

impl MailboxStore {
    /// Open (creating if missing) the database under `data_dir` and run
    /// idempotent migrations.
    pub async fn open(data_dir: &Path, limits: LimitsConfig) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| EngineError::Connection(format!("create data dir: {e}")))?;
        let db_path = data_dir.join("driftmail.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self {
            pool,
            locks: AddressLocks::default(),
            limits,
        })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for statement in [
            "CREATE TABLE IF NOT EXISTS mailboxes (
                id                  TEXT PRIMARY KEY,
                owner_id            TEXT NOT NULL,
                address             TEXT NOT NULL UNIQUE,
                created_at          TEXT NOT NULL,
                expires_at          TEXT NOT NULL,
                active              INTEGER NOT NULL DEFAULT 1,
                last_checked_at     TEXT,
                message_count       INTEGER NOT NULL DEFAULT 0,
                total_received      INTEGER NOT NULL DEFAULT 0,
                deactivated_at      TEXT,
                deactivation_reason TEXT,
                expiry_warning_sent INTEGER NOT NULL DEFAULT 0
            )",
            // One active mailbox per owner, enforced by the database itself.
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_mailboxes_owner_active
                 ON mailboxes(owner_id) WHERE active = 1",
            "CREATE INDEX IF NOT EXISTS idx_mailboxes_expires
                 ON mailboxes(active, expires_at)",
            "CREATE TABLE IF NOT EXISTS messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                address     TEXT NOT NULL,
                source_id   TEXT NOT NULL,
                received_at TEXT NOT NULL,
                subject     TEXT NOT NULL DEFAULT '',
                sender      TEXT NOT NULL DEFAULT '',
                body_text   TEXT NOT NULL DEFAULT '',
                body_html   TEXT,
                UNIQUE(address, source_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_address ON messages(address, seq)",
            "CREATE TABLE IF NOT EXISTS attachments (
                id           TEXT PRIMARY KEY,
                message_id   TEXT NOT NULL,
                filename     TEXT NOT NULL DEFAULT '',
                content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                size         INTEGER NOT NULL DEFAULT 0,
                data         BLOB NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)",
            "CREATE TABLE IF NOT EXISTS poll_state (
                id           INTEGER PRIMARY KEY CHECK (id = 1),
                uid_validity INTEGER NOT NULL,
                last_uid     INTEGER NOT NULL
            )",
        ] {
            sqlx::query(statement).execute(pool).await?;
        }
        Ok(())
    }

    // ── Mailbox lifecycle ─────────────────────────────────────────────────────

    /// Create a mailbox binding `owner_id` to `address`.
    ///
    /// If the owner already has an active mailbox the configured policy
    /// decides: `replace` retires the old one (messages purged) in the same
    /// call; `reject` fails with `DuplicateActiveMailbox`. The partial
    /// unique index on `(owner_id) WHERE active = 1` backstops races between
    /// concurrent create attempts.
    pub async fn create(&self, owner_id: &str, address: &str, ttl: ChronoDuration) -> Result<Mailbox> {
        if let Some(existing) = self.get_active(owner_id).await? {
            match self.limits.on_existing {
                OnExisting::Reject => {
                    return Err(EngineError::DuplicateActiveMailbox {
                        address: existing.address,
                    });
                }
                OnExisting::Replace => {
                    self.retire(&existing.address, "replaced").await?;
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires = now + ttl;

        let inserted = sqlx::query(
            "INSERT INTO mailboxes (id, owner_id, address, created_at, expires_at, active)
             VALUES (?, ?, ?, ?, ?, 1)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(address)
        .bind(now.to_rfc3339())
        .bind(expires.to_rfc3339())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            // Unique-index violation: another create for this owner won the
            // race between our read and our insert.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(EngineError::DuplicateActiveMailbox {
                    address: address.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(owner = %owner_id, address = %address, expires = %expires.to_rfc3339(), "mailbox created");

        let row: MailboxRow = sqlx::query_as("SELECT * FROM mailboxes WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    pub async fn get_active(&self, owner_id: &str) -> Result<Option<Mailbox>> {
        let row: Option<MailboxRow> =
            sqlx::query_as("SELECT * FROM mailboxes WHERE owner_id = ? AND active = 1")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    /// Latest mailbox for an owner regardless of active state (stats view).
    pub async fn get_latest(&self, owner_id: &str) -> Result<Option<Mailbox>> {
        let row: Option<MailboxRow> = sqlx::query_as(
            "SELECT * FROM mailboxes WHERE owner_id = ? ORDER BY created_at DESC LIMIT 1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_address(&self, address: &str) -> Result<Option<Mailbox>> {
        let row: Option<MailboxRow> =
            sqlx::query_as("SELECT * FROM mailboxes WHERE address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    /// True if `address` was ever allocated (active or retired). Addresses
    /// stay burned until the retention purge drops the row.
    pub async fn address_exists(&self, address: &str) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM mailboxes WHERE address = ?")
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 > 0)
    }

    /// Deactivate the owner's active mailbox (explicit deletion). Returns
    /// false when there was nothing to delete.
    pub async fn deactivate(&self, owner_id: &str) -> Result<bool> {
        match self.get_active(owner_id).await? {
            Some(mb) => {
                self.retire(&mb.address, "deleted").await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deactivate a mailbox by address and purge its messages, under the
    /// per-address lock. `reason` lands in `deactivation_reason`.
    async fn retire(&self, address: &str, reason: &str) -> Result<()> {
        let _guard = self.locks.acquire(address).await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE mailboxes
             SET active = 0, deactivated_at = ?, deactivation_reason = ?, message_count = 0
             WHERE address = ? AND active = 1",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(reason)
        .bind(address)
        .execute(&mut *tx)
        .await?;

        purge_messages_tx(&mut tx, address).await?;
        tx.commit().await?;

        info!(address = %address, reason = %reason, "mailbox retired");
        Ok(())
    }

    // ── Delivery ──────────────────────────────────────────────────────────────

    /// Record an incoming message for `address`.
    ///
    /// Idempotent on `(address, source_id)`: a repeat delivery returns
    /// `Duplicate` without touching counters. Insert, counter bumps, and
    /// oldest-first eviction past the inbox cap commit as one transaction,
    /// all under the per-address lock.
    pub async fn record_message(
        &self,
        address: &str,
        incoming: &IncomingMessage,
    ) -> Result<Delivery> {
        let _guard = self.locks.acquire(address).await;
        let mut tx = self.pool.begin().await?;

        // The mailbox may have been retired between routing and recording
        // (sweeper runs on its own cadence).
        let active: Option<(i64,)> =
            sqlx::query_as("SELECT active FROM mailboxes WHERE address = ? AND active = 1")
                .bind(address)
                .fetch_optional(&mut *tx)
                .await?;
        if active.is_none() {
            return Err(EngineError::NotFound("active mailbox"));
        }

        let id = Uuid::new_v4().to_string();
        let received = incoming.received_at.to_rfc3339();

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO messages
                 (id, address, source_id, received_at, subject, sender, body_text, body_html)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(address)
        .bind(&incoming.source_id)
        .bind(&received)
        .bind(&incoming.subject)
        .bind(&incoming.sender)
        .bind(&incoming.body_text)
        .bind(incoming.body_html.as_deref())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            debug!(address = %address, source_id = %incoming.source_id, "duplicate delivery ignored");
            return Ok(Delivery::Duplicate);
        }

        for attachment in &incoming.attachments {
            sqlx::query(
                "INSERT INTO attachments (id, message_id, filename, content_type, size, data)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(&attachment.filename)
            .bind(&attachment.content_type)
            .bind(attachment.data.len() as i64)
            .bind(&attachment.data)
            .execute(&mut *tx)
            .await?;
        }

        // Evict oldest past the cap, then refresh counters from the truth.
        let cap = self.limits.max_inbox_size as i64;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE address = ?")
                .bind(address)
                .fetch_one(&mut *tx)
                .await?;
        if count > cap {
            let victims: Vec<(String,)> = sqlx::query_as(
                "SELECT id FROM messages WHERE address = ? ORDER BY seq ASC LIMIT ?",
            )
            .bind(address)
            .bind(count - cap)
            .fetch_all(&mut *tx)
            .await?;
            for (victim,) in &victims {
                sqlx::query("DELETE FROM attachments WHERE message_id = ?")
                    .bind(victim)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM messages WHERE id = ?")
                    .bind(victim)
                    .execute(&mut *tx)
                    .await?;
            }
            debug!(address = %address, evicted = victims.len(), "inbox cap eviction");
        }

        sqlx::query(
            "UPDATE mailboxes
             SET total_received = total_received + 1,
                 message_count = (SELECT COUNT(*) FROM messages WHERE address = ?)
             WHERE address = ?",
        )
        .bind(address)
        .bind(address)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Delivery::Delivered(MessageSummary {
            id,
            address: address.to_string(),
            subject: incoming.subject.clone(),
            sender: incoming.sender.clone(),
            received_at: incoming.received_at,
            attachment_count: incoming.attachments.len() as i64,
        }))
    }

    /// Stamp the last successful poll that attended to this mailbox.
    pub async fn touch_last_checked(&self, address: &str) -> Result<()> {
        sqlx::query("UPDATE mailboxes SET last_checked_at = ? WHERE address = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Message queries ───────────────────────────────────────────────────────

    /// Message summaries for an address, newest first.
    pub async fn list_messages(&self, address: &str) -> Result<Vec<MessageSummary>> {
        let rows: Vec<SummaryRow> = sqlx::query_as(
            "SELECT m.id, m.address, m.subject, m.sender, m.received_at,
                    (SELECT COUNT(*) FROM attachments a WHERE a.message_id = m.id) AS attachment_count
             FROM messages m
             WHERE m.address = ?
             ORDER BY m.seq DESC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Full message (bodies + attachment bytes) by external id.
    pub async fn get_message(&self, address: &str, message_id: &str) -> Result<StoredMessage> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, address, source_id, received_at, subject, sender, body_text, body_html
             FROM messages WHERE address = ? AND id = ?",
        )
        .bind(address)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(EngineError::NotFound("message"))?;

        let attachments: Vec<AttachmentRow> = sqlx::query_as(
            "SELECT id, filename, content_type, size, data
             FROM attachments WHERE message_id = ? ORDER BY rowid",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(StoredMessage {
            id: row.id,
            address: row.address,
            source_id: row.source_id,
            received_at: parse_ts(&row.received_at),
            subject: row.subject,
            sender: row.sender,
            body_text: row.body_text,
            body_html: row.body_html,
            attachments: attachments
                .into_iter()
                .map(|a| StoredAttachment {
                    id: a.id,
                    filename: a.filename,
                    content_type: a.content_type,
                    size: a.size,
                    data: a.data,
                })
                .collect(),
        })
    }

    /// Owner statistics snapshot (latest mailbox, active or not).
    pub async fn stats(&self, owner_id: &str) -> Result<Option<MailboxStats>> {
        Ok(self
            .get_latest(owner_id)
            .await?
            .map(|mb| MailboxStats::from_mailbox(&mb, Utc::now())))
    }

    // ── Sweeping ──────────────────────────────────────────────────────────────

    /// Deactivate every active mailbox with `expires_at <= now`, purging its
    /// messages. Returns the deactivated mailboxes (pre-deactivation view)
    /// so the sweeper can emit one `Expired` event each.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Mailbox>> {
        let rows: Vec<MailboxRow> = sqlx::query_as(
            "SELECT * FROM mailboxes WHERE active = 1 AND expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut swept = Vec::with_capacity(rows.len());
        for row in rows {
            let mailbox: Mailbox = row.into();
            // Same serialization as record_message — an in-flight delivery
            // for this address finishes or fails atomically before the
            // mailbox goes away.
            let _guard = self.locks.acquire(&mailbox.address).await;
            let mut tx = self.pool.begin().await?;
            let updated = sqlx::query(
                "UPDATE mailboxes
                 SET active = 0, deactivated_at = ?, deactivation_reason = 'expired',
                     message_count = 0
                 WHERE address = ? AND active = 1",
            )
            .bind(now.to_rfc3339())
            .bind(&mailbox.address)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                // Lost a race with an explicit delete; nothing to report.
                continue;
            }
            purge_messages_tx(&mut tx, &mailbox.address).await?;
            tx.commit().await?;
            swept.push(mailbox);
        }
        Ok(swept)
    }

    /// Active mailboxes entering their final warning window, flagged so each
    /// is returned exactly once.
    pub async fn warn_expiring(
        &self,
        now: DateTime<Utc>,
        window: ChronoDuration,
    ) -> Result<Vec<Mailbox>> {
        let rows: Vec<MailboxRow> = sqlx::query_as(
            "SELECT * FROM mailboxes
             WHERE active = 1 AND expiry_warning_sent = 0
               AND expires_at > ? AND expires_at <= ?",
        )
        .bind(now.to_rfc3339())
        .bind((now + window).to_rfc3339())
        .fetch_all(&self.pool)
        .await?;

        let mut warned = Vec::with_capacity(rows.len());
        for row in rows {
            sqlx::query("UPDATE mailboxes SET expiry_warning_sent = 1 WHERE id = ?")
                .bind(&row.id)
                .execute(&self.pool)
                .await?;
            warned.push(row.into());
        }
        Ok(warned)
    }

    /// Hard-delete retired mailboxes past the retention window, releasing
    /// their addresses for reuse. Returns how many rows were dropped.
    pub async fn purge_retired(
        &self,
        now: DateTime<Utc>,
        retention: ChronoDuration,
    ) -> Result<u64> {
        let cutoff = (now - retention).to_rfc3339();
        let victims: Vec<(String,)> = sqlx::query_as(
            "SELECT address FROM mailboxes WHERE active = 0 AND deactivated_at < ?",
        )
        .bind(&cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut purged = 0u64;
        for (address,) in victims {
            let _guard = self.locks.acquire(&address).await;
            let mut tx = self.pool.begin().await?;
            purge_messages_tx(&mut tx, &address).await?;
            let res = sqlx::query("DELETE FROM mailboxes WHERE address = ? AND active = 0")
                .bind(&address)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            purged += res.rows_affected();
        }
        if purged > 0 {
            info!(count = purged, "retention purge dropped retired mailboxes");
        }
        Ok(purged)
    }

    // ── Poll checkpoint ───────────────────────────────────────────────────────

    pub async fn load_checkpoint(&self) -> Result<Option<PollCheckpoint>> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT uid_validity, last_uid FROM poll_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(validity, uid)| PollCheckpoint {
            uid_validity: validity as u32,
            last_uid: uid as u32,
        }))
    }

    /// Persist the checkpoint. Called after every processed reference so a
    /// crash mid-cycle re-fetches at most the in-flight message.
    pub async fn save_checkpoint(&self, checkpoint: &PollCheckpoint) -> Result<()> {
        sqlx::query(
            "INSERT INTO poll_state (id, uid_validity, last_uid) VALUES (1, ?, ?)
             ON CONFLICT(id) DO UPDATE SET uid_validity = excluded.uid_validity,
                                           last_uid = excluded.last_uid",
        )
        .bind(checkpoint.uid_validity as i64)
        .bind(checkpoint.last_uid as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cheap liveness probe for health reporting.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// Delete all messages (and their attachments) for an address inside an
/// open transaction.
async fn purge_messages_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    address: &str,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM attachments WHERE message_id IN
             (SELECT id FROM messages WHERE address = ?)",
    )
    .bind(address)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM messages WHERE address = ?")
        .bind(address)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
