// SPDX-License-Identifier: MIT
// IMAP mail source — blocking `imap` sessions driven through spawn_blocking.
//
// The source mailbox is a single catch-all INBOX for the whole disposable
// domain; new mail is discovered with `UID SEARCH UID {last+1}:*` against
// the persisted checkpoint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::ImapConfig;

use super::{
    parse::parse_rfc822, IncomingMessage, MailSession, MailSource, MessageRef, PollCheckpoint,
    SourceError,
};

// ─── ImapSource ───────────────────────────────────────────────────────────────

/// Connection factory; one blocking session per poll cycle.
pub struct ImapSource {
    config: ImapConfig,
}

impl ImapSource {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailSource for ImapSource {
    async fn connect(&self) -> Result<Box<dyn MailSession>, SourceError> {
        let config = self.config.clone();
        let budget = Duration::from_secs(self.config.connect_timeout_secs.max(1));

        // The blocking connect cannot be cancelled, but the cycle should not
        // wait past its budget for a dead server.
        let join = tokio::time::timeout(
            budget,
            tokio::task::spawn_blocking(move || open_session(&config)),
        )
        .await
        .map_err(|_| {
            SourceError::Connection(format!(
                "connect timed out after {}s",
                budget.as_secs()
            ))
        })?;

        let session = join
            .map_err(|e| SourceError::Connection(format!("connect task failed: {e}")))??;

        Ok(Box::new(ImapMailSession {
            session: Some(session),
            folder: self.config.folder.clone(),
        }))
    }
}

// ─── Blocking session plumbing ────────────────────────────────────────────────

type TlsSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;
type PlainSession = imap::Session<std::net::TcpStream>;

/// TLS and plaintext sessions unified behind one dispatch surface.
enum RawSession {
    Tls(TlsSession),
    Plain(PlainSession),
}

impl RawSession {
    fn select(&mut self, folder: &str) -> imap::error::Result<imap::types::Mailbox> {
        match self {
            RawSession::Tls(s) => s.select(folder),
            RawSession::Plain(s) => s.select(folder),
        }
    }

    fn uid_search(&mut self, query: &str) -> imap::error::Result<std::collections::HashSet<u32>> {
        match self {
            RawSession::Tls(s) => s.uid_search(query),
            RawSession::Plain(s) => s.uid_search(query),
        }
    }

    fn uid_fetch(
        &mut self,
        uid_set: &str,
        query: &str,
    ) -> imap::error::Result<imap::types::ZeroCopy<Vec<imap::types::Fetch>>> {
        match self {
            RawSession::Tls(s) => s.uid_fetch(uid_set, query),
            RawSession::Plain(s) => s.uid_fetch(uid_set, query),
        }
    }

    fn logout(&mut self) -> imap::error::Result<()> {
        match self {
            RawSession::Tls(s) => s.logout(),
            RawSession::Plain(s) => s.logout(),
        }
    }
}

fn open_session(config: &ImapConfig) -> Result<RawSession, SourceError> {
    let target = (config.host.as_str(), config.port);
    if config.use_tls {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| SourceError::Connection(format!("tls setup: {e}")))?;
        let client = imap::connect(target, config.host.as_str(), &tls)
            .map_err(|e| SourceError::Connection(format!("connect {}:{}: {e}", config.host, config.port)))?;
        let session = client
            .login(&config.username, &config.password)
            .map_err(|(e, _client)| SourceError::Connection(format!("login: {e}")))?;
        Ok(RawSession::Tls(session))
    } else {
        let client = imap::connect_insecure(target)
            .map_err(|e| SourceError::Connection(format!("connect {}:{}: {e}", config.host, config.port)))?;
        let session = client
            .login(&config.username, &config.password)
            .map_err(|(e, _client)| SourceError::Connection(format!("login: {e}")))?;
        Ok(RawSession::Plain(session))
    }
}

/// One cycle's exclusive session. Blocking IMAP calls run on the blocking
/// pool with the session moved in and back out.
struct ImapMailSession {
    session: Option<RawSession>,
    folder: String,
}

impl ImapMailSession {
    async fn with_session<T, F>(&mut self, op: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut RawSession) -> Result<T, SourceError> + Send + 'static,
    {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| SourceError::Connection("session already closed".to_string()))?;

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut session);
            (session, result)
        })
        .await
        .map_err(|e| SourceError::Connection(format!("blocking task failed: {e}")))?;

        self.session = Some(session);
        result
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn list_new(
        &mut self,
        checkpoint: &PollCheckpoint,
    ) -> Result<(Vec<MessageRef>, PollCheckpoint), SourceError> {
        let folder = self.folder.clone();
        let checkpoint = *checkpoint;

        self.with_session(move |session| {
            let mailbox = session
                .select(&folder)
                .map_err(|e| SourceError::Connection(format!("select {folder}: {e}")))?;

            let validity = mailbox.uid_validity.unwrap_or(0);
            let mut rebased = checkpoint;
            if validity != rebased.uid_validity {
                // The server renumbered the mailbox. Start over; message-id
                // dedup absorbs anything we end up re-listing.
                warn!(
                    old = rebased.uid_validity,
                    new = validity,
                    "UIDVALIDITY changed — rebasing checkpoint"
                );
                rebased = PollCheckpoint {
                    uid_validity: validity,
                    last_uid: 0,
                };
            }

            let query = format!("UID {}:*", rebased.last_uid + 1);
            let uids = session
                .uid_search(&query)
                .map_err(|e| SourceError::Connection(format!("uid search: {e}")))?;

            // `n:*` always matches the newest message even when n is past
            // the end of the mailbox; drop anything at or below the mark.
            let mut fresh: Vec<u32> = uids
                .into_iter()
                .filter(|uid| *uid > rebased.last_uid)
                .collect();
            fresh.sort_unstable();

            debug!(count = fresh.len(), after = rebased.last_uid, "listed new references");
            Ok((
                fresh.into_iter().map(|uid| MessageRef { uid }).collect(),
                rebased,
            ))
        })
        .await
    }

    async fn fetch(&mut self, reference: MessageRef) -> Result<IncomingMessage, SourceError> {
        let uid = reference.uid;

        self.with_session(move |session| {
            let fetches = session
                .uid_fetch(&uid.to_string(), "(RFC822 UID)")
                .map_err(|e| SourceError::Fetch {
                    uid,
                    reason: e.to_string(),
                })?;

            let fetch = fetches
                .iter()
                .find(|f| f.uid == Some(uid))
                .ok_or_else(|| SourceError::Fetch {
                    uid,
                    reason: "server returned no matching fetch item".to_string(),
                })?;

            let raw = fetch.body().ok_or_else(|| SourceError::Fetch {
                uid,
                reason: "fetch item carried no body".to_string(),
            })?;

            parse_rfc822(raw, uid, Utc::now())
        })
        .await
    }

    async fn logout(&mut self) {
        let result = self
            .with_session(|session| {
                session
                    .logout()
                    .map_err(|e| SourceError::Connection(e.to_string()))
            })
            .await;
        if let Err(e) = result {
            debug!(err = %e, "imap logout failed (ignored)");
        }
        self.session = None;
    }
}
