// SPDX-License-Identifier: MIT
//! Shared test fixtures: a scripted in-memory mail source and config/store
//! builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use driftmail::config::{EngineConfig, LimitsConfig};
use driftmail::mailbox::store::MailboxStore;
use driftmail::source::{
    IncomingMessage, MailSession, MailSource, MessageRef, PollCheckpoint, SourceError,
};

// ─── Config / store builders ──────────────────────────────────────────────────

/// A fully validated config pointed at a temp data dir.
pub fn test_config(data_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.addresses.domain = "drift.test".to_string();
    config.imap.host = "mail.drift.test".to_string();
    config.imap.username = "catchall@drift.test".to_string();
    config.imap.password = "secret".to_string();
    config
}

pub async fn open_store(data_dir: &Path, limits: LimitsConfig) -> MailboxStore {
    MailboxStore::open(data_dir, limits).await.unwrap()
}

/// Build an incoming message addressed to `to`.
pub fn incoming(source_id: &str, to: &str, subject: &str) -> IncomingMessage {
    IncomingMessage {
        source_id: source_id.to_string(),
        recipients: vec![to.to_lowercase()],
        sender: "someone@elsewhere.example".to_string(),
        subject: subject.to_string(),
        received_at: Utc::now(),
        body_text: format!("body of {subject}"),
        body_html: None,
        attachments: Vec::new(),
    }
}

// ─── FakeSource ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeState {
    uid_validity: u32,
    next_uid: u32,
    messages: BTreeMap<u32, IncomingMessage>,
    failing_fetches: HashSet<u32>,
    connect_failure: bool,
}

/// Scripted mail source: tests push messages, flip failure switches, and
/// drive poll cycles against it.
#[derive(Clone)]
pub struct FakeSource {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                uid_validity: 1,
                next_uid: 1,
                ..FakeState::default()
            })),
        }
    }

    /// Append a message to the source mailbox; returns its UID.
    pub fn push(&self, message: IncomingMessage) -> u32 {
        let mut state = self.state.lock().unwrap();
        let uid = state.next_uid;
        state.next_uid += 1;
        state.messages.insert(uid, message);
        uid
    }

    /// Make `fetch` fail for this UID until cleared.
    pub fn fail_fetch(&self, uid: u32, failing: bool) {
        let mut state = self.state.lock().unwrap();
        if failing {
            state.failing_fetches.insert(uid);
        } else {
            state.failing_fetches.remove(&uid);
        }
    }

    /// Make `connect` fail until cleared.
    pub fn fail_connect(&self, failing: bool) {
        self.state.lock().unwrap().connect_failure = failing;
    }

    /// Simulate the server renumbering the mailbox.
    pub fn bump_uid_validity(&self) {
        self.state.lock().unwrap().uid_validity += 1;
    }
}

#[async_trait]
impl MailSource for FakeSource {
    async fn connect(&self) -> Result<Box<dyn MailSession>, SourceError> {
        if self.state.lock().unwrap().connect_failure {
            return Err(SourceError::Connection("scripted connect failure".to_string()));
        }
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl MailSession for FakeSession {
    async fn list_new(
        &mut self,
        checkpoint: &PollCheckpoint,
    ) -> Result<(Vec<MessageRef>, PollCheckpoint), SourceError> {
        let state = self.state.lock().unwrap();
        let mut rebased = *checkpoint;
        if state.uid_validity != rebased.uid_validity {
            rebased = PollCheckpoint {
                uid_validity: state.uid_validity,
                last_uid: 0,
            };
        }
        let refs = state
            .messages
            .keys()
            .filter(|uid| **uid > rebased.last_uid)
            .map(|uid| MessageRef { uid: *uid })
            .collect();
        Ok((refs, rebased))
    }

    async fn fetch(&mut self, reference: MessageRef) -> Result<IncomingMessage, SourceError> {
        let state = self.state.lock().unwrap();
        if state.failing_fetches.contains(&reference.uid) {
            return Err(SourceError::Fetch {
                uid: reference.uid,
                reason: "scripted fetch failure".to_string(),
            });
        }
        state
            .messages
            .get(&reference.uid)
            .cloned()
            .ok_or(SourceError::Fetch {
                uid: reference.uid,
                reason: "no such uid".to_string(),
            })
    }

    async fn logout(&mut self) {}
}
