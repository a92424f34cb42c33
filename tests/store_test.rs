// SPDX-License-Identifier: MIT
//! Mailbox store semantics: idempotent delivery, ordering, cap eviction,
//! expiry sweeping, create policy, and checkpoint durability.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use driftmail::config::{LimitsConfig, OnExisting};
use driftmail::error::EngineError;
use driftmail::mailbox::model::Delivery;
use driftmail::mailbox::store::MailboxStore;
use driftmail::source::{IncomingAttachment, PollCheckpoint};
use tempfile::TempDir;

use common::{incoming, open_store};

const HOUR: i64 = 3600;

async fn setup(limits: LimitsConfig) -> (TempDir, MailboxStore) {
    let dir = TempDir::new().unwrap();
    let store = open_store(dir.path(), limits).await;
    (dir, store)
}

fn hour() -> ChronoDuration {
    ChronoDuration::seconds(HOUR)
}

#[tokio::test]
async fn record_is_idempotent_on_source_id() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "a_b@drift.test", hour()).await.unwrap();

    let msg = incoming("mid-1", "a_b@drift.test", "first");
    let first = store.record_message("a_b@drift.test", &msg).await.unwrap();
    assert!(matches!(first, Delivery::Delivered(_)));

    let second = store.record_message("a_b@drift.test", &msg).await.unwrap();
    assert!(matches!(second, Delivery::Duplicate));

    let mb = store.get_active("owner-1").await.unwrap().unwrap();
    assert_eq!(mb.message_count, 1);
    assert_eq!(mb.total_received, 1);
}

#[tokio::test]
async fn cap_evicts_oldest_first() {
    let limits = LimitsConfig {
        max_inbox_size: 5,
        ..LimitsConfig::default()
    };
    let (_dir, store) = setup(limits).await;
    store.create("owner-1", "cap_box@drift.test", hour()).await.unwrap();

    for i in 1..=6 {
        let msg = incoming(&format!("mid-{i}"), "cap_box@drift.test", &format!("msg {i}"));
        store.record_message("cap_box@drift.test", &msg).await.unwrap();
    }

    let mb = store.get_active("owner-1").await.unwrap().unwrap();
    assert_eq!(mb.message_count, 5);
    assert_eq!(mb.total_received, 6);

    let listed = store.list_messages("cap_box@drift.test").await.unwrap();
    assert_eq!(listed.len(), 5);
    // Newest first; the oldest (msg 1) is the one evicted.
    assert_eq!(listed[0].subject, "msg 6");
    assert_eq!(listed[4].subject, "msg 2");
    assert!(listed.iter().all(|m| m.subject != "msg 1"));
}

#[tokio::test]
async fn listing_is_newest_first_within_one_batch() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "ord_box@drift.test", hour()).await.unwrap();

    // Same fetch timestamp resolution — insertion order must break the tie.
    store
        .record_message("ord_box@drift.test", &incoming("m1", "ord_box@drift.test", "earlier"))
        .await
        .unwrap();
    store
        .record_message("ord_box@drift.test", &incoming("m2", "ord_box@drift.test", "later"))
        .await
        .unwrap();

    let listed = store.list_messages("ord_box@drift.test").await.unwrap();
    assert_eq!(listed[0].subject, "later");
    assert_eq!(listed[1].subject, "earlier");
}

#[tokio::test]
async fn sweep_deactivates_and_purges_expired_mailboxes() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store
        .create("owner-1", "gone_soon@drift.test", ChronoDuration::seconds(1))
        .await
        .unwrap();
    store
        .record_message("gone_soon@drift.test", &incoming("m1", "gone_soon@drift.test", "hi"))
        .await
        .unwrap();

    let swept = store.sweep_expired(Utc::now() + ChronoDuration::seconds(2)).await.unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(swept[0].owner_id, "owner-1");

    assert!(store.get_active("owner-1").await.unwrap().is_none());
    let retired = store.get_by_address("gone_soon@drift.test").await.unwrap().unwrap();
    assert!(!retired.active);
    assert_eq!(retired.deactivation_reason.as_deref(), Some("expired"));
    assert_eq!(retired.message_count, 0);
    assert!(store.list_messages("gone_soon@drift.test").await.unwrap().is_empty());

    // A second sweep finds nothing.
    let again = store.sweep_expired(Utc::now() + ChronoDuration::seconds(3)).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn replace_policy_retires_the_previous_mailbox() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "first_box@drift.test", hour()).await.unwrap();
    store
        .record_message("first_box@drift.test", &incoming("m1", "first_box@drift.test", "hi"))
        .await
        .unwrap();

    let replacement = store.create("owner-1", "second_box@drift.test", hour()).await.unwrap();
    assert_eq!(replacement.address, "second_box@drift.test");

    let old = store.get_by_address("first_box@drift.test").await.unwrap().unwrap();
    assert!(!old.active);
    assert_eq!(old.deactivation_reason.as_deref(), Some("replaced"));
    assert!(store.list_messages("first_box@drift.test").await.unwrap().is_empty());

    let active = store.get_active("owner-1").await.unwrap().unwrap();
    assert_eq!(active.address, "second_box@drift.test");
}

#[tokio::test]
async fn reject_policy_refuses_a_second_mailbox() {
    let limits = LimitsConfig {
        on_existing: OnExisting::Reject,
        ..LimitsConfig::default()
    };
    let (_dir, store) = setup(limits).await;
    store.create("owner-1", "only_box@drift.test", hour()).await.unwrap();

    let err = store.create("owner-1", "other_box@drift.test", hour()).await.unwrap_err();
    match err {
        EngineError::DuplicateActiveMailbox { address } => {
            assert_eq!(address, "only_box@drift.test");
        }
        other => panic!("expected DuplicateActiveMailbox, got {other:?}"),
    }

    // The old mailbox is untouched.
    let active = store.get_active("owner-1").await.unwrap().unwrap();
    assert_eq!(active.address, "only_box@drift.test");
}

#[tokio::test]
async fn concurrent_creates_leave_at_most_one_active_mailbox() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    let store = Arc::new(store);

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .create("owner-race", &format!("race_{i}@drift.test"), hour())
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(EngineError::DuplicateActiveMailbox { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert!(successes >= 1);

    // The partial unique index guarantees a single active row; get_active
    // would error on a violated invariant.
    assert!(store.get_active("owner-race").await.unwrap().is_some());
}

#[tokio::test]
async fn recording_into_a_retired_mailbox_is_refused() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "late_box@drift.test", hour()).await.unwrap();
    assert!(store.deactivate("owner-1").await.unwrap());

    let err = store
        .record_message("late_box@drift.test", &incoming("m1", "late_box@drift.test", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));

    // Nothing was half-written.
    assert!(store.list_messages("late_box@drift.test").await.unwrap().is_empty());
    let retired = store.get_by_address("late_box@drift.test").await.unwrap().unwrap();
    assert_eq!(retired.total_received, 0);
}

#[tokio::test]
async fn retention_purge_releases_the_address() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "old_box@drift.test", hour()).await.unwrap();
    store.deactivate("owner-1").await.unwrap();

    // Inside the retention window the address stays burned.
    assert!(store.address_exists("old_box@drift.test").await.unwrap());
    let kept = store
        .purge_retired(Utc::now(), ChronoDuration::days(30))
        .await
        .unwrap();
    assert_eq!(kept, 0);

    // Past the window the row is dropped and the address is free again.
    let purged = store
        .purge_retired(Utc::now() + ChronoDuration::days(31), ChronoDuration::days(30))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(!store.address_exists("old_box@drift.test").await.unwrap());
}

#[tokio::test]
async fn checkpoint_roundtrips_through_the_store() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    assert!(store.load_checkpoint().await.unwrap().is_none());

    let checkpoint = PollCheckpoint {
        uid_validity: 7,
        last_uid: 42,
    };
    store.save_checkpoint(&checkpoint).await.unwrap();
    assert_eq!(store.load_checkpoint().await.unwrap(), Some(checkpoint));

    let advanced = PollCheckpoint {
        uid_validity: 7,
        last_uid: 43,
    };
    store.save_checkpoint(&advanced).await.unwrap();
    assert_eq!(store.load_checkpoint().await.unwrap(), Some(advanced));
}

#[tokio::test]
async fn attachments_roundtrip_through_get_message() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "att_box@drift.test", hour()).await.unwrap();

    let mut msg = incoming("m1", "att_box@drift.test", "with attachment");
    msg.attachments.push(IncomingAttachment {
        filename: "doc.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        data: b"%PDF-1.7".to_vec(),
    });

    let delivered = store.record_message("att_box@drift.test", &msg).await.unwrap();
    let summary = match delivered {
        Delivery::Delivered(s) => s,
        Delivery::Duplicate => panic!("expected delivery"),
    };
    assert_eq!(summary.attachment_count, 1);

    let stored = store.get_message("att_box@drift.test", &summary.id).await.unwrap();
    assert_eq!(stored.attachments.len(), 1);
    assert_eq!(stored.attachments[0].filename, "doc.pdf");
    assert_eq!(stored.attachments[0].size, 8);
    assert_eq!(stored.attachments[0].data, b"%PDF-1.7");

    // Unknown ids are a typed NotFound.
    let err = store.get_message("att_box@drift.test", "no-such-id").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn expiry_warning_fires_exactly_once_per_mailbox() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store
        .create("owner-1", "warn_box@drift.test", ChronoDuration::seconds(300))
        .await
        .unwrap();

    let window = ChronoDuration::seconds(600);
    let warned = store.warn_expiring(Utc::now(), window).await.unwrap();
    assert_eq!(warned.len(), 1);
    assert_eq!(warned[0].address, "warn_box@drift.test");

    let again = store.warn_expiring(Utc::now(), window).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn stats_reflect_counters_and_remaining_time() {
    let (_dir, store) = setup(LimitsConfig::default()).await;
    store.create("owner-1", "stat_box@drift.test", hour()).await.unwrap();
    store
        .record_message("stat_box@drift.test", &incoming("m1", "stat_box@drift.test", "hi"))
        .await
        .unwrap();

    let stats = store.stats("owner-1").await.unwrap().unwrap();
    assert!(stats.active);
    assert_eq!(stats.message_count, 1);
    assert_eq!(stats.total_received, 1);
    assert!(stats.time_remaining_secs > 0 && stats.time_remaining_secs <= HOUR);

    assert!(store.stats("owner-unknown").await.unwrap().is_none());
}
