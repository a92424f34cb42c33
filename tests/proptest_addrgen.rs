// SPDX-License-Identifier: MIT
//! Property-based tests for address prefix sanitation and checkpoint
//! arithmetic.
//!
//! Run with: cargo test --test proptest_addrgen

use driftmail::config::AddressConfig;
use driftmail::mailbox::addrgen::AddressGenerator;
use driftmail::source::PollCheckpoint;
use proptest::prelude::*;

fn generator() -> AddressGenerator {
    let mut config = AddressConfig::default();
    config.domain = "drift.test".to_string();
    AddressGenerator::new(config)
}

proptest! {
    /// Whatever the caller asks for, an accepted prefix always has the
    /// configured length and only lowercase alphanumerics.
    #[test]
    fn sanitized_prefix_always_matches_the_allowed_shape(input in ".{3,40}") {
        let generator = generator();
        if let Ok(prefix) = generator.sanitize_prefix(Some(&input)) {
            prop_assert_eq!(prefix.chars().count(), 6);
            prop_assert!(
                prefix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()),
                "prefix '{}' has characters outside [a-z0-9]", prefix
            );
        }
    }

    /// Alphanumeric input of at least the minimum length is never rejected,
    /// and its usable leading characters survive sanitation.
    #[test]
    fn alphanumeric_input_is_accepted_and_preserved(input in "[a-zA-Z0-9]{3,20}") {
        let generator = generator();
        let prefix = generator.sanitize_prefix(Some(&input)).unwrap();
        let expected: String = input.to_lowercase().chars().take(6).collect();
        prop_assert!(prefix.starts_with(&expected));
    }

    /// Too-short input is always a typed rejection, never a panic or a
    /// silently padded address.
    #[test]
    fn short_input_is_always_rejected(input in ".{0,2}") {
        let generator = generator();
        prop_assert!(generator.sanitize_prefix(Some(&input)).is_err());
    }

    /// The checkpoint never moves backwards, whatever order UIDs arrive in.
    #[test]
    fn checkpoint_is_monotonic(uids in proptest::collection::vec(0u32..10_000, 1..50)) {
        let mut checkpoint = PollCheckpoint::default();
        let mut high_water = 0u32;
        for uid in uids {
            checkpoint.advance(uid);
            high_water = high_water.max(uid);
            prop_assert_eq!(checkpoint.last_uid, high_water);
        }
    }
}
