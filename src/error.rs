// SPDX-License-Identifier: MIT
//! Typed error taxonomy for the mailbox lifecycle engine.
//!
//! Background tasks never let these escape the task boundary — they log and
//! keep their schedule. User-triggered operations return them to the caller
//! for presentation.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transient network/auth failure talking to the mail source. The poll
    /// scheduler backs off and retries; never fatal to the process.
    #[error("mail source connection failed: {0}")]
    Connection(String),

    /// The address generator ran out of retry attempts. Rare and reportable,
    /// never silently looped.
    #[error("could not allocate a unique address after {attempts} attempts")]
    AddressExhaustion { attempts: u32 },

    /// The owner already holds an active mailbox and the configured policy
    /// is `reject`.
    #[error("owner already has an active mailbox at {address}")]
    DuplicateActiveMailbox { address: String },

    /// Requested prefix failed validation before sanitation.
    #[error("invalid address prefix: {0}")]
    InvalidPrefix(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// A poll cycle or sweep run exceeded its wall-clock budget. The run is
    /// aborted; progress up to the last processed item is kept.
    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
