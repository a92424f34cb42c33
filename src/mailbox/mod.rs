// SPDX-License-Identifier: MIT
// Mailbox lifecycle: model, persistent store, and address generation.

pub mod addrgen;
pub mod model;
pub mod store;

pub use addrgen::AddressGenerator;
pub use model::{Delivery, Mailbox, MailboxStats, MessageSummary, StoredAttachment, StoredMessage};
pub use store::MailboxStore;
