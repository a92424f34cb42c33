// SPDX-License-Identifier: MIT
// Background scheduling: the poll loop, the expiry sweeper, and their
// shared backoff policy.

pub mod backoff;
pub mod poller;
pub mod sweeper;

pub use poller::{CycleOutcome, PollStats, PollStatsSnapshot, Poller};
pub use sweeper::{SweepOutcome, Sweeper};
