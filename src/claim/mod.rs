// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Claim Settlement Module
//!
//! Turns claimable sessions into at most one on-chain transaction each:
//! - Creation gates (claimable check, amount bounds, validation hooks, the
//!   claiming-set race gate)
//! - FIFO settlement queue with funds-aware backpressure
//! - Submission, confirmation watches and the persisted claim lifecycle
//! - Crash recovery from `Claiming` session rows
//!
//! ## Design Principles
//!
//! 1. **Storage is the source of truth**: the in-memory queue, pending set
//!    and claiming set are an index that can be rebuilt from rows at any time
//! 2. **Exactly-once**: at most one non-terminal claim per session, enforced
//!    by the claiming set under the queue lock
//! 3. **First come, first served**: strict `claim_index` order; an
//!    underfunded head blocks everything behind it
//! 4. **No silent retries**: funding and connectivity failures are terminal
//!    for the claim and wait for an operator

mod history;
mod queue;
mod types;

pub use history::ClaimHistory;
pub use queue::ClaimQueue;
pub use types::{ClaimStatus, ClaimTx};
