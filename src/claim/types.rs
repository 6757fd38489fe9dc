// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Claim record types.

use crate::types::{amount_dec, opt_amount_nullable};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Claim settlement states.
///
/// `Unknown` absorbs unrecognized values from storage; recovery logs and
/// skips such claims instead of promoting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Queued,
    Processing,
    Pending,
    Confirmed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ClaimStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClaimStatus::Confirmed | ClaimStatus::Failed)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClaimStatus::Queued => "queued",
            ClaimStatus::Processing => "processing",
            ClaimStatus::Pending => "pending",
            ClaimStatus::Confirmed => "confirmed",
            ClaimStatus::Failed => "failed",
            ClaimStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One claim transaction. Stored as a blob on the owning session row and
/// mirrored in the queue's in-memory structures while non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTx {
    pub session_id: Uuid,
    pub target_addr: Address,
    #[serde(with = "amount_dec")]
    pub amount: U256,
    /// Total order over all claims ever created; survives restarts.
    pub claim_index: u64,
    pub status: ClaimStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx_hash: Option<H256>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx_nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx_block: Option<u64>,
    #[serde(
        with = "opt_amount_nullable",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub tx_fee: Option<U256>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    /// Creation timestamp, epoch seconds.
    pub created: u64,
}
