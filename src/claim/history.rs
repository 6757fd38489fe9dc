// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Bounded-lifetime map of settled claims, keyed by transaction nonce.
//!
//! Settled (confirmed or failed) claims stay readable for a retention window
//! so operators and late subscribers can audit recent settlements without a
//! storage round trip. Entries past the window are evicted on insert and
//! filtered on read.

use super::types::ClaimTx;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub struct ClaimHistory {
    retention: Duration,
    entries: HashMap<u64, (Instant, ClaimTx)>,
}

impl ClaimHistory {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, nonce: u64, claim: ClaimTx) {
        let now = Instant::now();
        self.entries
            .retain(|_, (at, _)| now.duration_since(*at) < self.retention);
        self.entries.insert(nonce, (now, claim));
    }

    pub fn get(&self, nonce: u64) -> Option<&ClaimTx> {
        let now = Instant::now();
        self.entries.get(&nonce).and_then(|(at, claim)| {
            if now.duration_since(*at) < self.retention {
                Some(claim)
            } else {
                None
            }
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClaimTx> {
        let now = Instant::now();
        let retention = self.retention;
        self.entries
            .values()
            .filter(move |(at, _)| now.duration_since(*at) < retention)
            .map(|(_, claim)| claim)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::ClaimStatus;
    use crate::types::now_secs;
    use ethers::types::{Address, U256};
    use uuid::Uuid;

    fn claim(index: u64) -> ClaimTx {
        ClaimTx {
            session_id: Uuid::new_v4(),
            target_addr: Address::from_low_u64_be(1),
            amount: U256::from(10u64),
            claim_index: index,
            status: ClaimStatus::Confirmed,
            tx_hash: None,
            tx_nonce: Some(index),
            tx_block: Some(100),
            tx_fee: None,
            error: None,
            created: now_secs(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_retention() {
        let mut history = ClaimHistory::new(Duration::from_secs(1800));
        history.insert(1, claim(1));
        assert_eq!(history.get(1).unwrap().claim_index, 1);

        tokio::time::advance(Duration::from_secs(1000)).await;
        history.insert(2, claim(2));
        assert_eq!(history.len(), 2);

        // First entry crosses the 30 minute window, second survives
        tokio::time::advance(Duration::from_secs(900)).await;
        assert!(history.get(1).is_none());
        assert!(history.get(2).is_some());
        assert_eq!(history.len(), 1);

        // Insert prunes the expired entry for real
        history.insert(3, claim(3));
        assert_eq!(history.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_lookup_by_nonce() {
        let mut history = ClaimHistory::new(Duration::from_secs(60));
        history.insert(5, claim(42));
        assert_eq!(history.get(5).unwrap().claim_index, 42);
        assert!(history.get(6).is_none());
    }
}
