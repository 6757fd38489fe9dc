// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session store contract.
//!
//! The storage engine is an external collaborator; the core only relies on
//! this narrow key/row contract. Writes are keyed by session id and are
//! last-writer-wins - claim races are resolved at the application layer, not
//! with optimistic concurrency tokens.

use crate::error::{FaucetError, FaucetResult};
use crate::types::{now_secs, SessionRecord, SessionStatus};
use async_trait::async_trait;
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// All rows whose status is in `statuses`.
    async fn get_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> FaucetResult<Vec<SessionRecord>>;

    async fn get_by_id(&self, id: &Uuid) -> FaucetResult<Option<SessionRecord>>;

    /// Insert or fully replace the row for `record.id`.
    async fn upsert(&self, record: &SessionRecord) -> FaucetResult<()>;

    /// Sum of the persisted balances of all `Claimable` rows.
    async fn get_claimable_aggregate(&self) -> FaucetResult<U256>;

    /// Rows in `statuses` whose `start_time + timeout_secs` has passed.
    async fn get_timed_out(
        &self,
        statuses: &[SessionStatus],
        timeout_secs: u64,
    ) -> FaucetResult<Vec<SessionRecord>>;
}

/// In-memory `SessionStore`.
///
/// The default store for single-node deployments and the double used across
/// the test suite. Tracks its write count so tests can assert on persistence
/// behavior (e.g. that debounced writes coalesce).
pub struct MemorySessionStore {
    rows: RwLock<HashMap<Uuid, SessionRecord>>,
    upserts: AtomicU64,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            upserts: AtomicU64::new(0),
        }
    }

    /// Number of `upsert` calls observed since construction.
    pub fn upsert_count(&self) -> u64 {
        self.upserts.load(Ordering::Relaxed)
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> FaucetResult<Vec<SessionRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn get_by_id(&self, id: &Uuid) -> FaucetResult<Option<SessionRecord>> {
        let rows = self.rows.read().await;
        Ok(rows.get(id).cloned())
    }

    async fn upsert(&self, record: &SessionRecord) -> FaucetResult<()> {
        self.upserts.fetch_add(1, Ordering::Relaxed);
        let mut rows = self.rows.write().await;
        rows.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_claimable_aggregate(&self) -> FaucetResult<U256> {
        let rows = self.rows.read().await;
        let mut total = U256::zero();
        for row in rows.values() {
            if row.status == SessionStatus::Claimable {
                total = total
                    .checked_add(row.visible_amount())
                    .ok_or_else(|| {
                        FaucetError::InternalError("claimable aggregate overflow".to_string())
                    })?;
            }
        }
        Ok(total)
    }

    async fn get_timed_out(
        &self,
        statuses: &[SessionStatus],
        timeout_secs: u64,
    ) -> FaucetResult<Vec<SessionRecord>> {
        let now = now_secs();
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| {
                statuses.contains(&r.status) && r.start_time.saturating_add(timeout_secs) < now
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: SessionStatus, start_time: u64, amount: u64) -> SessionRecord {
        SessionRecord {
            id: Uuid::new_v4(),
            status,
            start_time,
            remote_ip: "127.0.0.1".to_string(),
            target_addr: None,
            drop_amount: Some(U256::from(amount)),
            tasks: vec![],
            data: HashMap::new(),
            claim: None,
            failed_code: None,
            failed_reason: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let store = MemorySessionStore::new();
        let rec = record(SessionStatus::Running, now_secs(), 10);
        store.upsert(&rec).await.unwrap();
        let found = store.get_by_id(&rec.id).await.unwrap().unwrap();
        assert_eq!(found.status, SessionStatus::Running);

        // Last writer wins
        let mut updated = rec.clone();
        updated.status = SessionStatus::Failed;
        store.upsert(&updated).await.unwrap();
        let found = store.get_by_id(&rec.id).await.unwrap().unwrap();
        assert_eq!(found.status, SessionStatus::Failed);
        assert_eq!(store.upsert_count(), 2);
    }

    #[tokio::test]
    async fn test_claimable_aggregate_ignores_other_statuses() {
        let store = MemorySessionStore::new();
        store
            .upsert(&record(SessionStatus::Claimable, now_secs(), 30))
            .await
            .unwrap();
        store
            .upsert(&record(SessionStatus::Claimable, now_secs(), 12))
            .await
            .unwrap();
        store
            .upsert(&record(SessionStatus::Running, now_secs(), 100))
            .await
            .unwrap();
        store
            .upsert(&record(SessionStatus::Claiming, now_secs(), 100))
            .await
            .unwrap();
        assert_eq!(
            store.get_claimable_aggregate().await.unwrap(),
            U256::from(42u64)
        );
    }

    #[tokio::test]
    async fn test_timed_out_query_filters_by_status_and_deadline() {
        let store = MemorySessionStore::new();
        let stale = record(SessionStatus::Running, now_secs() - 1000, 5);
        let fresh = record(SessionStatus::Running, now_secs(), 5);
        let stale_failed = record(SessionStatus::Failed, now_secs() - 1000, 5);
        store.upsert(&stale).await.unwrap();
        store.upsert(&fresh).await.unwrap();
        store.upsert(&stale_failed).await.unwrap();

        let timed_out = store
            .get_timed_out(&[SessionStatus::Running, SessionStatus::Claimable], 600)
            .await
            .unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].id, stale.id);
    }
}
