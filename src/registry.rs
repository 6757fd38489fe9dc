// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session registry.
//!
//! In-memory index of running sessions. Sessions in any other state are
//! dropped from memory and only addressable through storage. A periodic
//! sweep fails persisted sessions whose deadline passed while no process
//! held them in memory (e.g. after a crash), without rebuilding the object.

use crate::error::FaucetResult;
use crate::metrics::FaucetMetrics;
use crate::session::{FaucetSession, SessionContext, SessionEvent};
use crate::store::SessionStore;
use crate::types::{SessionRecord, SessionStatus};
use ethers::types::U256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct SessionRegistry {
    ctx: Arc<SessionContext>,
    sessions: RwLock<HashMap<Uuid, Arc<FaucetSession>>>,
    metrics: Option<Arc<FaucetMetrics>>,
}

impl SessionRegistry {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<FaucetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start a new session and index it while it runs.
    pub async fn create_session(
        &self,
        remote_ip: String,
        input: serde_json::Value,
    ) -> FaucetResult<Arc<FaucetSession>> {
        let session = match FaucetSession::start(self.ctx.clone(), remote_ip, input).await {
            Ok(session) => session,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.sessions_failed.with_label_values(&[e.error_type()]).inc();
                }
                return Err(e);
            }
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id(), session.clone());
        }
        if let Some(m) = &self.metrics {
            m.sessions_started.inc();
        }
        self.update_active_gauge().await;
        Ok(session)
    }

    /// Load persisted running sessions and re-arm their timers.
    pub async fn restore(&self) -> FaucetResult<usize> {
        let rows = self
            .ctx
            .store
            .get_by_status(&[SessionStatus::Running])
            .await?;
        let count = rows.len();
        for row in rows {
            let id = row.id;
            let session = FaucetSession::restore(self.ctx.clone(), row).await;
            let mut sessions = self.sessions.write().await;
            sessions.insert(id, session);
        }
        if count > 0 {
            info!("[registry] restored {} running sessions", count);
        }
        self.update_active_gauge().await;
        Ok(count)
    }

    pub async fn get_session(&self, id: &Uuid) -> Option<Arc<FaucetSession>> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn get_active(&self) -> Vec<Arc<FaucetSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Outstanding liability: balances of in-memory running sessions plus
    /// the persisted claimable aggregate. Two parts because claimable
    /// sessions are no longer held in memory.
    pub async fn get_unclaimed_total(&self) -> FaucetResult<U256> {
        let sessions = { self.sessions.read().await.values().cloned().collect::<Vec<_>>() };
        let mut total = U256::zero();
        for session in sessions {
            if session.status().await == SessionStatus::Running {
                total = total.saturating_add(session.drop_amount().await);
            }
        }
        let claimable = self.ctx.store.get_claimable_aggregate().await?;
        Ok(total.saturating_add(claimable))
    }

    /// Flush all dirty write-back state; called on shutdown.
    pub async fn flush_all(&self) {
        let sessions = { self.sessions.read().await.values().cloned().collect::<Vec<_>>() };
        for session in sessions {
            if let Err(e) = session.flush_if_dirty().await {
                warn!("[registry] flush of session {} failed: {}", session.id(), e);
            }
        }
    }

    /// Fail timed-out persisted sessions that have no in-memory
    /// representative, directly against storage.
    pub async fn sweep(&self) -> FaucetResult<usize> {
        let rows = self
            .ctx
            .store
            .get_timed_out(
                &[SessionStatus::Running, SessionStatus::Claimable],
                self.ctx.config.session_timeout_secs,
            )
            .await?;
        let mut swept = 0;
        for mut row in rows {
            if self.sessions.read().await.contains_key(&row.id) {
                // Live sessions time out through their own advance timer
                continue;
            }
            row.status = SessionStatus::Failed;
            row.failed_code = Some("SESSION_TIMEOUT".to_string());
            row.failed_reason = Some("session timed out".to_string());
            self.ctx.store.upsert(&row).await?;
            swept += 1;
            debug!("[registry] swept timed-out session {}", row.id);
        }
        if swept > 0 {
            info!("[registry] sweep failed {} orphaned sessions", swept);
            if let Some(m) = &self.metrics {
                m.sessions_swept.inc_by(swept as u64);
            }
        }
        Ok(swept)
    }

    /// Consume session status events: drop sessions from the index once
    /// they leave `Running`.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        registry.on_session_event(event).await;
                    }
                }
            }
        })
    }

    async fn on_session_event(&self, event: SessionEvent) {
        if event.status == SessionStatus::Running {
            return;
        }
        let removed = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&event.session_id)
        };
        if removed.is_some() {
            debug!(
                "[registry] session {} left the index ({})",
                event.session_id, event.status
            );
        }
        if let Some(m) = &self.metrics {
            match event.status {
                SessionStatus::Claimable => m.sessions_completed.inc(),
                SessionStatus::Failed => {
                    m.sessions_failed.with_label_values(&["session"]).inc()
                }
                _ => {}
            }
        }
        self.update_active_gauge().await;
    }

    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let period = Duration::from_secs(registry.ctx.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup recovery
            // and the first sweep don't race
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sweep().await {
                            warn!("[registry] sweep failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    async fn update_active_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.sessions_active
                .set(self.sessions.read().await.len() as i64);
        }
    }

    /// Storage-backed lookup for sessions no longer held in memory.
    pub async fn get_record(&self, id: &Uuid) -> FaucetResult<Option<SessionRecord>> {
        if let Some(session) = self.get_session(id).await {
            return Ok(Some(session.record().await));
        }
        self.ctx.store.get_by_id(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use crate::test_utils;
    use crate::types::now_secs;

    #[tokio::test]
    async fn test_completed_sessions_leave_the_index() {
        let env = test_utils::session_env();
        let registry = Arc::new(SessionRegistry::new(env.ctx.clone()));
        let cancel = CancellationToken::new();
        let events = env.take_events().await;
        let _event_loop = registry.spawn_event_loop(events, cancel.clone());

        let session = registry
            .create_session("198.51.100.7".to_string(), serde_json::Value::Null)
            .await
            .unwrap();
        assert_eq!(registry.get_active().await.len(), 1);

        session.add_reward(U256::from(30u64)).await;
        session.try_advance().await;

        let registry2 = registry.clone();
        test_utils::wait_for(|| {
            let registry = registry2.clone();
            async move { registry.get_active().await.is_empty() }
        })
        .await;
        cancel.cancel();

        // Still addressable through storage
        let record = registry.get_record(&session.id()).await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Claimable);
    }

    #[tokio::test]
    async fn test_restore_rebuilds_running_sessions() {
        let env = test_utils::session_env();
        {
            let session = test_utils::running_session(&env).await;
            session.add_reward(U256::from(20u64)).await;
            session.flush_if_dirty().await.unwrap();
        }
        // Claimable rows must not be rebuilt
        test_utils::claimable_session(&env, 30).await;

        let registry = SessionRegistry::new(env.ctx.clone());
        let restored = registry.restore().await.unwrap();
        assert_eq!(restored, 1);
        let active = registry.get_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].drop_amount().await, U256::from(20u64));
    }

    #[tokio::test]
    async fn test_unclaimed_total_spans_memory_and_storage() {
        let env = test_utils::session_env();
        let registry = SessionRegistry::new(env.ctx.clone());
        registry.restore().await.unwrap();

        // In-memory running session with 20
        let session = registry
            .create_session("198.51.100.7".to_string(), serde_json::Value::Null)
            .await
            .unwrap();
        session.add_reward(U256::from(20u64)).await;
        // Persisted claimable row with 30, not in memory
        test_utils::claimable_session(&env, 30).await;

        assert_eq!(
            registry.get_unclaimed_total().await.unwrap(),
            U256::from(50u64)
        );
    }

    #[tokio::test]
    async fn test_sweep_fails_orphaned_rows_only() {
        let env = test_utils::session_env();
        let registry = SessionRegistry::new(env.ctx.clone());

        // An orphaned row far past its deadline
        let store: &MemorySessionStore = &env.store;
        let mut orphan = test_utils::claiming_row(test_utils::stored_claim(
            1,
            crate::claim::ClaimStatus::Queued,
            None,
        ));
        orphan.status = SessionStatus::Running;
        orphan.claim = None;
        orphan.start_time = now_secs() - env.ctx.config.session_timeout_secs - 100;
        store.upsert(&orphan).await.unwrap();

        // A live indexed session stays untouched by the sweep
        let live = registry
            .create_session("198.51.100.7".to_string(), serde_json::Value::Null)
            .await
            .unwrap();

        let swept = registry.sweep().await.unwrap();
        assert_eq!(swept, 1);
        let row = store.get_by_id(&orphan.id).await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Failed);
        assert_eq!(row.failed_code.as_deref(), Some("SESSION_TIMEOUT"));
        assert_eq!(live.status().await, SessionStatus::Running);
    }
}
