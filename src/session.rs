// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session lifecycle state machine.
//!
//! One `FaucetSession` exists per reward-earning visit. All mutations to a
//! session are serialized behind its state mutex; gating-module hooks run
//! outside the lock so they can read the session without deadlocking.
//!
//! Persistence is write-back: low-value mutations (reward accrual, module
//! data) mark the session dirty and coalesce into one store write per save
//! window, while lifecycle transitions are written synchronously before the
//! operation returns. Once a claim is created the row is owned by the claim
//! queue and the session stops writing it.

use crate::claim::ClaimTx;
use crate::config::FaucetConfig;
use crate::error::{FaucetError, FaucetResult};
use crate::hooks::{self, ModulePipeline};
use crate::store::SessionStore;
use crate::types::{now_secs, SessionRecord, SessionStatus, SessionTask};
use ethers::types::{Address, U256};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status-change notification delivered to the registry.
#[derive(Debug, Clone, Copy)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub status: SessionStatus,
}

/// Shared collaborators injected into every session.
pub struct SessionContext {
    pub config: FaucetConfig,
    pub store: Arc<dyn SessionStore>,
    pub modules: Arc<ModulePipeline>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

struct SessionState {
    status: SessionStatus,
    start_time: u64,
    remote_ip: String,
    target_addr: Option<Address>,
    drop_amount: Option<U256>,
    tasks: Vec<SessionTask>,
    data: HashMap<String, serde_json::Value>,
    claim: Option<ClaimTx>,
    failed_code: Option<String>,
    failed_reason: Option<String>,
    /// Set by `complete()`; reward mutation becomes an advisory no-op.
    disposed: bool,
}

pub struct FaucetSession {
    id: Uuid,
    ctx: Arc<SessionContext>,
    state: Mutex<SessionState>,
    /// Same-process object references, never persisted.
    transient: StdMutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    dirty: AtomicBool,
    /// Once set, this object no longer writes its row (the claim queue does).
    frozen: AtomicBool,
    flush_timer: StdMutex<Option<JoinHandle<()>>>,
    advance_timer: StdMutex<Option<JoinHandle<()>>>,
    weak: Weak<FaucetSession>,
}

impl FaucetSession {
    fn build(ctx: Arc<SessionContext>, id: Uuid, state: SessionState) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            ctx,
            state: Mutex::new(state),
            transient: StdMutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            flush_timer: StdMutex::new(None),
            advance_timer: StdMutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Start a new session: runs the gating pipeline, then moves to
    /// `Running` and arms the deadline timer. A pipeline rejection persists
    /// the session as `Failed` with the module's code and message.
    pub async fn start(
        ctx: Arc<SessionContext>,
        remote_ip: String,
        input: serde_json::Value,
    ) -> FaucetResult<Arc<Self>> {
        let id = Uuid::new_v4();
        let session = Self::build(
            ctx.clone(),
            id,
            SessionState {
                status: SessionStatus::Starting,
                start_time: now_secs(),
                remote_ip: remote_ip.clone(),
                target_addr: None,
                drop_amount: None,
                tasks: Vec::new(),
                data: HashMap::new(),
                claim: None,
                failed_code: None,
                failed_reason: None,
                disposed: false,
            },
        );
        info!("[session {}] starting for {}", id, remote_ip);

        if let Err(err) = ctx.modules.run_session_start(&session, &input).await {
            session
                .fail(err.error_code().to_string(), err.to_string())
                .await;
            return Err(err);
        }

        {
            let mut state = session.state.lock().await;
            state.status = SessionStatus::Running;
        }
        session.persist_now().await?;
        session.emit_status(SessionStatus::Running);
        session.schedule_advance().await;
        Ok(session)
    }

    /// Rebuild a live session from its persisted row and re-arm its timer.
    pub async fn restore(ctx: Arc<SessionContext>, record: SessionRecord) -> Arc<Self> {
        let session = Self::build(
            ctx,
            record.id,
            SessionState {
                status: record.status,
                start_time: record.start_time,
                remote_ip: record.remote_ip,
                target_addr: record.target_addr,
                drop_amount: record.drop_amount,
                tasks: record.tasks,
                data: record.data,
                claim: record.claim,
                failed_code: record.failed_code,
                failed_reason: record.failed_reason,
                disposed: false,
            },
        );
        session.schedule_advance().await;
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    pub async fn start_time(&self) -> u64 {
        self.state.lock().await.start_time
    }

    pub async fn remote_ip(&self) -> String {
        self.state.lock().await.remote_ip.clone()
    }

    pub async fn target_addr(&self) -> Option<Address> {
        self.state.lock().await.target_addr
    }

    /// Externally visible balance; the uninitialized sentinel reads as zero.
    pub async fn drop_amount(&self) -> U256 {
        self.state.lock().await.drop_amount.unwrap_or_default()
    }

    pub async fn tasks(&self) -> Vec<SessionTask> {
        self.state.lock().await.tasks.clone()
    }

    pub async fn failed_code(&self) -> Option<String> {
        self.state.lock().await.failed_code.clone()
    }

    /// Current persisted representation.
    pub async fn record(&self) -> SessionRecord {
        let state = self.state.lock().await;
        snapshot(self.id, &state)
    }

    /// Re-evaluate deadlines. Idempotent: with no state change it only
    /// re-arms the timer and performs no writes or notifications.
    pub async fn try_advance(&self) {
        enum Advance {
            Fail,
            Complete,
            Reschedule { at: u64, changed: bool },
        }

        let action = {
            let mut state = self.state.lock().await;
            if state.status != SessionStatus::Running {
                return;
            }
            let now = now_secs();
            let deadline = state
                .start_time
                .saturating_add(self.ctx.config.session_timeout_secs);
            if now >= deadline {
                Advance::Fail
            } else {
                let before = state.tasks.len();
                state.tasks.retain(|t| t.deadline > now);
                let changed = state.tasks.len() != before;
                if state.tasks.is_empty() {
                    Advance::Complete
                } else {
                    let next = state
                        .tasks
                        .iter()
                        .map(|t| t.deadline)
                        .min()
                        .unwrap_or(deadline)
                        .min(deadline);
                    Advance::Reschedule { at: next, changed }
                }
            }
        };

        match action {
            Advance::Fail => {
                self.fail(
                    FaucetError::SessionTimeout.error_code().to_string(),
                    FaucetError::SessionTimeout.to_string(),
                )
                .await;
            }
            Advance::Complete => self.complete().await,
            Advance::Reschedule { at, changed } => {
                if changed {
                    self.mark_dirty();
                }
                self.schedule_advance_at(at);
            }
        }
    }

    /// Terminal completion path: apply the default reward if none accrued,
    /// enforce the minimum, then freeze the balance and go claimable.
    async fn complete(&self) {
        let outcome = {
            let mut state = self.state.lock().await;
            if state.status != SessionStatus::Running {
                return;
            }
            if state.drop_amount.is_none() {
                state.drop_amount = Some(self.ctx.config.max_drop_amount);
            }
            let amount = state.drop_amount.unwrap_or_default();
            if amount < self.ctx.config.min_drop_amount {
                Err(amount)
            } else {
                state.status = SessionStatus::Claimable;
                state.disposed = true;
                Ok(amount)
            }
        };

        match outcome {
            Err(amount) => {
                self.fail(
                    "AMOUNT_TOO_LOW".to_string(),
                    format!(
                        "accrued {} is below the minimum {}",
                        amount, self.ctx.config.min_drop_amount
                    ),
                )
                .await;
            }
            Ok(amount) => {
                self.cancel_advance_timer();
                if let Err(e) = self.persist_now().await {
                    warn!("[session {}] persist on completion failed: {}", self.id, e);
                }
                self.emit_status(SessionStatus::Claimable);
                self.ctx.modules.run_session_complete(self).await;
                info!("[session {}] claimable with {}", self.id, amount);
            }
        }
    }

    /// Abort the session. Valid from any state before claim submission
    /// begins; afterwards the claim's own status is the terminal record.
    pub async fn fail(&self, code: String, reason: String) {
        {
            let mut state = self.state.lock().await;
            if matches!(
                state.status,
                SessionStatus::Claiming | SessionStatus::Finished | SessionStatus::Failed
            ) {
                return;
            }
            state.status = SessionStatus::Failed;
            state.disposed = true;
            state.failed_code = Some(code.clone());
            state.failed_reason = Some(reason.clone());
        }
        self.cancel_advance_timer();
        if let Err(e) = self.persist_now().await {
            warn!("[session {}] persist on failure failed: {}", self.id, e);
        }
        self.emit_status(SessionStatus::Failed);
        warn!("[session {}] failed: {} ({})", self.id, code, reason);
    }

    /// Accrue a reward. Returns the applied amount after factor
    /// multiplication, or `None` once the balance is frozen.
    pub async fn add_reward(&self, amount: U256) -> Option<U256> {
        {
            let state = self.state.lock().await;
            if !state.status.balance_mutable() || state.disposed {
                return None;
            }
        }
        let factors = self.ctx.modules.collect_reward_factors(self).await;
        let applied = hooks::apply_factors(amount, &factors);
        {
            let mut state = self.state.lock().await;
            // The factor collection above is a suspension point; recheck
            if !state.status.balance_mutable() || state.disposed {
                return None;
            }
            let current = state.drop_amount.unwrap_or_default();
            state.drop_amount = Some(current.saturating_add(applied));
        }
        self.mark_dirty();
        debug!("[session {}] reward {} applied as {}", self.id, amount, applied);
        Some(applied)
    }

    /// Deduct a penalty, saturating at zero. No factors apply.
    pub async fn sub_penalty(&self, amount: U256) -> Option<U256> {
        let applied = {
            let mut state = self.state.lock().await;
            if !state.status.balance_mutable() || state.disposed {
                return None;
            }
            let current = state.drop_amount.unwrap_or_default();
            let applied = current.min(amount);
            state.drop_amount = Some(current - applied);
            applied
        };
        self.mark_dirty();
        Some(applied)
    }

    /// Set the claim target. Immutable after the first set; setting the
    /// same value again is a no-op.
    pub async fn set_target_addr(&self, addr: Address) -> FaucetResult<()> {
        if addr == Address::zero() {
            return Err(FaucetError::InvalidAddress(
                "zero address is not a valid target".to_string(),
            ));
        }
        {
            let mut state = self.state.lock().await;
            match state.target_addr {
                Some(existing) if existing == addr => return Ok(()),
                Some(_) => {
                    return Err(FaucetError::InvalidState(
                        "target address is already set".to_string(),
                    ))
                }
                None => state.target_addr = Some(addr),
            }
        }
        self.mark_dirty();
        Ok(())
    }

    /// Update the client origin; gating modules re-validate the new value
    /// before it is applied.
    pub async fn set_remote_ip(&self, remote_ip: &str) -> FaucetResult<()> {
        {
            let state = self.state.lock().await;
            if state.remote_ip == remote_ip {
                return Ok(());
            }
        }
        self.ctx.modules.run_remote_update(self, remote_ip).await?;
        {
            let mut state = self.state.lock().await;
            state.remote_ip = remote_ip.to_string();
        }
        self.mark_dirty();
        Ok(())
    }

    /// Register a blocking task; the session cannot complete while it is
    /// outstanding and unexpired.
    pub async fn add_blocking_task(
        &self,
        module: &str,
        name: &str,
        deadline: u64,
    ) -> FaucetResult<()> {
        {
            let mut state = self.state.lock().await;
            if !matches!(
                state.status,
                SessionStatus::Starting | SessionStatus::Running
            ) {
                return Err(FaucetError::InvalidState(format!(
                    "cannot add task in state {}",
                    state.status
                )));
            }
            state.tasks.push(SessionTask {
                module: module.to_string(),
                name: name.to_string(),
                deadline,
            });
        }
        self.mark_dirty();
        self.schedule_advance().await;
        Ok(())
    }

    /// Resolve a blocking task and re-evaluate completion.
    pub async fn resolve_task(&self, module: &str, name: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            let before = state.tasks.len();
            state
                .tasks
                .retain(|t| !(t.module == module && t.name == name));
            state.tasks.len() != before
        };
        if removed {
            self.mark_dirty();
            self.try_advance().await;
        }
    }

    /// Persisted module-scoped value.
    pub async fn get_data(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().await.data.get(key).cloned()
    }

    pub async fn set_data(&self, key: &str, value: serde_json::Value) {
        {
            let mut state = self.state.lock().await;
            state.data.insert(key.to_string(), value);
        }
        self.mark_dirty();
    }

    /// Same-process value; never persisted.
    pub fn get_transient(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.transient.lock().unwrap().get(key).cloned()
    }

    pub fn set_transient(&self, key: &str, value: Arc<dyn Any + Send + Sync>) {
        self.transient.lock().unwrap().insert(key.to_string(), value);
    }

    /// Hand the row over to the claim queue: flips the in-memory state to
    /// `Claiming`, attaches the claim blob, stops all timers and writes,
    /// and returns the record for the queue's atomic upsert.
    pub(crate) async fn freeze_for_claim(&self, claim: ClaimTx, amount: U256) -> SessionRecord {
        let record = {
            let mut state = self.state.lock().await;
            state.status = SessionStatus::Claiming;
            state.disposed = true;
            state.drop_amount = Some(amount);
            state.claim = Some(claim);
            snapshot(self.id, &state)
        };
        self.frozen.store(true, Ordering::Release);
        self.cancel_advance_timer();
        if let Some(handle) = self.flush_timer.lock().unwrap().take() {
            handle.abort();
        }
        self.dirty.store(false, Ordering::Release);
        self.emit_status(SessionStatus::Claiming);
        record
    }

    /// Mark dirty and schedule a coalesced flush. Repeated calls within the
    /// save window share one write.
    fn mark_dirty(&self) {
        if self.frozen.load(Ordering::Acquire) {
            return;
        }
        self.dirty.store(true, Ordering::Release);
        let mut timer = self.flush_timer.lock().unwrap();
        if timer.is_some() {
            return;
        }
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let window = Duration::from_secs(self.ctx.config.save_window_secs);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            session.flush_timer.lock().unwrap().take();
            if let Err(e) = session.flush_if_dirty().await {
                warn!("[session {}] debounced flush failed: {}", session.id, e);
            }
        }));
    }

    /// Idempotent flush of the write-back state.
    ///
    /// The snapshot and the store write happen under the state lock so a
    /// stale flush cannot land after a lifecycle write it raced with.
    pub async fn flush_if_dirty(&self) -> FaucetResult<()> {
        if self.frozen.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let state = self.state.lock().await;
        let record = snapshot(self.id, &state);
        self.ctx.store.upsert(&record).await
    }

    /// Synchronous persist; cancels any scheduled flush.
    async fn persist_now(&self) -> FaucetResult<()> {
        if let Some(handle) = self.flush_timer.lock().unwrap().take() {
            handle.abort();
        }
        self.dirty.store(false, Ordering::Release);
        let state = self.state.lock().await;
        let record = snapshot(self.id, &state);
        self.ctx.store.upsert(&record).await
    }

    fn emit_status(&self, status: SessionStatus) {
        let _ = self.ctx.events.send(SessionEvent {
            session_id: self.id,
            status,
        });
    }

    async fn schedule_advance(&self) {
        let at = {
            let state = self.state.lock().await;
            if state.status != SessionStatus::Running {
                return;
            }
            let deadline = state
                .start_time
                .saturating_add(self.ctx.config.session_timeout_secs);
            state
                .tasks
                .iter()
                .map(|t| t.deadline)
                .min()
                .unwrap_or(deadline)
                .min(deadline)
        };
        self.schedule_advance_at(at);
    }

    fn schedule_advance_at(&self, at: u64) {
        let Some(session) = self.weak.upgrade() else {
            return;
        };
        let delay = at.saturating_sub(now_secs());
        let mut timer = self.advance_timer.lock().unwrap();
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            session.try_advance().await;
        }));
    }

    fn cancel_advance_timer(&self) {
        if let Some(handle) = self.advance_timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for FaucetSession {
    fn drop(&mut self) {
        if let Some(handle) = self.advance_timer.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.flush_timer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn snapshot(id: Uuid, state: &SessionState) -> SessionRecord {
    SessionRecord {
        id,
        status: state.status,
        start_time: state.start_time,
        remote_ip: state.remote_ip.clone(),
        target_addr: state.target_addr,
        drop_amount: state.drop_amount,
        tasks: state.tasks.clone(),
        data: state.data.clone(),
        claim: state.claim.clone(),
        failed_code: state.failed_code.clone(),
        failed_reason: state.failed_reason.clone(),
    }
}
