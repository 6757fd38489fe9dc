// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Claim queue and settlement pipeline.
//!
//! Owns the full claim lifecycle: creation gates, the FIFO settlement queue,
//! wallet submission, confirmation watches and the persisted state behind
//! all of it. Claims settle strictly in `claim_index` order; an underfunded
//! claim at the head blocks everything behind it rather than being skipped.
//!
//! Storage is the source of truth. The in-memory queue, pending set and
//! claiming set are rebuilt from `Claiming` rows on startup, so every state
//! transition that affects settlement is written synchronously before the
//! pipeline moves on.

use super::history::ClaimHistory;
use super::types::{ClaimStatus, ClaimTx};
use crate::config::{ClaimConfig, FaucetConfig};
use crate::error::{FaucetError, FaucetResult};
use crate::hooks::ModulePipeline;
use crate::metrics::FaucetMetrics;
use crate::retry_with_max_elapsed_time;
use crate::session::FaucetSession;
use crate::store::SessionStore;
use crate::types::{now_secs, QueueProgress, SessionStatus};
use crate::wallet::{TxReceipt, WalletGateway, WalletState};
use ethers::types::H256;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct QueueInner {
    queue: VecDeque<ClaimTx>,
    pending: HashMap<H256, ClaimTx>,
    /// Sessions with a non-terminal claim; the exactly-once gate.
    claiming: HashSet<Uuid>,
    next_claim_index: u64,
    history: ClaimHistory,
    progress: QueueProgress,
}

struct WalletCache {
    state: WalletState,
    refreshed_at: Option<Instant>,
}

pub struct ClaimQueue {
    faucet_config: FaucetConfig,
    claim_config: ClaimConfig,
    store: Arc<dyn SessionStore>,
    wallet: Arc<dyn WalletGateway>,
    modules: Arc<ModulePipeline>,
    metrics: Option<Arc<FaucetMetrics>>,
    inner: Mutex<QueueInner>,
    drain_running: AtomicBool,
    refill_running: AtomicBool,
    progress_tx: watch::Sender<QueueProgress>,
    wallet_cache: Mutex<WalletCache>,
}

/// Clears the drain flag on every exit path, including panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ClaimQueue {
    pub fn new(
        faucet_config: FaucetConfig,
        claim_config: ClaimConfig,
        store: Arc<dyn SessionStore>,
        wallet: Arc<dyn WalletGateway>,
        modules: Arc<ModulePipeline>,
    ) -> Self {
        let retention = Duration::from_secs(claim_config.history_retention_secs);
        let (progress_tx, _) = watch::channel(QueueProgress::default());
        Self {
            faucet_config,
            claim_config,
            store,
            wallet,
            modules,
            metrics: None,
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                pending: HashMap::new(),
                claiming: HashSet::new(),
                next_claim_index: 1,
                history: ClaimHistory::new(retention),
                progress: QueueProgress::default(),
            }),
            drain_running: AtomicBool::new(false),
            refill_running: AtomicBool::new(false),
            progress_tx,
            wallet_cache: Mutex::new(WalletCache {
                state: WalletState::default(),
                refreshed_at: None,
            }),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<FaucetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Rebuild the queue from storage and re-attach confirmation watches.
    ///
    /// `Queued` and `Processing` claims return to the queue in index order
    /// (a `Processing` claim was interrupted before submission completed);
    /// `Pending` claims go back to the pending set with a fresh watch.
    /// Claims in any unrecognized state are logged and skipped, never
    /// promoted. The index counter resumes above the maximum seen.
    pub async fn initialize(self: &Arc<Self>) -> FaucetResult<()> {
        self.refresh_wallet_state().await;

        let rows = match retry_with_max_elapsed_time!(
            self.store.get_by_status(&[SessionStatus::Claiming]),
            Duration::from_secs(30)
        ) {
            Ok(rows) => rows?,
            Err(e) => return Err(e),
        };

        let mut queued: Vec<ClaimTx> = Vec::new();
        let mut watches: Vec<(H256, ClaimTx)> = Vec::new();
        let mut max_index = 0u64;
        for row in rows {
            let Some(claim) = row.claim else {
                warn!(
                    "[claim-queue] claiming session {} has no claim blob, skipping",
                    row.id
                );
                continue;
            };
            max_index = max_index.max(claim.claim_index);
            match claim.status {
                ClaimStatus::Queued | ClaimStatus::Processing => queued.push(claim),
                ClaimStatus::Pending => match claim.tx_hash {
                    Some(tx_hash) => watches.push((tx_hash, claim)),
                    None => warn!(
                        "[claim-queue] pending claim {} has no tx hash, skipping",
                        claim.claim_index
                    ),
                },
                ClaimStatus::Confirmed | ClaimStatus::Failed => {
                    debug!(
                        "[claim-queue] claim {} already terminal ({})",
                        claim.claim_index, claim.status
                    );
                }
                ClaimStatus::Unknown => warn!(
                    "[claim-queue] claim {} for session {} has unrecognized status, skipping",
                    claim.claim_index, claim.session_id
                ),
            }
        }
        queued.sort_by_key(|c| c.claim_index);

        {
            let mut inner = self.inner.lock().await;
            inner.next_claim_index = max_index + 1;
            for claim in &queued {
                inner.claiming.insert(claim.session_id);
            }
            for (tx_hash, claim) in &watches {
                inner.claiming.insert(claim.session_id);
                // Everything already submitted counts as processed
                if claim.claim_index > inner.progress.processed_idx {
                    inner.progress.processed_idx = claim.claim_index;
                }
                inner.pending.insert(*tx_hash, claim.clone());
            }
            info!(
                "[claim-queue] recovered {} queued and {} pending claims, next index {}",
                queued.len(),
                watches.len(),
                inner.next_claim_index
            );
            inner.queue = queued.into();
        }

        for (tx_hash, _) in watches {
            self.spawn_watch(tx_hash);
        }
        self.update_queue_gauges().await;
        self.broadcast_progress().await;
        Ok(())
    }

    /// Turn a claimable session into a queued claim.
    ///
    /// The claiming-set check and the index assignment happen under one
    /// lock, closing the race between the validation steps and insertion.
    /// The session row write carries the status flip, the trimmed amount and
    /// the claim blob in a single upsert.
    pub async fn create_claim(
        self: &Arc<Self>,
        session: &Arc<FaucetSession>,
        input: &serde_json::Value,
    ) -> FaucetResult<ClaimTx> {
        let status = session.status().await;
        if status != SessionStatus::Claimable {
            return Err(FaucetError::NotClaimable(format!("session is {}", status)));
        }
        let amount = session.drop_amount().await;
        if amount < self.faucet_config.min_drop_amount {
            return Err(FaucetError::AmountTooLow(format!(
                "{} is below the minimum {}",
                amount, self.faucet_config.min_drop_amount
            )));
        }
        // Above-maximum accruals are trimmed, not rejected
        let amount = amount.min(self.faucet_config.max_drop_amount);
        let Some(target_addr) = session.target_addr().await else {
            return Err(FaucetError::InvalidAddress(
                "session has no target address".to_string(),
            ));
        };

        self.modules.run_claim_create(session, input).await?;

        let claim = {
            let mut inner = self.inner.lock().await;
            if !inner.claiming.insert(session.id()) {
                return Err(FaucetError::RaceClaiming(session.id().to_string()));
            }
            let claim_index = inner.next_claim_index;
            inner.next_claim_index += 1;
            ClaimTx {
                session_id: session.id(),
                target_addr,
                amount,
                claim_index,
                status: ClaimStatus::Queued,
                tx_hash: None,
                tx_nonce: None,
                tx_block: None,
                tx_fee: None,
                error: None,
                created: now_secs(),
            }
        };

        let record = session.freeze_for_claim(claim.clone(), amount).await;
        if let Err(e) = self.store.upsert(&record).await {
            warn!(
                "[claim-queue] claim {} for session {} not persisted: {}",
                claim.claim_index,
                session.id(),
                e
            );
            let mut inner = self.inner.lock().await;
            inner.claiming.remove(&session.id());
            return Err(e);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.queue.push_back(claim.clone());
        }
        if let Some(m) = &self.metrics {
            m.claims_created.inc();
        }
        info!(
            "[claim-queue] claim {} queued: session={} amount={} target={:?}",
            claim.claim_index,
            claim.session_id,
            claim.amount,
            claim.target_addr
        );
        self.update_queue_gauges().await;
        Ok(claim)
    }

    /// Drain the queue. Single-flight: re-entrant calls while a drain is
    /// active return immediately. Errors are caught here so the next tick
    /// can retry.
    pub async fn process_queue(self: &Arc<Self>) {
        if self.drain_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = DrainGuard(&self.drain_running);
        if let Err(e) = self.drain().await {
            error!("[claim-queue] drain error: {}", e);
            if let Some(m) = &self.metrics {
                m.drain_errors.inc();
            }
        }
    }

    async fn drain(self: &Arc<Self>) -> FaucetResult<()> {
        loop {
            let head = {
                let inner = self.inner.lock().await;
                if inner.pending.len() >= self.claim_config.max_pending {
                    break;
                }
                match inner.queue.front() {
                    Some(claim) => claim.clone(),
                    None => break,
                }
            };

            if self.claim_config.skip_when_underfunded && !self.funds_available(&head).await {
                let waiting = self.inner.lock().await.queue.len();
                debug!(
                    "[claim-queue] funds gate holds claim {} ({} claims waiting)",
                    head.claim_index, waiting
                );
                break;
            }

            let claim = { self.inner.lock().await.queue.pop_front() };
            let Some(claim) = claim else { break };
            {
                let mut inner = self.inner.lock().await;
                if claim.claim_index > inner.progress.processed_idx {
                    inner.progress.processed_idx = claim.claim_index;
                }
            }
            self.process_claim(claim).await?;
        }

        self.maybe_refresh_wallet().await;
        if self.claim_config.refill_enabled {
            self.trigger_refill().await;
        }
        self.update_queue_gauges().await;
        self.broadcast_progress().await;
        Ok(())
    }

    /// Submit one claim. Funding and connectivity failures are terminal for
    /// the claim and are not retried; the session row keeps the failed claim
    /// for operator inspection.
    async fn process_claim(self: &Arc<Self>, mut claim: ClaimTx) -> FaucetResult<()> {
        let wallet = self.cached_wallet().await;
        if !wallet.ready {
            return self
                .fail_claim(
                    claim,
                    FaucetError::WalletUnreachable("cannot submit claim".to_string()),
                    None,
                )
                .await;
        }
        if wallet
            .balance
            .saturating_sub(self.claim_config.spare_funds)
            < claim.amount
        {
            return self
                .fail_claim(
                    claim,
                    FaucetError::OutOfFunds(format!("claim needs {}", claim.amount)),
                    None,
                )
                .await;
        }

        claim.status = ClaimStatus::Processing;
        self.persist_claim(&claim, None).await?;

        match self.wallet.send(claim.target_addr, claim.amount).await {
            Err(e) => self.fail_claim(claim, e, None).await,
            Ok(sent) => {
                claim.tx_hash = Some(sent.tx_hash);
                claim.tx_nonce = Some(sent.nonce);
                claim.status = ClaimStatus::Pending;
                self.persist_claim(&claim, None).await?;
                info!(
                    "[claim-queue] claim {} submitted: tx={:?} nonce={}",
                    claim.claim_index, sent.tx_hash, sent.nonce
                );
                {
                    let mut inner = self.inner.lock().await;
                    inner.pending.insert(sent.tx_hash, claim);
                }
                if let Some(m) = &self.metrics {
                    m.claims_submitted.inc();
                }
                self.spawn_watch(sent.tx_hash);
                Ok(())
            }
        }
    }

    fn spawn_watch(self: &Arc<Self>, tx_hash: H256) {
        let queue = self.clone();
        tokio::spawn(async move {
            let result = queue.wallet.await_confirmation(tx_hash).await;
            queue.settle_pending(tx_hash, result).await;
        });
    }

    /// Resolve a pending claim from its confirmation watch.
    ///
    /// A successful receipt finishes the session; a reverted receipt fails
    /// it. A watch failure (no receipt observed) is terminal for the claim
    /// but leaves the session row in `Claiming` for operator intervention.
    async fn settle_pending(self: &Arc<Self>, tx_hash: H256, result: FaucetResult<TxReceipt>) {
        let claim = { self.inner.lock().await.pending.remove(&tx_hash) };
        let Some(mut claim) = claim else {
            warn!("[claim-queue] confirmation for unknown tx {:?}", tx_hash);
            return;
        };

        let session_status = match result {
            Ok(receipt) if receipt.success => {
                claim.status = ClaimStatus::Confirmed;
                claim.tx_block = Some(receipt.block);
                claim.tx_fee = Some(receipt.fee);
                info!(
                    "[claim-queue] claim {} confirmed in block {} (fee {})",
                    claim.claim_index, receipt.block, receipt.fee
                );
                if let Some(m) = &self.metrics {
                    m.claims_confirmed.inc();
                    m.claim_amount_confirmed
                        .inc_by(saturating_u64(claim.amount));
                    m.claim_fees_paid.inc_by(saturating_u64(receipt.fee));
                    m.claim_confirm_latency
                        .observe(now_secs().saturating_sub(claim.created) as f64);
                }
                Some(SessionStatus::Finished)
            }
            Ok(receipt) => {
                claim.status = ClaimStatus::Failed;
                claim.tx_block = Some(receipt.block);
                claim.tx_fee = Some(receipt.fee);
                claim.error = Some("transaction reverted on chain".to_string());
                warn!(
                    "[claim-queue] claim {} reverted in block {}",
                    claim.claim_index, receipt.block
                );
                if let Some(m) = &self.metrics {
                    m.claims_failed.with_label_values(&["reverted"]).inc();
                }
                Some(SessionStatus::Failed)
            }
            Err(e) => {
                claim.status = ClaimStatus::Failed;
                claim.error = Some(e.to_string());
                warn!(
                    "[claim-queue] confirmation watch for claim {} failed: {}",
                    claim.claim_index, e
                );
                if let Some(m) = &self.metrics {
                    m.claims_failed.with_label_values(&[e.error_type()]).inc();
                }
                None
            }
        };

        let confirmed = claim.status == ClaimStatus::Confirmed;
        self.settle_locally(claim.clone()).await;
        if let Err(e) = self.persist_claim(&claim, session_status).await {
            warn!(
                "[claim-queue] persist of settled claim {} failed: {}",
                claim.claim_index, e
            );
        }
        if confirmed {
            self.modules.run_session_claimed(&claim).await;
        }
        self.update_queue_gauges().await;
        self.broadcast_progress().await;
        // A pending slot opened up
        self.process_queue().await;
    }

    /// Terminal failure path shared by the funds gate, submission errors
    /// and watch errors.
    async fn fail_claim(
        self: &Arc<Self>,
        mut claim: ClaimTx,
        err: FaucetError,
        session_status: Option<SessionStatus>,
    ) -> FaucetResult<()> {
        warn!(
            "[claim-queue] claim {} failed terminally: {}",
            claim.claim_index, err
        );
        claim.status = ClaimStatus::Failed;
        claim.error = Some(err.to_string());
        if let Some(m) = &self.metrics {
            m.claims_failed.with_label_values(&[err.error_type()]).inc();
        }
        self.settle_locally(claim.clone()).await;
        self.persist_claim(&claim, session_status).await
    }

    /// Remove a settled claim from the active sets and retire it into the
    /// audit history.
    async fn settle_locally(&self, claim: ClaimTx) {
        let mut inner = self.inner.lock().await;
        inner.claiming.remove(&claim.session_id);
        if claim.claim_index > inner.progress.confirmed_idx {
            inner.progress.confirmed_idx = claim.claim_index;
        }
        if let Some(nonce) = claim.tx_nonce {
            inner.history.insert(nonce, claim);
        }
    }

    /// Read-modify-write of the owning session row with the current claim
    /// blob; `session_status` optionally moves the session itself.
    async fn persist_claim(
        &self,
        claim: &ClaimTx,
        session_status: Option<SessionStatus>,
    ) -> FaucetResult<()> {
        let mut row = match self.store.get_by_id(&claim.session_id).await? {
            Some(row) => row,
            None => {
                warn!(
                    "[claim-queue] session row {} vanished, claim {} not persisted",
                    claim.session_id, claim.claim_index
                );
                return Ok(());
            }
        };
        row.claim = Some(claim.clone());
        if let Some(status) = session_status {
            row.status = status;
        }
        self.store.upsert(&row).await
    }

    async fn funds_available(&self, head: &ClaimTx) -> bool {
        let wallet = self.cached_wallet().await;
        if !wallet.ready {
            return false;
        }
        if wallet
            .balance
            .saturating_sub(self.claim_config.spare_funds)
            < head.amount
        {
            return false;
        }
        let gas_budget = self
            .claim_config
            .gas_limit
            .saturating_mul(self.claim_config.max_fee_per_gas);
        wallet.native_balance > gas_budget
    }

    async fn cached_wallet(&self) -> WalletState {
        self.wallet_cache.lock().await.state
    }

    /// Force a wallet state read, bypassing the refresh interval.
    pub async fn refresh_wallet_state(&self) {
        let state = self.wallet.get_state().await;
        {
            let mut cache = self.wallet_cache.lock().await;
            cache.state = state;
            cache.refreshed_at = Some(Instant::now());
        }
        if let Some(m) = &self.metrics {
            m.wallet_refreshes.inc();
            m.wallet_ready.set(if state.ready { 1 } else { 0 });
            m.wallet_balance
                .set(saturating_u64(state.balance).min(i64::MAX as u64) as i64);
        }
    }

    /// Refresh the wallet state when it is stale; the interval depends on
    /// whether the wallet was last seen ready.
    async fn maybe_refresh_wallet(&self) {
        let due = {
            let cache = self.wallet_cache.lock().await;
            let interval = if cache.state.ready {
                self.claim_config.wallet_refresh_ready_secs
            } else {
                self.claim_config.wallet_refresh_unready_secs
            };
            match cache.refreshed_at {
                None => true,
                Some(at) => at.elapsed() >= Duration::from_secs(interval),
            }
        };
        if due {
            self.refresh_wallet_state().await;
        }
    }

    /// Fire-and-forget refill trigger with its own single-flight guard.
    async fn trigger_refill(self: &Arc<Self>) {
        if !self.cached_wallet().await.ready {
            return;
        }
        if self.refill_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            if let Err(e) = queue.wallet.refill().await {
                warn!("[claim-queue] wallet refill failed: {}", e);
            }
            queue.refill_running.store(false, Ordering::Release);
        });
    }

    async fn broadcast_progress(&self) {
        let progress = { self.inner.lock().await.progress };
        self.progress_tx.send_if_modified(|current| {
            if *current != progress {
                *current = progress;
                true
            } else {
                false
            }
        });
    }

    async fn update_queue_gauges(&self) {
        if let Some(m) = &self.metrics {
            let inner = self.inner.lock().await;
            m.queue_length.set(inner.queue.len() as i64);
            m.pending_claims.set(inner.pending.len() as i64);
        }
    }

    /// Subscribe to queue progress changes.
    pub fn progress_rx(&self) -> watch::Receiver<QueueProgress> {
        self.progress_tx.subscribe()
    }

    pub fn progress(&self) -> QueueProgress {
        *self.progress_tx.borrow()
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn next_claim_index(&self) -> u64 {
        self.inner.lock().await.next_claim_index
    }

    /// Queued claims in settlement order, for inspection.
    pub async fn queued_claims(&self) -> Vec<ClaimTx> {
        self.inner.lock().await.queue.iter().cloned().collect()
    }

    /// The session's claim wherever it currently lives: queued, pending or
    /// recently settled.
    pub async fn claim_for_session(&self, session_id: &Uuid) -> Option<ClaimTx> {
        let inner = self.inner.lock().await;
        inner
            .queue
            .iter()
            .find(|c| c.session_id == *session_id)
            .or_else(|| inner.pending.values().find(|c| c.session_id == *session_id))
            .cloned()
            .or_else(|| {
                inner
                    .history
                    .iter()
                    .find(|c| c.session_id == *session_id)
                    .cloned()
            })
    }

    /// Settled claim lookup for audit, keyed by transaction nonce.
    pub async fn claim_by_nonce(&self, nonce: u64) -> Option<ClaimTx> {
        self.inner.lock().await.history.get(nonce).cloned()
    }
}

fn saturating_u64(value: ethers::types::U256) -> u64 {
    value.min(ethers::types::U256::from(u64::MAX)).as_u64()
}
