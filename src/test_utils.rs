// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared test fixtures.

use crate::claim::{ClaimQueue, ClaimStatus, ClaimTx};
use crate::config::{ClaimConfig, FaucetConfig, NotifyConfig};
use crate::hooks::ModulePipeline;
use crate::mock_wallet::MockWallet;
use crate::session::{FaucetSession, SessionContext, SessionEvent};
use crate::store::{MemorySessionStore, SessionStore};
use crate::types::{now_secs, SessionRecord, SessionStatus};
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

pub fn test_addr() -> Address {
    Address::from_low_u64_be(0xfa_0c_e7)
}

pub fn faucet_config() -> FaucetConfig {
    FaucetConfig {
        min_drop_amount: U256::from(10u64),
        max_drop_amount: U256::from(50u64),
        session_timeout_secs: 600,
        save_window_secs: 30,
        sweep_interval_secs: 120,
    }
}

pub fn claim_config() -> ClaimConfig {
    ClaimConfig {
        max_pending: 2,
        skip_when_underfunded: true,
        spare_funds: U256::zero(),
        gas_limit: U256::from(21_000u64),
        max_fee_per_gas: U256::from(10u64),
        refill_enabled: false,
        wallet_refresh_ready_secs: 30,
        wallet_refresh_unready_secs: 5,
        history_retention_secs: 1800,
        drain_interval_secs: 2,
    }
}

pub fn notify_config() -> NotifyConfig {
    NotifyConfig {
        probe_interval_secs: 30,
        probe_timeout_secs: 10,
    }
}

pub struct TestEnv {
    pub store: Arc<MemorySessionStore>,
    pub ctx: Arc<SessionContext>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
}

impl TestEnv {
    /// Hand the event receiver to a registry event loop.
    pub async fn take_events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events
            .lock()
            .await
            .take()
            .expect("event receiver already taken")
    }
}

pub fn session_env() -> TestEnv {
    session_env_with(ModulePipeline::new())
}

pub fn session_env_with(modules: ModulePipeline) -> TestEnv {
    let store = Arc::new(MemorySessionStore::new());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(SessionContext {
        config: faucet_config(),
        store: store.clone() as Arc<dyn SessionStore>,
        modules: Arc::new(modules),
        events: events_tx,
    });
    TestEnv {
        store,
        ctx,
        events: Mutex::new(Some(events_rx)),
    }
}

pub async fn running_session(env: &TestEnv) -> Arc<FaucetSession> {
    FaucetSession::start(
        env.ctx.clone(),
        "198.51.100.7".to_string(),
        serde_json::json!({}),
    )
    .await
    .expect("session start")
}

/// A session driven to `Claimable` with the given accrued amount.
pub async fn claimable_session(env: &TestEnv, amount: u64) -> Arc<FaucetSession> {
    let session = running_session(env).await;
    session.add_reward(U256::from(amount)).await;
    session.set_target_addr(test_addr()).await.unwrap();
    session.try_advance().await;
    assert_eq!(session.status().await, SessionStatus::Claimable);
    session
}

pub fn claim_queue(env: &TestEnv, wallet: Arc<MockWallet>) -> Arc<ClaimQueue> {
    Arc::new(ClaimQueue::new(
        faucet_config(),
        claim_config(),
        env.store.clone() as Arc<dyn SessionStore>,
        wallet,
        env.ctx.modules.clone(),
    ))
}

/// A claim blob as a previous process would have persisted it.
pub fn stored_claim(index: u64, status: ClaimStatus, tx_hash: Option<H256>) -> ClaimTx {
    ClaimTx {
        session_id: Uuid::new_v4(),
        target_addr: test_addr(),
        amount: U256::from(25u64),
        claim_index: index,
        status,
        tx_hash,
        tx_nonce: tx_hash.map(|_| index),
        tx_block: None,
        tx_fee: None,
        error: None,
        created: now_secs(),
    }
}

/// The session row that owns `claim`, in the `Claiming` state.
pub fn claiming_row(claim: ClaimTx) -> SessionRecord {
    SessionRecord {
        id: claim.session_id,
        status: SessionStatus::Claiming,
        start_time: now_secs(),
        remote_ip: "198.51.100.7".to_string(),
        target_addr: Some(claim.target_addr),
        drop_amount: Some(claim.amount),
        tasks: vec![],
        data: HashMap::new(),
        claim: Some(claim),
        failed_code: None,
        failed_reason: None,
    }
}

/// Poll `condition` until it holds or a 5 second budget runs out.
pub async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within timeout");
}
