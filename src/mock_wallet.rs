// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! A scripted wallet gateway used in test environments.

use crate::error::{FaucetError, FaucetResult};
use crate::wallet::{SentTx, TxReceipt, WalletGateway, WalletState};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

pub struct MockWallet {
    state: Mutex<WalletState>,
    // Scripted responses for `send`; when empty, sends succeed with a
    // deterministic hash and the wallet's running nonce.
    send_responses: Mutex<VecDeque<FaucetResult<SentTx>>>,
    sent: Mutex<Vec<(Address, U256, H256)>>,
    next_hash: AtomicU64,
    watched: Mutex<Vec<H256>>,
    confirm_senders: Mutex<HashMap<H256, oneshot::Sender<FaucetResult<TxReceipt>>>>,
    resolved: Mutex<HashMap<H256, FaucetResult<TxReceipt>>>,
    refill_calls: AtomicU64,
}

impl MockWallet {
    /// A ready wallet with ample funds.
    pub fn new() -> Self {
        Self::with_state(WalletState {
            ready: true,
            nonce: 0,
            balance: U256::from(1_000_000_000u64),
            native_balance: U256::from(1_000_000_000_000_000_000u64),
        })
    }

    pub fn with_state(state: WalletState) -> Self {
        Self {
            state: Mutex::new(state),
            send_responses: Default::default(),
            sent: Default::default(),
            next_hash: AtomicU64::new(1),
            watched: Default::default(),
            confirm_senders: Default::default(),
            resolved: Default::default(),
            refill_calls: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, state: WalletState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn queue_send_response(&self, response: FaucetResult<SentTx>) {
        self.send_responses.lock().unwrap().push_back(response);
    }

    /// Transfers submitted through `send`, in order.
    pub fn sent(&self) -> Vec<(Address, U256, H256)> {
        self.sent.lock().unwrap().clone()
    }

    /// Hashes with an active confirmation watch.
    pub fn watched(&self) -> Vec<H256> {
        self.watched.lock().unwrap().clone()
    }

    /// Resolve an in-flight (or future) confirmation watch.
    pub fn resolve_confirmation(&self, tx_hash: H256, result: FaucetResult<TxReceipt>) {
        let sender = self.confirm_senders.lock().unwrap().remove(&tx_hash);
        match sender {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => {
                self.resolved.lock().unwrap().insert(tx_hash, result);
            }
        }
    }

    pub fn refill_calls(&self) -> u64 {
        self.refill_calls.load(Ordering::Relaxed)
    }
}

impl Default for MockWallet {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletGateway for MockWallet {
    async fn get_state(&self) -> WalletState {
        *self.state.lock().unwrap()
    }

    async fn send(&self, target: Address, amount: U256) -> FaucetResult<SentTx> {
        let scripted = self.send_responses.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => {
                let mut state = self.state.lock().unwrap();
                let nonce = state.nonce;
                state.nonce += 1;
                let tx_hash =
                    H256::from_low_u64_be(self.next_hash.fetch_add(1, Ordering::Relaxed));
                Ok(SentTx { tx_hash, nonce })
            }
        };
        if let Ok(sent) = &result {
            self.sent.lock().unwrap().push((target, amount, sent.tx_hash));
        }
        result
    }

    async fn await_confirmation(&self, tx_hash: H256) -> FaucetResult<TxReceipt> {
        self.watched.lock().unwrap().push(tx_hash);
        if let Some(result) = self.resolved.lock().unwrap().remove(&tx_hash) {
            return result;
        }
        let receiver = {
            let (sender, receiver) = oneshot::channel();
            self.confirm_senders.lock().unwrap().insert(tx_hash, sender);
            receiver
        };
        receiver
            .await
            .map_err(|_| FaucetError::ConfirmationFailed("watch dropped".to_string()))?
    }

    async fn refill(&self) -> FaucetResult<()> {
        self.refill_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
