// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wallet gateway contract and a thin JSON-RPC implementation.
//!
//! The settlement pipeline only needs a narrow capability: read the wallet
//! state, submit a value transfer, and await its receipt. Key management and
//! provider internals stay behind this trait.

use crate::error::{FaucetError, FaucetResult};
use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockNumber, TransactionRequest, H256, U256};
use std::time::Duration;
use tracing::warn;

/// Wallet snapshot used by the funds gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalletState {
    /// False while the RPC endpoint is unreachable; never an error.
    pub ready: bool,
    pub nonce: u64,
    /// Balance of the dispensed token.
    pub balance: U256,
    /// Balance of the native token paying for gas. Equal to `balance` when
    /// the faucet dispenses the native token itself.
    pub native_balance: U256,
}

/// A submitted, not yet confirmed transaction.
#[derive(Debug, Clone, Copy)]
pub struct SentTx {
    pub tx_hash: H256,
    pub nonce: u64,
}

/// Resolved confirmation of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub success: bool,
    pub block: u64,
    pub fee: U256,
}

#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Read the wallet state. RPC outages surface as `ready = false`, not
    /// as an error.
    async fn get_state(&self) -> WalletState;

    /// Build, sign and submit a transfer of `amount` to `target`.
    async fn send(&self, target: Address, amount: U256) -> FaucetResult<SentTx>;

    /// Await the receipt of a previously submitted transaction. Also used to
    /// re-attach watches for claims recovered in the pending state.
    async fn await_confirmation(&self, tx_hash: H256) -> FaucetResult<TxReceipt>;

    /// Optional refill mechanism, triggered fire-and-forget after a drain.
    async fn refill(&self) -> FaucetResult<()> {
        Ok(())
    }
}

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);
// ~20 minutes of polling before the watch itself is declared failed
const RECEIPT_POLL_ATTEMPTS: u32 = 600;

/// Native-token wallet over an ethers HTTP provider with a local signer.
pub struct EthWalletGateway {
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    address: Address,
    gas_limit: U256,
}

impl EthWalletGateway {
    pub async fn new(rpc_url: &str, private_key: &str, gas_limit: U256) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)?;
        let chain_id = provider.get_chainid().await?;
        let wallet: LocalWallet = private_key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()?
            .with_chain_id(chain_id.as_u64());
        let address = wallet.address();
        Ok(Self {
            client: SignerMiddleware::new(provider, wallet),
            address,
            gas_limit,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl WalletGateway for EthWalletGateway {
    async fn get_state(&self) -> WalletState {
        let balance = match self.client.get_balance(self.address, None).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!("wallet balance query failed: {:?}", e);
                return WalletState::default();
            }
        };
        let nonce = match self
            .client
            .get_transaction_count(self.address, Some(BlockNumber::Pending.into()))
            .await
        {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!("wallet nonce query failed: {:?}", e);
                return WalletState::default();
            }
        };
        WalletState {
            ready: true,
            nonce: nonce.as_u64(),
            balance,
            native_balance: balance,
        }
    }

    async fn send(&self, target: Address, amount: U256) -> FaucetResult<SentTx> {
        let nonce = self
            .client
            .get_transaction_count(self.address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| FaucetError::SubmissionFailed(format!("nonce query: {}", e)))?;
        let tx = TransactionRequest::new()
            .to(target)
            .value(amount)
            .nonce(nonce)
            .gas(self.gas_limit);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| FaucetError::SubmissionFailed(e.to_string()))?;
        Ok(SentTx {
            tx_hash: *pending,
            nonce: nonce.as_u64(),
        })
    }

    async fn await_confirmation(&self, tx_hash: H256) -> FaucetResult<TxReceipt> {
        for _ in 0..RECEIPT_POLL_ATTEMPTS {
            match self.client.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    let success = receipt.status == Some(1u64.into());
                    let fee = receipt
                        .gas_used
                        .unwrap_or_default()
                        .saturating_mul(receipt.effective_gas_price.unwrap_or_default());
                    return Ok(TxReceipt {
                        success,
                        block: receipt.block_number.map(|b| b.as_u64()).unwrap_or_default(),
                        fee,
                    });
                }
                Ok(None) => tokio::time::sleep(RECEIPT_POLL_INTERVAL).await,
                Err(e) => {
                    return Err(FaucetError::ConfirmationFailed(e.to_string()));
                }
            }
        }
        Err(FaucetError::ConfirmationFailed(format!(
            "no receipt for {:?} after {} polls",
            tx_hash, RECEIPT_POLL_ATTEMPTS
        )))
    }
}
