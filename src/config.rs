// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use anyhow::anyhow;
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::amount_dec;

/// Top-level node configuration, loaded from a YAML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FaucetNodeConfig {
    // The port the status/metrics server listens on.
    pub server_listen_port: u16,
    // Wallet RPC endpoint and signing key.
    pub wallet: WalletConfig,
    // Session lifecycle parameters.
    pub faucet: FaucetConfig,
    // Claim queue / settlement parameters.
    #[serde(default)]
    pub claim: ClaimConfig,
    // Push-channel heartbeat parameters.
    #[serde(default)]
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WalletConfig {
    // JSON-RPC url of the fullnode used to submit transactions.
    pub rpc_url: String,
    // Hex-encoded private key of the faucet wallet.
    pub private_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FaucetConfig {
    // Smallest balance a session may claim.
    #[serde(with = "amount_dec")]
    pub min_drop_amount: U256,
    // Largest balance a session may claim; higher accruals are trimmed.
    #[serde(with = "amount_dec")]
    pub max_drop_amount: U256,
    // Session deadline, measured from start time.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    // Coalescing window for low-value persistence writes.
    #[serde(default = "default_save_window_secs")]
    pub save_window_secs: u64,
    // Interval of the storage sweep that fails orphaned timed-out sessions.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClaimConfig {
    // Cap on simultaneously pending (submitted, unconfirmed) claims.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    // Leave underfunded claims queued instead of failing them.
    #[serde(default = "default_true")]
    pub skip_when_underfunded: bool,
    // Balance kept back from settlement as an operational reserve.
    #[serde(default, with = "amount_dec")]
    pub spare_funds: U256,
    // Gas limit assumed per claim transaction.
    #[serde(default = "default_gas_limit", with = "amount_dec")]
    pub gas_limit: U256,
    // Fee ceiling used for the native-balance gas check.
    #[serde(default = "default_max_fee_per_gas", with = "amount_dec")]
    pub max_fee_per_gas: U256,
    // Fire the wallet's refill hook after each drain while the wallet is ready.
    #[serde(default)]
    pub refill_enabled: bool,
    // Wallet state refresh interval while the wallet is ready.
    #[serde(default = "default_refresh_ready_secs")]
    pub wallet_refresh_ready_secs: u64,
    // Wallet state refresh interval while the wallet is unreachable.
    #[serde(default = "default_refresh_unready_secs")]
    pub wallet_refresh_unready_secs: u64,
    // Retention of settled claims in the audit history map.
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
    // Period of the background drain tick.
    #[serde(default = "default_drain_interval_secs")]
    pub drain_interval_secs: u64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            skip_when_underfunded: true,
            spare_funds: U256::zero(),
            gas_limit: default_gas_limit(),
            max_fee_per_gas: default_max_fee_per_gas(),
            refill_enabled: false,
            wallet_refresh_ready_secs: default_refresh_ready_secs(),
            wallet_refresh_unready_secs: default_refresh_unready_secs(),
            history_retention_secs: default_history_retention_secs(),
            drain_interval_secs: default_drain_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotifyConfig {
    // Liveness probe interval.
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    // Grace period after an unanswered probe before the connection is closed.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_session_timeout_secs() -> u64 {
    1800
}
fn default_save_window_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    120
}
fn default_max_pending() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_gas_limit() -> U256 {
    U256::from(21_000u64)
}
fn default_max_fee_per_gas() -> U256 {
    // 100 gwei
    U256::from(100_000_000_000u64)
}
fn default_refresh_ready_secs() -> u64 {
    30
}
fn default_refresh_unready_secs() -> u64 {
    5
}
fn default_history_retention_secs() -> u64 {
    1800
}
fn default_drain_interval_secs() -> u64 {
    2
}
fn default_probe_interval_secs() -> u64 {
    30
}
fn default_probe_timeout_secs() -> u64 {
    10
}

impl FaucetNodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read config {:?}: {}", path, e))?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.faucet.min_drop_amount > self.faucet.max_drop_amount {
            return Err(anyhow!(
                "min-drop-amount {} exceeds max-drop-amount {}",
                self.faucet.min_drop_amount,
                self.faucet.max_drop_amount
            ));
        }
        if self.claim.max_pending == 0 {
            return Err(anyhow!("max-pending must be at least 1"));
        }
        if self.faucet.session_timeout_secs == 0 {
            return Err(anyhow!("session-timeout-secs must be positive"));
        }
        if self.wallet.rpc_url.is_empty() {
            return Err(anyhow!("wallet rpc-url must be set"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server-listen-port: 8080
wallet:
  rpc-url: "http://localhost:8545"
  private-key: "0x0101010101010101010101010101010101010101010101010101010101010101"
faucet:
  min-drop-amount: "10"
  max-drop-amount: "50"
claim:
  max-pending: 2
  spare-funds: "1000"
"#;

    #[test]
    fn test_parse_kebab_case_yaml() {
        let config: FaucetNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server_listen_port, 8080);
        assert_eq!(config.faucet.min_drop_amount, U256::from(10u64));
        assert_eq!(config.faucet.max_drop_amount, U256::from(50u64));
        assert_eq!(config.claim.max_pending, 2);
        assert_eq!(config.claim.spare_funds, U256::from(1000u64));
        // Unset fields take defaults
        assert_eq!(config.faucet.session_timeout_secs, 1800);
        assert_eq!(config.faucet.save_window_secs, 30);
        assert!(config.claim.skip_when_underfunded);
        assert_eq!(config.notify.probe_interval_secs, 30);
        assert_eq!(config.notify.probe_timeout_secs, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config: FaucetNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.faucet.min_drop_amount = U256::from(100u64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_pending_cap() {
        let mut config: FaucetNodeConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.claim.max_pending = 0;
        assert!(config.validate().is_err());
    }
}
