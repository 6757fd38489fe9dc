// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use eth_faucet::config::FaucetNodeConfig;
use eth_faucet::hooks::ModulePipeline;
use eth_faucet::node::run_faucet_node;
use eth_faucet::store::MemorySessionStore;
use eth_faucet::wallet::EthWalletGateway;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FaucetNodeConfig::load(&args.config_path)?;
    let prometheus_registry = prometheus::Registry::new();

    let wallet = Arc::new(
        EthWalletGateway::new(
            &config.wallet.rpc_url,
            &config.wallet.private_key,
            config.claim.gas_limit,
        )
        .await?,
    );
    let store = Arc::new(MemorySessionStore::new());
    // Deployments register their gating modules (proof of work, captcha,
    // address screening, ...) here before the node starts.
    let modules = ModulePipeline::new();

    let handle = run_faucet_node(config, store, wallet, modules, prometheus_registry).await?;
    info!("faucet node started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down, flushing dirty sessions");
    handle.shutdown().await;
    Ok(())
}
