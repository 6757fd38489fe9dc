// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Histogram, IntCounter,
    IntCounterVec, IntGauge, Registry,
};

const CONFIRM_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.5, 1.0, 2.0, 4.0, 8.0, 15., 30., 60., 120., 240., 480., 900., 1800.,
];

#[derive(Clone, Debug)]
pub struct FaucetMetrics {
    pub(crate) sessions_started: IntCounter,
    pub(crate) sessions_completed: IntCounter,
    pub(crate) sessions_failed: IntCounterVec,
    pub(crate) sessions_active: IntGauge,
    pub(crate) sessions_swept: IntCounter,

    pub(crate) claims_created: IntCounter,
    pub(crate) claims_submitted: IntCounter,
    pub(crate) claims_confirmed: IntCounter,
    pub(crate) claims_failed: IntCounterVec,
    pub(crate) claim_amount_confirmed: IntCounter,
    pub(crate) claim_fees_paid: IntCounter,
    pub(crate) claim_confirm_latency: Histogram,

    pub(crate) queue_length: IntGauge,
    pub(crate) pending_claims: IntGauge,
    pub(crate) drain_errors: IntCounter,

    pub(crate) wallet_ready: IntGauge,
    pub(crate) wallet_balance: IntGauge,
    pub(crate) wallet_refreshes: IntCounter,

    pub(crate) notify_subscribers: IntGauge,
    pub(crate) server_uptime_seconds: IntGauge,
}

impl FaucetMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            sessions_started: register_int_counter_with_registry!(
                "faucet_sessions_started",
                "Total number of sessions that passed the gating pipeline",
                registry,
            )
            .unwrap(),
            sessions_completed: register_int_counter_with_registry!(
                "faucet_sessions_completed",
                "Total number of sessions that reached the claimable state",
                registry,
            )
            .unwrap(),
            sessions_failed: register_int_counter_vec_with_registry!(
                "faucet_sessions_failed",
                "Total number of failed sessions by error type",
                &["reason"],
                registry,
            )
            .unwrap(),
            sessions_active: register_int_gauge_with_registry!(
                "faucet_sessions_active",
                "Number of running sessions held in memory",
                registry,
            )
            .unwrap(),
            sessions_swept: register_int_counter_with_registry!(
                "faucet_sessions_swept",
                "Total number of orphaned sessions failed by the storage sweep",
                registry,
            )
            .unwrap(),
            claims_created: register_int_counter_with_registry!(
                "faucet_claims_created",
                "Total number of claims accepted into the settlement queue",
                registry,
            )
            .unwrap(),
            claims_submitted: register_int_counter_with_registry!(
                "faucet_claims_submitted",
                "Total number of claim transactions submitted to the wallet",
                registry,
            )
            .unwrap(),
            claims_confirmed: register_int_counter_with_registry!(
                "faucet_claims_confirmed",
                "Total number of claim transactions confirmed on chain",
                registry,
            )
            .unwrap(),
            claims_failed: register_int_counter_vec_with_registry!(
                "faucet_claims_failed",
                "Total number of terminally failed claims by error type",
                &["reason"],
                registry,
            )
            .unwrap(),
            claim_amount_confirmed: register_int_counter_with_registry!(
                "faucet_claim_amount_confirmed",
                "Total amount dispensed through confirmed claims",
                registry,
            )
            .unwrap(),
            claim_fees_paid: register_int_counter_with_registry!(
                "faucet_claim_fees_paid",
                "Total fees paid for confirmed claim transactions",
                registry,
            )
            .unwrap(),
            claim_confirm_latency: register_histogram_with_registry!(
                "faucet_claim_confirm_latency",
                "Seconds between claim creation and terminal settlement",
                CONFIRM_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            queue_length: register_int_gauge_with_registry!(
                "faucet_queue_length",
                "Claims waiting in the settlement queue",
                registry,
            )
            .unwrap(),
            pending_claims: register_int_gauge_with_registry!(
                "faucet_pending_claims",
                "Claims submitted and awaiting confirmation",
                registry,
            )
            .unwrap(),
            drain_errors: register_int_counter_with_registry!(
                "faucet_drain_errors",
                "Unexpected errors caught at the drain loop boundary",
                registry,
            )
            .unwrap(),
            wallet_ready: register_int_gauge_with_registry!(
                "faucet_wallet_ready",
                "1 while the wallet RPC is reachable",
                registry,
            )
            .unwrap(),
            wallet_balance: register_int_gauge_with_registry!(
                "faucet_wallet_balance",
                "Last observed wallet balance, saturated to i64",
                registry,
            )
            .unwrap(),
            wallet_refreshes: register_int_counter_with_registry!(
                "faucet_wallet_refreshes",
                "Total number of wallet state refreshes",
                registry,
            )
            .unwrap(),
            notify_subscribers: register_int_gauge_with_registry!(
                "faucet_notify_subscribers",
                "Connected claim notification subscribers",
                registry,
            )
            .unwrap(),
            server_uptime_seconds: register_int_gauge_with_registry!(
                "faucet_server_uptime_seconds",
                "Process uptime in seconds",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::new(&Registry::new()))
    }
}
