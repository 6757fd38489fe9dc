// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reward-gating module pipeline.
//!
//! Modules register with a priority. Hooks of the same priority run
//! concurrently; priorities run in ascending order as sequential barriers.
//! When a hook errors, its in-flight siblings still run to completion before
//! the first error (in registration order) is surfaced.

use crate::claim::ClaimTx;
use crate::error::FaucetResult;
use crate::session::FaucetSession;
use async_trait::async_trait;
use ethers::types::U256;
use futures::future::join_all;
use std::sync::Arc;

/// Fixed-point scale for reward factors: 10_000 == 100%.
pub const FACTOR_SCALE: u64 = 10_000;

/// A single reward multiplier reported by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardFactor {
    /// Fixed-point percentage, `FACTOR_SCALE` == neutral.
    pub factor: u64,
    /// Module that produced the factor, for logging.
    pub module: &'static str,
}

/// Reward-gating collaborator interface.
///
/// All hooks have no-op defaults; modules implement only what they gate.
#[async_trait]
pub trait FaucetModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called while the session is starting; an error blocks the session.
    async fn on_session_start(
        &self,
        _session: &FaucetSession,
        _input: &serde_json::Value,
    ) -> FaucetResult<()> {
        Ok(())
    }

    /// Called when the session's remote identifier changes.
    async fn on_remote_update(
        &self,
        _session: &FaucetSession,
        _remote_ip: &str,
    ) -> FaucetResult<()> {
        Ok(())
    }

    /// Multipliers applied to every reward accrual.
    async fn reward_factors(&self, _session: &FaucetSession) -> Vec<RewardFactor> {
        Vec::new()
    }

    /// Notification that the session reached the claimable state.
    async fn on_session_complete(&self, _session: &FaucetSession) {}

    /// Validation hook run during claim creation; an error rejects the claim.
    async fn on_claim_create(
        &self,
        _session: &FaucetSession,
        _input: &serde_json::Value,
    ) -> FaucetResult<()> {
        Ok(())
    }

    /// Notification that a claim confirmed on chain.
    async fn on_session_claimed(&self, _claim: &ClaimTx) {}
}

/// Priority-ordered module collection with barrier execution.
pub struct ModulePipeline {
    // Sorted by priority; sort is stable so registration order breaks ties.
    modules: Vec<(u32, Arc<dyn FaucetModule>)>,
}

impl ModulePipeline {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    pub fn register(&mut self, priority: u32, module: Arc<dyn FaucetModule>) {
        self.modules.push((priority, module));
        self.modules.sort_by_key(|(p, _)| *p);
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Slices of same-priority modules, ascending.
    fn tiers(&self) -> Vec<&[(u32, Arc<dyn FaucetModule>)]> {
        let mut tiers = Vec::new();
        let mut start = 0;
        for i in 1..=self.modules.len() {
            if i == self.modules.len() || self.modules[i].0 != self.modules[start].0 {
                tiers.push(&self.modules[start..i]);
                start = i;
            }
        }
        tiers
    }

    pub async fn run_session_start(
        &self,
        session: &FaucetSession,
        input: &serde_json::Value,
    ) -> FaucetResult<()> {
        for tier in self.tiers() {
            let results = join_all(
                tier.iter()
                    .map(|(_, m)| m.on_session_start(session, input)),
            )
            .await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    pub async fn run_remote_update(
        &self,
        session: &FaucetSession,
        remote_ip: &str,
    ) -> FaucetResult<()> {
        for tier in self.tiers() {
            let results = join_all(
                tier.iter()
                    .map(|(_, m)| m.on_remote_update(session, remote_ip)),
            )
            .await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    pub async fn collect_reward_factors(&self, session: &FaucetSession) -> Vec<RewardFactor> {
        let mut factors = Vec::new();
        for tier in self.tiers() {
            let collected =
                join_all(tier.iter().map(|(_, m)| m.reward_factors(session))).await;
            for entry in collected {
                factors.extend(entry);
            }
        }
        factors
    }

    pub async fn run_session_complete(&self, session: &FaucetSession) {
        for tier in self.tiers() {
            join_all(tier.iter().map(|(_, m)| m.on_session_complete(session))).await;
        }
    }

    pub async fn run_claim_create(
        &self,
        session: &FaucetSession,
        input: &serde_json::Value,
    ) -> FaucetResult<()> {
        for tier in self.tiers() {
            let results = join_all(
                tier.iter()
                    .map(|(_, m)| m.on_claim_create(session, input)),
            )
            .await;
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    pub async fn run_session_claimed(&self, claim: &ClaimTx) {
        for tier in self.tiers() {
            join_all(tier.iter().map(|(_, m)| m.on_session_claimed(claim))).await;
        }
    }
}

impl Default for ModulePipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply the multiplicative combination of `factors` to `amount`.
pub fn apply_factors(amount: U256, factors: &[RewardFactor]) -> U256 {
    factors.iter().fold(amount, |acc, f| {
        acc.saturating_mul(U256::from(f.factor)) / U256::from(FACTOR_SCALE)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaucetError;
    use crate::test_utils;
    use std::sync::Mutex;
    use std::time::Duration;

    struct RecordingModule {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        delay_ms: u64,
        fail_with: Option<FaucetError>,
    }

    #[async_trait]
    impl FaucetModule for RecordingModule {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_session_start(
            &self,
            _session: &FaucetSession,
            _input: &serde_json::Value,
        ) -> FaucetResult<()> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.log.lock().unwrap().push(self.name);
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn module(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        delay_ms: u64,
        fail_with: Option<FaucetError>,
    ) -> Arc<dyn FaucetModule> {
        Arc::new(RecordingModule {
            name,
            log: log.clone(),
            delay_ms,
            fail_with,
        })
    }

    #[tokio::test]
    async fn test_priorities_run_as_sequential_barriers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ModulePipeline::new();
        // Registered out of priority order on purpose
        pipeline.register(20, module("late", &log, 0, None));
        pipeline.register(10, module("early-slow", &log, 50, None));
        pipeline.register(10, module("early-fast", &log, 0, None));

        let env = test_utils::session_env();
        let session = test_utils::running_session(&env).await;
        pipeline
            .run_session_start(&session, &serde_json::Value::Null)
            .await
            .unwrap();

        let order = log.lock().unwrap().clone();
        // The slow priority-10 hook must finish before priority 20 starts
        assert_eq!(order, vec!["early-fast", "early-slow", "late"]);
    }

    #[tokio::test]
    async fn test_sibling_hooks_finish_before_error_surfaces() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ModulePipeline::new();
        pipeline.register(
            10,
            module(
                "failing",
                &log,
                0,
                Some(FaucetError::ModuleRejected {
                    module: "failing".into(),
                    code: "DENIED".into(),
                    message: "no".into(),
                }),
            ),
        );
        pipeline.register(10, module("slow-sibling", &log, 50, None));
        pipeline.register(20, module("never", &log, 0, None));

        let env = test_utils::session_env();
        let session = test_utils::running_session(&env).await;
        let err = pipeline
            .run_session_start(&session, &serde_json::Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "DENIED");

        let order = log.lock().unwrap().clone();
        // The in-flight sibling completed, the next tier never ran
        assert!(order.contains(&"slow-sibling"));
        assert!(!order.contains(&"never"));
    }

    #[tokio::test]
    async fn test_same_priority_hooks_run_concurrently() {
        // Two hooks that each sleep 40ms; sequential execution would take
        // 80ms+, the barrier runs them together.
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ModulePipeline::new();
        pipeline.register(10, module("a", &log, 40, None));
        pipeline.register(10, module("b", &log, 40, None));

        let env = test_utils::session_env();
        let session = test_utils::running_session(&env).await;
        let started = std::time::Instant::now();
        pipeline
            .run_session_start(&session, &serde_json::Value::Null)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(75));
    }

    #[test]
    fn test_factor_multiplication() {
        let factors = vec![
            RewardFactor {
                factor: 5_000, // 50%
                module: "half",
            },
            RewardFactor {
                factor: 20_000, // 200%
                module: "double",
            },
        ];
        // 1000 * 0.5 * 2.0 == 1000
        assert_eq!(
            apply_factors(U256::from(1000u64), &factors),
            U256::from(1000u64)
        );

        // Empty factor list is the identity
        assert_eq!(apply_factors(U256::from(7u64), &[]), U256::from(7u64));

        // A zero factor blanks the reward
        let zero = vec![RewardFactor {
            factor: 0,
            module: "blocked",
        }];
        assert_eq!(apply_factors(U256::from(1000u64), &zero), U256::zero());
    }
}
