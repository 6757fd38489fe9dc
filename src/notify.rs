// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Claim notification channel.
//!
//! Delivery plumbing over the queue's progress broadcast: per-session
//! subscriptions, an update push on every progress change, and
//! heartbeat-based liveness. Holds no settlement state of its own - a
//! subscription is validated against the persisted session row and closed
//! once the claim reaches a terminal state.
//!
//! The wire transport is out of scope; subscribers are `ClientSink` trait
//! objects the transport layer implements.

use crate::claim::ClaimQueue;
use crate::config::NotifyConfig;
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::store::SessionStore;
use crate::types::{QueueProgress, SessionStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Push message envelope: `{"action": ..., "data": ...}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
pub enum NotifyMessage {
    Update(QueueProgress),
    Error { reason: String },
    Ping,
}

/// Outbound half of a subscriber connection.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, message: NotifyMessage) -> FaucetResult<()>;
    async fn close(&self);
}

struct Subscriber {
    session_id: Uuid,
    sink: Arc<dyn ClientSink>,
    /// Set when a probe goes out; cleared by the pong.
    awaiting_pong_since: Option<Instant>,
}

pub struct ClaimNotifier {
    store: Arc<dyn SessionStore>,
    queue: Arc<ClaimQueue>,
    config: NotifyConfig,
    metrics: Option<Arc<FaucetMetrics>>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_sub_id: AtomicU64,
}

impl ClaimNotifier {
    pub fn new(
        store: Arc<dyn SessionStore>,
        queue: Arc<ClaimQueue>,
        config: NotifyConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            metrics: None,
            subscribers: Mutex::new(HashMap::new()),
            next_sub_id: AtomicU64::new(1),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<FaucetMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Accept a subscription for `session_id`. The session must be claiming
    /// with a claim attached; otherwise an error message is pushed and the
    /// sink closed.
    pub async fn subscribe(
        &self,
        session_id: Uuid,
        sink: Arc<dyn ClientSink>,
    ) -> FaucetResult<u64> {
        if let Err(e) = self.validate(session_id).await {
            let _ = sink
                .send(NotifyMessage::Error {
                    reason: e.to_string(),
                })
                .await;
            sink.close().await;
            return Err(e);
        }
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.insert(
                sub_id,
                Subscriber {
                    session_id,
                    sink: sink.clone(),
                    awaiting_pong_since: None,
                },
            );
        }
        self.update_gauge().await;
        debug!("[notify] session {} subscribed ({})", session_id, sub_id);
        let _ = sink.send(NotifyMessage::Update(self.queue.progress())).await;
        Ok(sub_id)
    }

    async fn validate(&self, session_id: Uuid) -> FaucetResult<()> {
        let Some(row) = self.store.get_by_id(&session_id).await? else {
            return Err(FaucetError::NotClaimable("unknown session".to_string()));
        };
        if row.status != SessionStatus::Claiming {
            return Err(FaucetError::NotClaimable(format!(
                "session is {}",
                row.status
            )));
        }
        if row.claim.is_none() {
            return Err(FaucetError::InternalError(
                "claiming session has no claim".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, sub_id: u64) {
        self.remove_subscriber(sub_id, false).await;
    }

    /// Record a liveness response.
    pub async fn pong(&self, sub_id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        if let Some(sub) = subscribers.get_mut(&sub_id) {
            sub.awaiting_pong_since = None;
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Push one update to every subscriber; closes subscriptions whose
    /// claim has settled and drops sinks that error.
    pub async fn broadcast_update(&self, progress: QueueProgress) {
        let targets: Vec<(u64, Uuid, Arc<dyn ClientSink>)> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .iter()
                .map(|(id, s)| (*id, s.session_id, s.sink.clone()))
                .collect()
        };
        for (sub_id, session_id, sink) in targets {
            if sink.send(NotifyMessage::Update(progress)).await.is_err() {
                debug!("[notify] dropping dead subscriber {}", sub_id);
                self.remove_subscriber(sub_id, false).await;
                continue;
            }
            if self.claim_settled(session_id).await {
                self.remove_subscriber(sub_id, true).await;
            }
        }
    }

    /// Whether the subscriber's claim reached a terminal state; the final
    /// update above was its last message.
    async fn claim_settled(&self, session_id: Uuid) -> bool {
        match self.store.get_by_id(&session_id).await {
            Ok(Some(row)) => row
                .claim
                .map(|claim| claim.status.is_terminal())
                .unwrap_or(false),
            Ok(None) => true,
            Err(e) => {
                warn!("[notify] settle check for {} failed: {}", session_id, e);
                false
            }
        }
    }

    /// Send a liveness probe to every subscriber not already awaiting one.
    pub async fn send_probes(&self) {
        let targets: Vec<(u64, Arc<dyn ClientSink>)> = {
            let mut subscribers = self.subscribers.lock().await;
            let now = Instant::now();
            subscribers
                .iter_mut()
                .filter(|(_, s)| s.awaiting_pong_since.is_none())
                .map(|(id, s)| {
                    s.awaiting_pong_since = Some(now);
                    (*id, s.sink.clone())
                })
                .collect()
        };
        for (sub_id, sink) in targets {
            if sink.send(NotifyMessage::Ping).await.is_err() {
                self.remove_subscriber(sub_id, false).await;
            }
        }
    }

    /// Forcibly close subscribers whose probe went unanswered past the
    /// timeout.
    pub async fn reap_dead(&self) {
        let timeout = Duration::from_secs(self.config.probe_timeout_secs);
        let stale: Vec<u64> = {
            let subscribers = self.subscribers.lock().await;
            subscribers
                .iter()
                .filter(|(_, s)| {
                    s.awaiting_pong_since
                        .map(|at| at.elapsed() > timeout)
                        .unwrap_or(false)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for sub_id in stale {
            warn!("[notify] closing unresponsive subscriber {}", sub_id);
            self.remove_subscriber(sub_id, true).await;
        }
    }

    async fn remove_subscriber(&self, sub_id: u64, close: bool) {
        let removed = {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.remove(&sub_id)
        };
        if let Some(sub) = removed {
            if close {
                sub.sink.close().await;
            }
        }
        self.update_gauge().await;
    }

    async fn update_gauge(&self) {
        if let Some(m) = &self.metrics {
            m.notify_subscribers
                .set(self.subscribers.lock().await.len() as i64);
        }
    }

    /// Drive the channel: fan out progress changes and run the heartbeat.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            let mut progress_rx = notifier.queue.progress_rx();
            let mut probe = tokio::time::interval(Duration::from_secs(
                notifier.config.probe_interval_secs.max(1),
            ));
            let mut reap = tokio::time::interval(Duration::from_secs(
                notifier.config.probe_timeout_secs.max(1),
            ));
            probe.tick().await;
            reap.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = progress_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let progress = *progress_rx.borrow_and_update();
                        notifier.broadcast_update(progress).await;
                    }
                    _ = probe.tick() => notifier.send_probes().await,
                    _ = reap.tick() => notifier.reap_dead().await,
                }
            }
        })
    }
}
