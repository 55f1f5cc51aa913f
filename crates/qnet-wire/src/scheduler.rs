//! Periodic maintenance: heartbeats, key rotation, state broadcasts.
//!
//! Each cycle runs in its own task on a fixed interval and stops when the
//! shutdown channel fires. A failure while talking to one peer is logged and
//! the cycle moves on to the next peer.

use crate::crypto::KeyEngine;
use crate::local::{CONTROL_TTL_SECS, DATA_TTL_SECS};
use crate::message::Payload;
use crate::outbound::{BroadcastReport, Outbound};
use chrono::Utc;
use futures::future::join_all;
use qnet_types::config::SchedulerConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Drives the three periodic cycles.
pub struct Scheduler {
    outbound: Outbound,
    engine: Arc<KeyEngine>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(outbound: Outbound, engine: Arc<KeyEngine>, config: SchedulerConfig) -> Self {
        Self {
            outbound,
            engine,
            config,
        }
    }

    /// Spawn the heartbeat, key-rotation and state-sync tasks.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let heartbeat = {
            let this = Arc::clone(&self);
            spawn_cycle(
                "heartbeat",
                self.config.heartbeat_interval(),
                shutdown.clone(),
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.heartbeat_cycle().await;
                    }
                },
            )
        };
        let rotation = {
            let this = Arc::clone(&self);
            spawn_cycle(
                "key_rotation",
                self.config.key_rotation_interval(),
                shutdown.clone(),
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.key_rotation_cycle().await;
                    }
                },
            )
        };
        let state_sync = {
            let this = Arc::clone(&self);
            spawn_cycle(
                "state_sync",
                self.config.state_sync_interval(),
                shutdown,
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.state_sync_cycle().await;
                    }
                },
            )
        };
        vec![heartbeat, rotation, state_sync]
    }

    /// Send a heartbeat to every peer, then evict peers that have been
    /// silent for too long.
    pub async fn heartbeat_cycle(&self) -> BroadcastReport {
        let payload = Payload::Heartbeat(self.outbound.local().heartbeat_payload());
        let report = self.outbound.broadcast(&payload, CONTROL_TTL_SECS).await;
        debug!(
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Heartbeat cycle complete"
        );

        if let Some(max_age) = self.config.stale_after() {
            let max_age = chrono::Duration::from_std(max_age)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
            for peer_id in self.outbound.registry().evict_stale(max_age, Utc::now()) {
                info!(peer = %peer_id, "Evicted stale peer");
            }
        }
        report
    }

    /// Rotate every expired key and push each new key to its peer.
    ///
    /// Returns the ids of peers whose key was rotated.
    pub async fn key_rotation_cycle(&self) -> Vec<String> {
        let registry = self.outbound.registry();
        let mut rotated = Vec::new();
        for peer_id in registry.keyed_peer_ids() {
            match self.engine.rotate_if_expired(registry, &peer_id) {
                Ok(Some(key)) => rotated.push((peer_id, key)),
                Ok(None) => {}
                Err(e) => warn!(peer = %peer_id, error = %e, "Key rotation failed"),
            }
        }

        let pushes = rotated.iter().map(|(peer_id, key)| async move {
            if let Err(e) = self.outbound.offer_key(peer_id, key).await {
                warn!(
                    peer = %peer_id,
                    key_id = %key.key_id,
                    error = %e,
                    "Failed to push rotated key"
                );
            }
        });
        join_all(pushes).await;

        rotated.into_iter().map(|(peer_id, _)| peer_id).collect()
    }

    /// Broadcast this node's scores and capabilities.
    pub async fn state_sync_cycle(&self) -> BroadcastReport {
        let payload = Payload::StateSync(self.outbound.local().state_sync_payload());
        let report = self.outbound.broadcast(&payload, DATA_TTL_SECS).await;
        debug!(
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "State sync cycle complete"
        );
        report
    }
}

/// Run `cycle` every `period` until `shutdown` fires. The first run happens
/// one period after start.
fn spawn_cycle<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    info!(cycle = name, interval_secs = period.as_secs(), "Starting periodic task");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => cycle().await,
                _ = shutdown.changed() => {
                    debug!(cycle = name, "Shutdown signal received");
                    break;
                }
            }
        }
    })
}
