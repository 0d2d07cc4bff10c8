//! Periodic liveness probing for long-lived HTTP clients.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionState, Session};
use crate::error::McpResult;

/// A client that can be probed by [`spawn_heartbeat`].
#[async_trait]
pub(crate) trait Heartbeat: Send + Sync + 'static {
    fn heartbeat_session(&self) -> &Session;

    /// One liveness probe.
    async fn probe(&self) -> McpResult<()>;

    /// Called after every failed probe.
    fn on_missed_heartbeat(&self) {}
}

/// Probe `target` every `interval` until `cancel` fires or the target is
/// dropped. `threshold` consecutive misses mark a ready client degraded; the
/// next successful probe restores it.
pub(crate) fn spawn_heartbeat<T: Heartbeat>(
    target: Weak<T>,
    interval: Duration,
    threshold: u32,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(target) = target.upgrade() else { break };
            let session = target.heartbeat_session();
            if !session.state().is_usable() {
                continue;
            }

            match target.probe().await {
                Ok(()) => {
                    if session.transition(ConnectionState::Degraded, ConnectionState::Ready) {
                        info!(server = %session.server_id(), "Heartbeat recovered, connection ready");
                    }
                    misses = 0;
                }
                Err(e) => {
                    misses += 1;
                    target.on_missed_heartbeat();
                    warn!(
                        server = %session.server_id(),
                        misses,
                        error = %e,
                        "Heartbeat failed"
                    );
                    if misses >= threshold
                        && session.transition(ConnectionState::Ready, ConnectionState::Degraded)
                    {
                        warn!(server = %session.server_id(), "Marking connection degraded");
                    }
                }
            }
        }

        debug!("Heartbeat stopped");
    }))
}
