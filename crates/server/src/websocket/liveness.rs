//! Heartbeat sweep
//!
//! Each sweep evicts connections that did not answer the previous sweep's
//! ping and pings the rest, so a dead peer is gone within two intervals.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::room::RoomRegistry;

/// Close code sent to connections that stopped answering pings
const EVICTION_CLOSE_CODE: u16 = 1001;

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub evicted: usize,
}

pub struct LivenessMonitor {
    registry: Arc<RoomRegistry>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<RoomRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Run one sweep over every local connection
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for conn in self.registry.connections().await {
            if !conn.take_alive() {
                tracing::info!(
                    session_id = %conn.session_id,
                    conversation_id = %conn.conversation_id,
                    last_activity = %conn.last_activity_at(),
                    "Evicting unresponsive connection"
                );
                conn.close(EVICTION_CLOSE_CODE, "heartbeat timeout");
                self.registry.leave(&conn).await;
                report.evicted += 1;
                continue;
            }

            if conn.ping().is_err() {
                // Writer already gone; the socket task is cleaning up
                self.registry.leave(&conn).await;
                report.evicted += 1;
            } else {
                report.pinged += 1;
            }
        }

        if report.evicted > 0 {
            tracing::debug!(
                pinged = report.pinged,
                evicted = report.evicted,
                "Liveness sweep finished"
            );
        }
        report
    }

    /// Sweep forever at the configured interval
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Liveness monitor started"
        );
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }
}
