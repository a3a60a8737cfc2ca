use crate::error::Result;
use crate::registry::{HeartbeatCheck, NodeRegistry};
use crate::traits::NodeLossHandler;
use flotilla_core::{Clock, NodeId};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Configuration for the heartbeat monitor
#[derive(Debug, Clone)]
pub struct HeartbeatMonitorConfig {
    /// Interval between sweeps, also the expected heartbeat cadence
    pub check_interval: Duration,
    /// Missed intervals tolerated before a node is declared Inactive
    pub missed_threshold: u32,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            // Inactive after 40s of silence
            missed_threshold: 3,
        }
    }
}

/// Periodically checks node heartbeats and reclaims jobs from dead nodes
pub struct HeartbeatMonitor {
    registry: Arc<NodeRegistry>,
    handler: Arc<dyn NodeLossHandler>,
    clock: Arc<dyn Clock>,
    config: HeartbeatMonitorConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        handler: Arc<dyn NodeLossHandler>,
        clock: Arc<dyn Clock>,
        config: HeartbeatMonitorConfig,
    ) -> Self {
        Self {
            registry,
            handler,
            clock,
            config,
        }
    }

    /// Run the monitor loop until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(
            "Starting heartbeat monitor (interval: {:?}, missed threshold: {})",
            self.config.check_interval, self.config.missed_threshold
        );

        let mut interval = tokio::time::interval(self.config.check_interval);
        // Consume the first immediate tick, nodes just registered
        interval.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Heartbeat monitor shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let lost = self.sweep().await;
                    if !lost.is_empty() {
                        info!("Heartbeat sweep declared {} node(s) inactive", lost.len());
                    }
                }
            }
        }
    }

    /// Check every live node once; returns the nodes that went Inactive
    pub async fn sweep(&self) -> Vec<NodeId> {
        debug!("Running heartbeat sweep");
        let now = self.clock.now();
        let mut lost = Vec::new();

        for node_id in self.registry.live_node_ids() {
            let check = self.registry.record_missed_heartbeat(
                &node_id,
                now,
                self.config.check_interval,
                self.config.missed_threshold,
            );

            match check {
                Ok(HeartbeatCheck::Lost { jobs }) => {
                    self.handler.on_node_lost(&node_id, jobs).await;
                    lost.push(node_id);
                }
                Ok(HeartbeatCheck::Suspected { missed }) => {
                    debug!("Node {} has missed {} heartbeat(s)", node_id, missed);
                }
                Ok(HeartbeatCheck::Fresh) | Ok(HeartbeatCheck::AlreadyInactive) => {}
                // Deregistered between listing and checking
                Err(e) => error!("Heartbeat check for node {} failed: {}", node_id, e),
            }
        }

        lost
    }
}
