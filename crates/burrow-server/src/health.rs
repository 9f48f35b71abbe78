//! Health and recovery sweeps
//!
//! Session monitors handle the common path; the supervisor is the backstop
//! that evicts agents whose heartbeats stopped without the connection
//! visibly dying, and cleans up sessions whose monitor task is gone.

use crate::session::ConnectionManager;
use burrow_registry::AgentRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

pub struct HealthSupervisor {
    agents: Arc<AgentRegistry>,
    manager: Arc<ConnectionManager>,
    /// Silence threshold before a connected agent is evicted
    disconnect_after: Duration,
}

impl HealthSupervisor {
    pub fn new(
        agents: Arc<AgentRegistry>,
        manager: Arc<ConnectionManager>,
        disconnect_after: Duration,
    ) -> Self {
        Self {
            agents,
            manager,
            disconnect_after,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tick.tick() => self.sweep(),
            }
        }
    }

    fn sweep(&self) {
        for session in self.manager.sessions() {
            if session.mux().is_closed() {
                // Monitor normally handles this; the sweep catches sessions
                // whose monitor died with the connection
                if self.manager.remove(&session) {
                    self.agents.mark_disconnected(&session.agent_id);
                    debug!(agent_id = %session.agent_id, "swept dead session");
                }
                continue;
            }

            let silent_ms = session.mux().last_pong_age_ms();
            if silent_ms > self.disconnect_after.as_millis() as u64 {
                warn!(
                    agent_id = %session.agent_id,
                    silent_ms,
                    "agent unresponsive, evicting"
                );
                session.mux().close("no heartbeat answer, evicted");
            }
        }
    }
}
