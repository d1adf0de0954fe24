use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::bus;
use crate::clock::millis_between;
use crate::connection::ConnectionState;
use crate::manager::PeeringManager;

/// Health of one registered connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealth {
    pub peer_id: String,
    pub state: ConnectionState,
    pub idle_secs: u64,
    pub coherence: f64,
    pub strength: Option<f64>,
    pub success_rate: f64,
}

/// Result of one health check pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub total_connections: usize,
    pub active: usize,
    pub degraded: usize,
    /// Peers demoted during this pass
    pub demoted: Vec<String>,
    pub average_coherence: f64,
    pub peers: Vec<PeerHealth>,
}

/// Periodic connection health check. Active connections idle for longer
/// than the inactivity threshold are demoted to Degraded; they are not
/// removed.
pub struct HealthMonitor {
    manager: Arc<PeeringManager>,
    last_report: Mutex<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<PeeringManager>) -> Self {
        Self {
            manager,
            last_report: Mutex::new(None),
        }
    }

    /// Run one pass, publish `peer.degraded` for each demotion and a
    /// `peer.health` summary.
    pub async fn check(&self) -> HealthReport {
        let now = self.manager.clock().now();
        let threshold_secs = self.manager.config().inactivity_threshold().as_secs_f64();

        let mut demoted = Vec::new();
        for conn in self.manager.connections() {
            let idle_secs = millis_between(conn.last_activity, now).max(0.0) / 1000.0;
            if conn.state == ConnectionState::Active
                && idle_secs > threshold_secs
                && self.manager.demote(&conn.peer_id, idle_secs as u64)
            {
                demoted.push((conn.peer_id.clone(), idle_secs as u64));
            }
        }

        for (peer_id, idle_secs) in &demoted {
            let payload = json!({
                "agent_id": self.manager.agent_id(),
                "peer_id": peer_id,
                "idle_secs": idle_secs,
            });
            if let Err(e) = self.manager.bus().emit(bus::PEER_DEGRADED, payload).await {
                warn!(peer_id = %peer_id, error = %e, "failed to publish degradation");
            }
        }

        let report = self.build_report(now, demoted.into_iter().map(|(p, _)| p).collect());
        info!(
            connections = report.total_connections,
            active = report.active,
            degraded = report.degraded,
            demoted = report.demoted.len(),
            "health check complete"
        );

        match serde_json::to_value(&report) {
            Ok(payload) => {
                if let Err(e) = self.manager.bus().emit(bus::PEER_HEALTH, payload).await {
                    warn!(error = %e, "failed to publish health report");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode health report"),
        }

        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    fn build_report(&self, now: DateTime<Utc>, demoted: Vec<String>) -> HealthReport {
        let coordinator = self.manager.coordinator();
        let mut peers: Vec<PeerHealth> = self
            .manager
            .connections()
            .into_iter()
            .map(|conn| PeerHealth {
                idle_secs: (millis_between(conn.last_activity, now).max(0.0) / 1000.0) as u64,
                state: conn.state,
                coherence: conn.coherence,
                strength: coordinator.strength(&conn.peer_id),
                success_rate: self
                    .manager
                    .peer_metrics(&conn.peer_id)
                    .map_or(1.0, |m| m.success_rate()),
                peer_id: conn.peer_id,
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));

        let average_coherence = if peers.is_empty() {
            0.0
        } else {
            peers.iter().map(|p| p.coherence).sum::<f64>() / peers.len() as f64
        };

        HealthReport {
            checked_at: now,
            total_connections: peers.len(),
            active: peers.iter().filter(|p| p.state.is_active()).count(),
            degraded: peers
                .iter()
                .filter(|p| p.state == ConnectionState::Degraded)
                .count(),
            demoted,
            average_coherence,
            peers,
        }
    }

    /// Report from the most recent pass
    pub fn last_report(&self) -> Option<HealthReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
