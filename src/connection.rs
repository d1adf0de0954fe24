use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use crate::error::NegotiationFailure;

/// Lifecycle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Negotiating,
    Connecting,
    Connected,
    Synchronizing,
    Active,
    Degraded,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether the state machine allows moving from `self` to `next`.
    /// Any state may return to `Disconnected`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if next == Disconnected {
            return true;
        }
        matches!(
            (self, next),
            (Disconnected, Negotiating)
                | (Negotiating, Connecting)
                | (Connecting, Connected)
                | (Connected, Synchronizing)
                | (Synchronizing, Active)
                | (Active, Degraded)
                | (Active, Reconnecting)
                | (Active, Failed)
                | (Degraded, Active)
                | (Degraded, Reconnecting)
                | (Degraded, Failed)
                | (Reconnecting, Connecting)
                | (Reconnecting, Active)
                | (Reconnecting, Failed)
        )
    }

    /// Direct delivery is only attempted on Active connections.
    pub fn is_active(self) -> bool {
        self == ConnectionState::Active
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Negotiating => "negotiating",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Synchronizing => "synchronizing",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Negotiable attributes of a peer channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeeringCapabilities {
    /// Quality proxy in [0, 1]
    pub consciousness_level: f64,
    pub max_latency_ms: f64,
    /// Messages per second
    pub min_throughput: f64,
    /// Pathway tags such as "cognitive" or "memory"
    #[serde(default)]
    pub pathways: BTreeSet<String>,
    #[serde(default)]
    pub protocol_versions: BTreeSet<u32>,
}

impl Default for PeeringCapabilities {
    fn default() -> Self {
        Self {
            consciousness_level: 0.9,
            max_latency_ms: 50.0,
            min_throughput: 100.0,
            pathways: ["cognitive", "memory"].iter().map(|s| s.to_string()).collect(),
            protocol_versions: [1].into_iter().collect(),
        }
    }
}

impl PeeringCapabilities {
    pub fn with_consciousness_level(mut self, level: f64) -> Self {
        self.consciousness_level = level;
        self
    }

    pub fn with_max_latency_ms(mut self, ms: f64) -> Self {
        self.max_latency_ms = ms;
        self
    }

    pub fn with_min_throughput(mut self, throughput: f64) -> Self {
        self.min_throughput = throughput;
        self
    }

    pub fn with_pathways<I, S>(mut self, pathways: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pathways = pathways.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_protocol_versions<I: IntoIterator<Item = u32>>(mut self, versions: I) -> Self {
        self.protocol_versions = versions.into_iter().collect();
        self
    }
}

/// Capabilities fixed at negotiation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiatedCapabilities {
    pub capabilities: PeeringCapabilities,
    pub protocol_version: u32,
    pub compatibility_score: f64,
}

/// One established peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConnection {
    pub connection_id: Uuid,
    pub peer_id: String,
    pub agent_id: String,
    pub capabilities: NegotiatedCapabilities,
    pub state: ConnectionState,
    pub established_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// In [0, 1]
    pub coherence: f64,
    pub measured_latency_ms: f64,
}

impl PeerConnection {
    pub fn new(
        peer_id: impl Into<String>,
        agent_id: impl Into<String>,
        capabilities: NegotiatedCapabilities,
        measured_latency: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let coherence = capabilities.capabilities.consciousness_level.clamp(0.0, 1.0);
        Self {
            connection_id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            agent_id: agent_id.into(),
            capabilities,
            state: ConnectionState::Active,
            established_at: now,
            last_activity: now,
            coherence,
            measured_latency_ms: measured_latency.as_secs_f64() * 1000.0,
        }
    }

    /// Move to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if self.state.can_transition_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    pub fn set_coherence(&mut self, coherence: f64) {
        self.coherence = coherence.clamp(0.0, 1.0);
    }
}

/// Initiator's peering request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringRequest {
    pub capabilities: PeeringCapabilities,
    /// Free-form reason, carried into notifications
    #[serde(default)]
    pub purpose: Option<String>,
}

impl PeeringRequest {
    pub fn new(capabilities: PeeringCapabilities) -> Self {
        Self {
            capabilities,
            purpose: None,
        }
    }
}

/// Acceptor-side answer to a peering request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringResponse {
    pub accepted: bool,
    /// Capabilities the initiator asked for
    pub capabilities: PeeringCapabilities,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PeeringResponse {
    pub fn accept(capabilities: PeeringCapabilities) -> Self {
        Self {
            accepted: true,
            capabilities,
            reason: None,
        }
    }

    pub fn reject(capabilities: PeeringCapabilities, reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            capabilities,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of a peering request
#[derive(Debug, Clone, PartialEq)]
pub enum PeeringResult {
    Established {
        peer_id: String,
        latency: Duration,
        capabilities: NegotiatedCapabilities,
    },
    Failed {
        peer_id: String,
        reason: NegotiationFailure,
    },
}

impl PeeringResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Established { .. })
    }

    /// Human-readable failure reason, if any
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Established { .. } => None,
            Self::Failed { reason, .. } => Some(reason.to_string()),
        }
    }

    pub fn failure(&self) -> Option<&NegotiationFailure> {
        match self {
            Self::Established { .. } => None,
            Self::Failed { reason, .. } => Some(reason),
        }
    }
}
