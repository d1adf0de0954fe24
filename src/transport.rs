//! Direct peer transport.
//!
//! The manager only talks to peers through [`PeerTransport`]. The crate ships
//! [`LoopbackTransport`], an in-process directory of agents with simulated
//! latency; a networked deployment supplies its own implementation.

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::PeeringCapabilities;
use crate::error::TransportError;

/// Event delivered directly between two peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerMessage {
    pub from: String,
    pub to: String,
    pub event: String,
    pub payload: serde_json::Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Fetch the capabilities a target offers
    async fn discover(&self, target: &str) -> Result<PeeringCapabilities, TransportError>;

    /// Open a channel and return the measured round-trip latency
    async fn connect(&self, from: &str, to: &str) -> Result<Duration, TransportError>;

    /// Initialise synchronization state on both ends
    async fn synchronize(&self, from: &str, to: &str) -> Result<(), TransportError>;

    /// Deliver one event over the direct channel
    async fn deliver(
        &self,
        from: &str,
        to: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError>;
}

struct Endpoint {
    capabilities: PeeringCapabilities,
    mailbox: mpsc::Sender<PeerMessage>,
    reachable: bool,
}

/// In-process transport connecting agents registered in the same directory.
#[derive(Clone)]
pub struct LoopbackTransport {
    endpoints: Arc<RwLock<HashMap<String, Endpoint>>>,
    latency: Duration,
    jitter_ms: u64,
}

impl LoopbackTransport {
    pub fn new(latency: Duration) -> Self {
        Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            latency,
            jitter_ms: 0,
        }
    }

    /// Add up to `jitter_ms` of random delay to every hop
    pub fn with_jitter(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Register an agent and return its mailbox
    pub fn register(
        &self,
        agent_id: impl Into<String>,
        capabilities: PeeringCapabilities,
        mailbox_capacity: usize,
    ) -> mpsc::Receiver<PeerMessage> {
        let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
        let agent_id = agent_id.into();
        debug!(agent_id = %agent_id, "registering loopback endpoint");
        self.write().insert(
            agent_id,
            Endpoint {
                capabilities,
                mailbox: tx,
                reachable: true,
            },
        );
        rx
    }

    pub fn unregister(&self, agent_id: &str) {
        self.write().remove(agent_id);
    }

    /// Simulate a partition or recovery of one agent
    pub fn set_reachable(&self, agent_id: &str, reachable: bool) {
        if let Some(endpoint) = self.write().get_mut(agent_id) {
            endpoint.reachable = reachable;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Endpoint>> {
        self.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_reachable(&self, agent_id: &str) -> Result<(), TransportError> {
        match self.read().get(agent_id) {
            Some(endpoint) if endpoint.reachable => Ok(()),
            _ => Err(TransportError::Unreachable(agent_id.to_string())),
        }
    }

    async fn hop(&self) {
        let mut delay = self.latency;
        if self.jitter_ms > 0 {
            let jitter = rand::thread_rng().gen_range(0..=self.jitter_ms);
            delay += Duration::from_millis(jitter);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new(Duration::from_millis(2))
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn discover(&self, target: &str) -> Result<PeeringCapabilities, TransportError> {
        self.hop().await;
        match self.read().get(target) {
            Some(endpoint) if endpoint.reachable => Ok(endpoint.capabilities.clone()),
            _ => Err(TransportError::Unreachable(target.to_string())),
        }
    }

    async fn connect(&self, from: &str, to: &str) -> Result<Duration, TransportError> {
        self.ensure_reachable(from)?;
        self.ensure_reachable(to)?;
        let started = Instant::now();
        self.hop().await;
        self.hop().await;
        Ok(started.elapsed())
    }

    async fn synchronize(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.ensure_reachable(from)?;
        self.ensure_reachable(to)?;
        self.hop().await;
        Ok(())
    }

    async fn deliver(
        &self,
        from: &str,
        to: &str,
        event: &str,
        payload: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.hop().await;
        let mailbox = match self.read().get(to) {
            Some(endpoint) if endpoint.reachable => endpoint.mailbox.clone(),
            _ => return Err(TransportError::Unreachable(to.to_string())),
        };
        let message = PeerMessage {
            from: from.to_string(),
            to: to.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        };
        mailbox.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TransportError::Delivery(format!("mailbox of {} is full", to))
            }
            mpsc::error::TrySendError::Closed(_) => TransportError::Unreachable(to.to_string()),
        })
    }
}
