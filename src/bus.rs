//! Global publish/subscribe bus.
//!
//! The bus is both the fallback transport for direct peer events and the
//! channel on which lifecycle notifications are broadcast.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::BusError;

pub const PEER_ESTABLISHED: &str = "peer.established";
pub const PEER_REJECTED: &str = "peer.rejected";
pub const PEER_DISCONNECTED: &str = "peer.disconnected";
pub const PEER_DEGRADED: &str = "peer.degraded";
pub const PEER_HEALTH: &str = "peer.health";

/// Envelope carried on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub event: String,
    pub source: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), BusError>;

    async fn subscribe(&self, event: &str) -> Result<broadcast::Receiver<BusEvent>, BusError>;
}

/// Process-local bus. Keeps a log of every emission for inspection.
pub struct InMemoryBus {
    source: String,
    channels: Mutex<HashMap<String, broadcast::Sender<BusEvent>>>,
    log: Mutex<Vec<BusEvent>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            channels: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            capacity: 256,
        }
    }

    fn sender(&self, event: &str) -> broadcast::Sender<BusEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(event.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Every event emitted so far
    pub fn emitted(&self) -> Vec<BusEvent> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of emissions of one event name
    pub fn emitted_count(&self, event: &str) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event == event)
            .count()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let envelope = BusEvent {
            event: event.to_string(),
            source: self.source.clone(),
            payload,
            timestamp: Utc::now(),
        };
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());
        // No subscribers is not an error for a fire-and-forget bus.
        let _ = self.sender(event).send(envelope);
        Ok(())
    }

    async fn subscribe(&self, event: &str) -> Result<broadcast::Receiver<BusEvent>, BusError> {
        Ok(self.sender(event).subscribe())
    }
}
