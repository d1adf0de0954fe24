use async_trait::async_trait;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::config::MqttConfig;
use crate::error::BusError;

const TOPIC_PREFIX: &str = "synapse/events/";

/// Global event bus backed by an MQTT broker
pub struct MqttBus {
    client: AsyncClient,
    agent_id: String,
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<BusEvent>>>>,
}

impl MqttBus {
    /// Create a new MQTT bus. The returned event loop must be driven with
    /// [`MqttBus::pump`] for subscriptions to receive anything.
    pub fn new(config: &MqttConfig, agent_id: String) -> (Self, EventLoop) {
        let mut mqttoptions =
            MqttOptions::new(format!("synapse-{}", agent_id), &config.broker, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        (
            Self {
                client,
                agent_id,
                channels: Arc::new(Mutex::new(HashMap::new())),
            },
            eventloop,
        )
    }

    /// Drive the MQTT event loop and fan incoming events out to local subscribers.
    pub async fn pump(self: Arc<Self>, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match parse_event(&publish.payload) {
                        Ok(event) => self.dispatch(event),
                        Err(e) => {
                            warn!(topic = %publish.topic, error = %e, "failed to parse bus event")
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                }
                Err(e) => {
                    error!(error = %e, "MQTT error, reconnecting...");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                _ => {}
            }
        }
    }

    fn dispatch(&self, event: BusEvent) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = channels.get(&event.event) {
            debug!(event = %event.event, source = %event.source, "bus event received");
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl EventBus for MqttBus {
    async fn emit(&self, event: &str, payload: serde_json::Value) -> Result<(), BusError> {
        let envelope = BusEvent {
            event: event.to_string(),
            source: self.agent_id.clone(),
            payload,
            timestamp: Utc::now(),
        };
        let bytes = serde_json::to_vec(&envelope)?;
        self.client
            .publish(event_topic(event), QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| BusError::Publish {
                event: event.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, event: &str) -> Result<broadcast::Receiver<BusEvent>, BusError> {
        let rx = {
            let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            channels
                .entry(event.to_string())
                .or_insert_with(|| broadcast::channel(256).0)
                .subscribe()
        };
        self.client
            .subscribe(event_topic(event), QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Subscribe {
                event: event.to_string(),
                reason: e.to_string(),
            })?;
        info!(agent_id = %self.agent_id, event = %event, "subscribed to bus event");
        Ok(rx)
    }
}

/// MQTT topic carrying one bus event name
pub fn event_topic(event: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, event)
}

/// Parse an incoming MQTT payload as a bus event
pub fn parse_event(payload: &[u8]) -> Result<BusEvent, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig {
            broker: "localhost".to_string(),
            port: 1883,
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_event_topic_format() {
        assert_eq!(event_topic("peer.established"), "synapse/events/peer.established");
        assert_eq!(event_topic("thought"), "synapse/events/thought");
    }

    #[test]
    fn test_parse_event_valid() {
        let json = r#"{
            "event": "peer.established",
            "source": "agent-a",
            "payload": {"peer_id": "agent-b", "latency_ms": 4.0},
            "timestamp": "2024-01-01T00:00:00Z"
        }"#;

        let event = parse_event(json.as_bytes()).unwrap();
        assert_eq!(event.event, "peer.established");
        assert_eq!(event.source, "agent-a");
        assert_eq!(event.payload["peer_id"], "agent-b");
    }

    #[test]
    fn test_parse_event_invalid_json() {
        assert!(parse_event(b"not valid json {[}").is_err());
    }

    #[test]
    fn test_parse_event_missing_field() {
        let json = r#"{"event": "x", "payload": {}, "timestamp": "2024-01-01T00:00:00Z"}"#;
        assert!(parse_event(json.as_bytes()).is_err());
    }

    #[tokio::test]
    async fn test_mqtt_bus_new() {
        let (bus, _eventloop) = MqttBus::new(&config(), "agent-a".to_string());
        assert_eq!(bus.agent_id, "agent-a");
    }

    #[tokio::test]
    async fn test_dispatch_reaches_local_subscriber() {
        let (bus, _eventloop) = MqttBus::new(&config(), "agent-a".to_string());
        let mut rx = {
            let mut channels = bus.channels.lock().unwrap();
            channels
                .entry("thought".to_string())
                .or_insert_with(|| broadcast::channel(4).0)
                .subscribe()
        };

        bus.dispatch(BusEvent {
            event: "thought".to_string(),
            source: "agent-b".to_string(),
            payload: serde_json::json!({"n": 7}),
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "agent-b");
        assert_eq!(event.payload["n"], 7);
    }

    #[tokio::test]
    async fn test_dispatch_without_subscriber_is_dropped() {
        let (bus, _eventloop) = MqttBus::new(&config(), "agent-a".to_string());
        bus.dispatch(BusEvent {
            event: "unheard".to_string(),
            source: "agent-b".to_string(),
            payload: serde_json::json!(null),
            timestamp: Utc::now(),
        });
        assert!(bus.channels.lock().unwrap().is_empty());
    }
}
