//! Peer negotiation and direct event delivery.
//!
//! [`PeeringManager`] runs the negotiation protocol (discovery, scoring,
//! negotiation, connection, synchronization), keeps the registry of
//! established connections, and drives the plasticity coordinator from the
//! delivery hot path. Any direct delivery that cannot happen falls back to the
//! global bus.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::{self, EventBus};
use crate::cancel::CancelToken;
use crate::clock::{lookback, millis_between, Clock};
use crate::config::PeeringConfig;
use crate::connection::{
    ConnectionState, NegotiatedCapabilities, PeerConnection, PeeringCapabilities,
    PeeringRequest, PeeringResponse, PeeringResult,
};
use crate::error::{ConfigError, CoordinatorError, NegotiationFailure, TransportError};
use crate::metrics::PeerMetrics;
use crate::negotiation;
use crate::plasticity::{
    rules, CoherenceValidation, LtdContext, LtpContext, PlasticityCoordinator,
};
use crate::transport::{PeerMessage, PeerTransport};

const NOTIFICATION_CAPACITY: usize = 256;

/// A completed delivery always lands at least this long after its
/// pre-synaptic event, so instant channels still count as causal.
const MIN_CAUSAL_GAP: Duration = Duration::from_micros(1);

/// Local lifecycle notifications. The manager is the only publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerNotification {
    Connected {
        peer_id: String,
        latency_ms: f64,
        protocol_version: u32,
    },
    Disconnected {
        peer_id: String,
        reason: String,
        graceful: bool,
    },
    MessageReceived {
        from: String,
        event: String,
        payload: serde_json::Value,
    },
    Rejected {
        peer_id: String,
        reason: String,
    },
    Degraded {
        peer_id: String,
        idle_secs: u64,
    },
}

/// Marks a target as being negotiated for as long as it lives.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashSet<String>>,
    peer_id: String,
}

impl<'a> PendingGuard<'a> {
    fn claim(pending: &'a Mutex<HashSet<String>>, peer_id: &str) -> Option<Self> {
        let inserted = pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.to_string());
        inserted.then(|| Self {
            pending,
            peer_id: peer_id.to_string(),
        })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.peer_id);
    }
}

fn enter_phase(peer_id: &str, phase: &mut ConnectionState, next: ConnectionState) {
    debug_assert!(phase.can_transition_to(next), "{} -> {}", phase, next);
    debug!(peer_id = %peer_id, from = %phase, to = %next, "negotiation phase");
    *phase = next;
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

pub struct PeeringManager {
    agent_id: String,
    capabilities: PeeringCapabilities,
    config: PeeringConfig,
    transport: Arc<dyn PeerTransport>,
    bus: Arc<dyn EventBus>,
    coordinator: Arc<PlasticityCoordinator>,
    clock: Arc<dyn Clock>,
    admission: Arc<Semaphore>,
    connections: RwLock<HashMap<String, PeerConnection>>,
    metrics: Mutex<HashMap<String, PeerMetrics>>,
    pending: Mutex<HashSet<String>>,
    notifications: broadcast::Sender<PeerNotification>,
}

impl PeeringManager {
    /// Validate `config` and build a manager with its own coordinator. The
    /// admission semaphore is shared between the two.
    pub fn new(
        config: PeeringConfig,
        capabilities: PeeringCapabilities,
        transport: Arc<dyn PeerTransport>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let admission = Arc::new(Semaphore::new(config.max_concurrent_operations));
        let coordinator = Arc::new(PlasticityCoordinator::new(
            config.plasticity.clone(),
            admission.clone(),
            clock.clone(),
        ));
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Self {
            agent_id: config.agent_id.clone(),
            capabilities,
            config,
            transport,
            bus,
            coordinator,
            clock,
            admission,
            connections: RwLock::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            notifications,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn capabilities(&self) -> &PeeringCapabilities {
        &self.capabilities
    }

    pub fn config(&self) -> &PeeringConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<PlasticityCoordinator> {
        &self.coordinator
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Free admission slots
    pub fn available_permits(&self) -> usize {
        self.admission.available_permits()
    }

    /// Stop admitting new negotiations and plasticity mutations
    pub fn close_admission(&self) {
        self.admission.close();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerNotification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: PeerNotification) {
        // Nobody listening is fine.
        let _ = self.notifications.send(notification);
    }

    fn read_connections(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PeerConnection>> {
        self.connections.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_connections(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PeerConnection>> {
        self.connections.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, HashMap<String, PeerMetrics>> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn publish(&self, event: &str, payload: serde_json::Value) {
        if let Err(e) = self.bus.emit(event, payload).await {
            warn!(event = %event, error = %e, "failed to publish lifecycle event");
        }
    }

    // ---------------------------------------------------------------
    // Negotiation
    // ---------------------------------------------------------------

    /// Negotiate a direct channel to `target`.
    ///
    /// Holds one admission slot for the whole call. Every failure comes back
    /// as [`PeeringResult::Failed`] and leaves no connection behind.
    pub async fn request_peering(
        &self,
        target: &str,
        request: PeeringRequest,
        cancel: &CancelToken,
    ) -> PeeringResult {
        info!(agent_id = %self.agent_id, peer_id = %target, "requesting peering");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NegotiationFailure::Cancelled),
            outcome = self.initiate(target, &request) => outcome,
        };

        match outcome {
            Ok(connection) => {
                self.announce_established(&connection, request.purpose.as_deref())
                    .await;
                PeeringResult::Established {
                    peer_id: target.to_string(),
                    latency: Duration::from_secs_f64(connection.measured_latency_ms / 1000.0),
                    capabilities: connection.capabilities,
                }
            }
            Err(reason) => {
                warn!(peer_id = %target, reason = %reason, "peering request failed");
                PeeringResult::Failed {
                    peer_id: target.to_string(),
                    reason,
                }
            }
        }
    }

    async fn initiate(
        &self,
        target: &str,
        request: &PeeringRequest,
    ) -> Result<PeerConnection, NegotiationFailure> {
        self.ensure_not_connected(target)?;
        let _pending = PendingGuard::claim(&self.pending, target)
            .ok_or_else(|| NegotiationFailure::NegotiationInProgress(target.to_string()))?;
        // A negotiation may have finished between the first check and the claim.
        self.ensure_not_connected(target)?;
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| NegotiationFailure::AdmissionClosed)?;

        let mut phase = ConnectionState::Disconnected;
        enter_phase(target, &mut phase, ConnectionState::Negotiating);

        let offered = self
            .transport
            .discover(target)
            .await
            .map_err(|e| NegotiationFailure::Discovery(e.to_string()))?;

        let score = negotiation::score_compatibility(&request.capabilities, &offered);
        let total = score.total();
        debug!(
            peer_id = %target,
            consciousness = score.consciousness,
            latency = score.latency,
            throughput = score.throughput,
            pathways = score.pathways,
            total,
            "compatibility scored"
        );
        if total < self.config.compatibility_threshold {
            return Err(NegotiationFailure::Incompatible {
                score: total,
                threshold: self.config.compatibility_threshold,
            });
        }

        let negotiated = negotiation::negotiate(&request.capabilities, &offered, total)?;
        self.connect_and_register(target, negotiated, &mut phase).await
    }

    /// Acceptor side of a negotiation. A rejected response only publishes the
    /// rejection.
    pub async fn accept_peering(
        &self,
        initiator: &str,
        response: PeeringResponse,
        cancel: &CancelToken,
    ) -> bool {
        if !response.accepted {
            let reason = response
                .reason
                .unwrap_or_else(|| "rejected by acceptor".to_string());
            info!(peer_id = %initiator, reason = %reason, "peering rejected");
            self.publish(
                bus::PEER_REJECTED,
                json!({
                    "agent_id": self.agent_id,
                    "peer_id": initiator,
                    "reason": reason,
                }),
            )
            .await;
            self.notify(PeerNotification::Rejected {
                peer_id: initiator.to_string(),
                reason,
            });
            return false;
        }

        if self.is_connected(initiator) {
            debug!(peer_id = %initiator, "accept for an already connected peer");
            return true;
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NegotiationFailure::Cancelled),
            outcome = self.accept(initiator, &response.capabilities) => outcome,
        };

        match outcome {
            Ok(connection) => {
                self.announce_established(&connection, None).await;
                true
            }
            Err(NegotiationFailure::AlreadyConnected(_)) => {
                debug!(peer_id = %initiator, "peer connected while accepting");
                true
            }
            Err(reason) => {
                warn!(peer_id = %initiator, reason = %reason, "accepting peering failed");
                false
            }
        }
    }

    async fn accept(
        &self,
        initiator: &str,
        requested: &PeeringCapabilities,
    ) -> Result<PeerConnection, NegotiationFailure> {
        let _pending = PendingGuard::claim(&self.pending, initiator)
            .ok_or_else(|| NegotiationFailure::NegotiationInProgress(initiator.to_string()))?;
        self.ensure_not_connected(initiator)?;
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| NegotiationFailure::AdmissionClosed)?;

        let mut phase = ConnectionState::Disconnected;
        enter_phase(initiator, &mut phase, ConnectionState::Negotiating);
        let score = negotiation::score_compatibility(requested, &self.capabilities).total();
        let negotiated = negotiation::negotiate(requested, &self.capabilities, score)?;
        self.connect_and_register(initiator, negotiated, &mut phase).await
    }

    /// Connection and synchronization phases, then registration.
    async fn connect_and_register(
        &self,
        peer_id: &str,
        negotiated: NegotiatedCapabilities,
        phase: &mut ConnectionState,
    ) -> Result<PeerConnection, NegotiationFailure> {
        enter_phase(peer_id, phase, ConnectionState::Connecting);
        let rtt = self
            .open_channel(peer_id, negotiated.capabilities.max_latency_ms)
            .await?;
        enter_phase(peer_id, phase, ConnectionState::Connected);

        enter_phase(peer_id, phase, ConnectionState::Synchronizing);
        self.synchronize(peer_id).await?;
        enter_phase(peer_id, phase, ConnectionState::Active);

        self.register(peer_id, negotiated, rtt)
    }

    /// Connect with the configured timeout and enforce the latency bound.
    async fn open_channel(
        &self,
        peer_id: &str,
        max_latency_ms: f64,
    ) -> Result<Duration, NegotiationFailure> {
        let timeout = self.config.connection_timeout();
        let rtt = tokio::time::timeout(timeout, self.transport.connect(&self.agent_id, peer_id))
            .await
            .map_err(|_| {
                NegotiationFailure::Connection(
                    TransportError::Timeout(self.config.connection_timeout_ms).to_string(),
                )
            })?
            .map_err(|e| NegotiationFailure::Connection(e.to_string()))?;

        let rtt_ms = duration_ms(rtt);
        if rtt_ms > max_latency_ms {
            return Err(NegotiationFailure::Connection(format!(
                "round-trip latency {:.2} ms exceeds negotiated bound {:.2} ms",
                rtt_ms, max_latency_ms
            )));
        }
        Ok(rtt)
    }

    async fn synchronize(&self, peer_id: &str) -> Result<(), NegotiationFailure> {
        tokio::time::timeout(
            self.config.connection_timeout(),
            self.transport.synchronize(&self.agent_id, peer_id),
        )
        .await
        .map_err(|_| {
            NegotiationFailure::Synchronization(
                TransportError::Timeout(self.config.connection_timeout_ms).to_string(),
            )
        })?
        .map_err(|e| NegotiationFailure::Synchronization(e.to_string()))
    }

    /// Insert the connection and its plasticity state. Synchronous so the two
    /// always appear together.
    fn register(
        &self,
        peer_id: &str,
        negotiated: NegotiatedCapabilities,
        rtt: Duration,
    ) -> Result<PeerConnection, NegotiationFailure> {
        let connection =
            PeerConnection::new(peer_id, &self.agent_id, negotiated, rtt, self.clock.now());
        self.coordinator
            .register(peer_id, &self.config.plasticity, connection.coherence)
            .map_err(|e| NegotiationFailure::Configuration(e.to_string()))?;
        self.write_connections()
            .insert(peer_id.to_string(), connection.clone());
        self.lock_metrics().entry(peer_id.to_string()).or_default();
        Ok(connection)
    }

    async fn announce_established(&self, connection: &PeerConnection, purpose: Option<&str>) {
        info!(
            peer_id = %connection.peer_id,
            latency_ms = connection.measured_latency_ms,
            protocol_version = connection.capabilities.protocol_version,
            score = connection.capabilities.compatibility_score,
            "peer connection established"
        );
        self.notify(PeerNotification::Connected {
            peer_id: connection.peer_id.clone(),
            latency_ms: connection.measured_latency_ms,
            protocol_version: connection.capabilities.protocol_version,
        });
        self.publish(
            bus::PEER_ESTABLISHED,
            json!({
                "agent_id": self.agent_id,
                "peer_id": connection.peer_id,
                "connection_id": connection.connection_id,
                "latency_ms": connection.measured_latency_ms,
                "protocol_version": connection.capabilities.protocol_version,
                "compatibility_score": connection.capabilities.compatibility_score,
                "purpose": purpose,
            }),
        )
        .await;
    }

    fn ensure_not_connected(&self, peer_id: &str) -> Result<(), NegotiationFailure> {
        if self.is_connected(peer_id) {
            return Err(NegotiationFailure::AlreadyConnected(peer_id.to_string()));
        }
        Ok(())
    }

    fn is_connected(&self, peer_id: &str) -> bool {
        self.read_connections().get(peer_id).map_or(false, |c| {
            !matches!(c.state, ConnectionState::Disconnected | ConnectionState::Failed)
        })
    }

    // ---------------------------------------------------------------
    // Hot path
    // ---------------------------------------------------------------

    /// Deliver `event` to `peer_id`, directly when an Active connection exists
    /// and through the global bus otherwise. Never fails; problems show up in
    /// the peer's metrics and plasticity history.
    pub async fn emit_to_peer(
        &self,
        peer_id: &str,
        event: &str,
        payload: serde_json::Value,
        cancel: &CancelToken,
    ) {
        let connection = self
            .read_connections()
            .get(peer_id)
            .filter(|c| c.state.is_active())
            .cloned();

        let direct = match connection {
            Some(connection) => self.deliver_direct(&connection, event, &payload, cancel).await,
            None => Err(TransportError::Unreachable(peer_id.to_string())),
        };

        if let Err(e) = direct {
            self.fall_back(peer_id, event, payload, &e, cancel).await;
        }
    }

    async fn deliver_direct(
        &self,
        connection: &PeerConnection,
        event: &str,
        payload: &serde_json::Value,
        cancel: &CancelToken,
    ) -> Result<(), TransportError> {
        let peer_id = connection.peer_id.as_str();
        let options = &self.config.plasticity;
        let negotiated = &connection.capabilities.capabilities;
        let coherence = self
            .coordinator
            .coherence(peer_id)
            .unwrap_or(connection.coherence);
        let pre_at = self.clock.now();

        self.coordinator
            .record_pre_synaptic(peer_id, pre_at, coherence, cancel)
            .await
            .or_else(|e| tolerate(peer_id, "pre-synaptic record", e))?;

        if coherence >= options.coherence_threshold {
            let (usage, avg_latency) = {
                let metrics = self.lock_metrics();
                metrics
                    .get(peer_id)
                    .map_or((1.0, 0.0), |m| (m.success_rate(), m.avg_latency_ms))
            };
            let ctx = LtpContext {
                usage_frequency: usage,
                coherence,
                timing_precision: rules::delivery_quality(avg_latency, negotiated.max_latency_ms),
                sustained_duration_ms: millis_between(connection.established_at, pre_at).max(0.0),
                timing_ms: options.ltp_optimal_timing_ms(),
            };
            self.coordinator
                .apply_ltp(peer_id, ctx, cancel)
                .await
                .map(|_| ())
                .or_else(|e| tolerate(peer_id, "LTP", e))?;
        }

        let started = Instant::now();
        let delivery = tokio::time::timeout(
            self.config.connection_timeout(),
            self.transport.deliver(&self.agent_id, peer_id, event, payload),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = delivery => match result {
                Ok(inner) => inner?,
                Err(_) => return Err(TransportError::Timeout(self.config.connection_timeout_ms)),
            },
        }
        let latency = started.elapsed();
        let latency_ms = duration_ms(latency);
        let post_at = pre_at
            + chrono::Duration::from_std(latency.max(MIN_CAUSAL_GAP))
                .unwrap_or_else(|_| chrono::Duration::microseconds(1));

        let quality = rules::delivery_quality(latency_ms, negotiated.max_latency_ms);
        match self
            .coordinator
            .record_post_synaptic(peer_id, post_at, quality, cancel)
            .await
        {
            Ok(Some(outcome)) => debug!(
                peer_id = %peer_id,
                causal = outcome.causal,
                gap_ms = outcome.gap_ms,
                "causality evaluated"
            ),
            Ok(None) => {}
            Err(e) => debug!(peer_id = %peer_id, error = %e, "post-synaptic record skipped"),
        }

        {
            let mut metrics = self.lock_metrics();
            let entry = metrics.entry(peer_id.to_string()).or_default();
            entry.record_delivery(latency_ms, post_at);
            if let Some(strength) = self.coordinator.strength(peer_id) {
                entry.set_custom("synaptic_strength", strength);
            }
        }
        let coherence = self.coordinator.coherence(peer_id);
        if let Some(conn) = self.write_connections().get_mut(peer_id) {
            conn.last_activity = self.clock.now();
            if let Some(coherence) = coherence {
                conn.set_coherence(coherence);
            }
        }
        debug!(peer_id = %peer_id, event = %event, latency_ms, "direct delivery");
        Ok(())
    }

    async fn fall_back(
        &self,
        peer_id: &str,
        event: &str,
        payload: serde_json::Value,
        cause: &TransportError,
        cancel: &CancelToken,
    ) {
        warn!(peer_id = %peer_id, event = %event, error = %cause, "direct delivery unavailable, falling back to bus");

        let error_rate = {
            let mut metrics = self.lock_metrics();
            let entry = metrics.entry(peer_id.to_string()).or_default();
            entry.record_failure();
            entry.error_rate()
        };

        if cancel.is_cancelled() {
            debug!(peer_id = %peer_id, "cancelled, skipping depression");
        } else {
            let ctx = self.failure_context(peer_id, error_rate);
            if let Err(e) = self.coordinator.apply_ltd(peer_id, ctx, cancel).await {
                warn!(peer_id = %peer_id, error = %e, "failed to apply LTD");
            }
        }

        let envelope = json!({
            "source_agent": self.agent_id,
            "target_peer": peer_id,
            "payload": payload,
        });
        if let Err(e) = self.bus.emit(event, envelope).await {
            error!(peer_id = %peer_id, event = %event, error = %e, "fallback emission failed");
        }
    }

    fn failure_context(&self, peer_id: &str, error_rate: f64) -> LtdContext {
        let now = self.clock.now();
        let connection = self.read_connections().get(peer_id).cloned();
        let avg_latency = self
            .lock_metrics()
            .get(peer_id)
            .map_or(0.0, |m| m.avg_latency_ms);
        let coherence = self
            .coordinator
            .coherence(peer_id)
            .unwrap_or(self.config.plasticity.initial_coherence);

        let inactivity = match &connection {
            Some(c) => {
                let idle_ms = millis_between(c.last_activity, now).max(0.0);
                idle_ms / (self.config.inactivity_threshold_secs as f64 * 1000.0)
            }
            None => 1.0,
        };
        let span = (self.config.max_latency_ms - self.config.target_latency_ms).max(f64::EPSILON);
        let latency_degradation = (avg_latency - self.config.target_latency_ms) / span;

        LtdContext {
            inactivity,
            error_rate,
            latency_degradation,
            coherence_loss: 1.0 - coherence,
            timing_ms: self.config.plasticity.ltd_optimal_timing_ms(),
        }
    }

    // ---------------------------------------------------------------
    // Bookkeeping
    // ---------------------------------------------------------------

    /// Peers with an Active connection
    pub fn active_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .read_connections()
            .values()
            .filter(|c| c.state.is_active())
            .map(|c| c.peer_id.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn connection(&self, peer_id: &str) -> Option<PeerConnection> {
        self.read_connections().get(peer_id).cloned()
    }

    /// Snapshot of every registered connection
    pub fn connections(&self) -> Vec<PeerConnection> {
        self.read_connections().values().cloned().collect()
    }

    pub fn peer_metrics(&self, peer_id: &str) -> Option<PeerMetrics> {
        self.lock_metrics().get(peer_id).cloned()
    }

    /// Remove the connection to `peer_id`. Plasticity history is kept for
    /// reporting. Returns whether a connection existed.
    pub async fn disconnect_peer(&self, peer_id: &str, reason: &str) -> bool {
        self.teardown(peer_id, reason, true).await
    }

    async fn teardown(&self, peer_id: &str, reason: &str, graceful: bool) -> bool {
        let removed = self.write_connections().remove(peer_id);
        let Some(mut connection) = removed else {
            debug!(peer_id = %peer_id, "disconnect for unknown peer");
            return false;
        };
        connection.transition(ConnectionState::Disconnected);
        info!(peer_id = %peer_id, reason = %reason, graceful, "peer disconnected");

        self.notify(PeerNotification::Disconnected {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
            graceful,
        });
        self.publish(
            bus::PEER_DISCONNECTED,
            json!({
                "agent_id": self.agent_id,
                "peer_id": peer_id,
                "connection_id": connection.connection_id,
                "reason": reason,
                "graceful": graceful,
            }),
        )
        .await;
        true
    }

    /// Re-run connection and synchronization for an existing connection.
    /// Success leaves it Active; failure marks it Failed and tears it down.
    /// Cancellation restores the previous state.
    pub async fn reconnect_peer(&self, peer_id: &str, cancel: &CancelToken) -> PeeringResult {
        let (previous_state, max_latency_ms) = {
            let mut connections = self.write_connections();
            match connections.get_mut(peer_id) {
                Some(conn) => {
                    let previous = conn.state;
                    if !conn.transition(ConnectionState::Reconnecting) {
                        return PeeringResult::Failed {
                            peer_id: peer_id.to_string(),
                            reason: NegotiationFailure::Connection(format!(
                                "cannot reconnect from state {}",
                                previous
                            )),
                        };
                    }
                    (previous, conn.capabilities.capabilities.max_latency_ms)
                }
                None => {
                    return PeeringResult::Failed {
                        peer_id: peer_id.to_string(),
                        reason: NegotiationFailure::Connection(format!(
                            "no connection to {}",
                            peer_id
                        )),
                    }
                }
            }
        };
        info!(peer_id = %peer_id, from = %previous_state, "reconnecting");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NegotiationFailure::Cancelled),
            outcome = self.reestablish(peer_id, max_latency_ms) => outcome,
        };

        match outcome {
            Ok(rtt) => {
                let connection = {
                    let mut connections = self.write_connections();
                    let Some(conn) = connections.get_mut(peer_id) else {
                        return PeeringResult::Failed {
                            peer_id: peer_id.to_string(),
                            reason: NegotiationFailure::Connection(
                                "connection removed during reconnect".to_string(),
                            ),
                        };
                    };
                    conn.transition(ConnectionState::Active);
                    conn.measured_latency_ms = duration_ms(rtt);
                    conn.last_activity = self.clock.now();
                    conn.clone()
                };
                self.announce_established(&connection, Some("reconnect")).await;
                PeeringResult::Established {
                    peer_id: peer_id.to_string(),
                    latency: rtt,
                    capabilities: connection.capabilities,
                }
            }
            Err(NegotiationFailure::Cancelled) => {
                if let Some(conn) = self.write_connections().get_mut(peer_id) {
                    conn.state = previous_state;
                }
                PeeringResult::Failed {
                    peer_id: peer_id.to_string(),
                    reason: NegotiationFailure::Cancelled,
                }
            }
            Err(reason) => {
                warn!(peer_id = %peer_id, reason = %reason, "reconnect failed");
                if let Some(conn) = self.write_connections().get_mut(peer_id) {
                    conn.transition(ConnectionState::Failed);
                }
                self.teardown(peer_id, &reason.to_string(), false).await;
                PeeringResult::Failed {
                    peer_id: peer_id.to_string(),
                    reason,
                }
            }
        }
    }

    async fn reestablish(
        &self,
        peer_id: &str,
        max_latency_ms: f64,
    ) -> Result<Duration, NegotiationFailure> {
        let _permit = self
            .admission
            .acquire()
            .await
            .map_err(|_| NegotiationFailure::AdmissionClosed)?;
        let rtt = self.open_channel(peer_id, max_latency_ms).await?;
        self.synchronize(peer_id).await?;
        Ok(rtt)
    }

    /// Account for a message that arrived over a direct channel. Activity
    /// revives a Degraded connection.
    pub fn handle_inbound(&self, message: PeerMessage) {
        let now = self.clock.now();
        if let Some(conn) = self.write_connections().get_mut(&message.from) {
            conn.last_activity = now;
            if conn.state == ConnectionState::Degraded && conn.transition(ConnectionState::Active) {
                info!(peer_id = %message.from, "connection recovered by inbound activity");
            }
        } else {
            debug!(from = %message.from, "inbound message from unregistered peer");
        }
        self.notify(PeerNotification::MessageReceived {
            from: message.from,
            event: message.event,
            payload: message.payload,
        });
    }

    /// Move an Active connection to Degraded. Returns whether it moved.
    pub(crate) fn demote(&self, peer_id: &str, idle_secs: u64) -> bool {
        let demoted = self
            .write_connections()
            .get_mut(peer_id)
            .map_or(false, |c| {
                c.state == ConnectionState::Active && c.transition(ConnectionState::Degraded)
            });
        if demoted {
            warn!(peer_id = %peer_id, idle_secs, "connection degraded by inactivity");
            self.notify(PeerNotification::Degraded {
                peer_id: peer_id.to_string(),
                idle_secs,
            });
        }
        demoted
    }

    /// Forget plasticity state and metrics of peers that have no connection
    /// and have been quiet for longer than the coherence window. Returns the
    /// peers dropped.
    pub fn prune_detached(&self) -> Vec<String> {
        let cutoff = lookback(
            self.clock.now(),
            self.config.plasticity.coherence_window_secs,
        );
        let connected: HashSet<String> = self.read_connections().keys().cloned().collect();
        let dropped = self
            .coordinator
            .prune(cutoff, |peer_id| connected.contains(peer_id));
        self.lock_metrics().retain(|peer_id, _| {
            connected.contains(peer_id) || self.coordinator.is_tracked(peer_id)
        });
        if !dropped.is_empty() {
            info!(peers = dropped.len(), "forgot detached peers");
        }
        dropped
    }

    /// Copy validated coherence values onto the matching connections.
    pub fn mirror_coherence(&self, validation: &CoherenceValidation) {
        let mut connections = self.write_connections();
        for (peer_id, coherence) in &validation.peer_coherence {
            if let Some(conn) = connections.get_mut(peer_id) {
                conn.set_coherence(*coherence);
            }
        }
    }
}

/// Plasticity bookkeeping must not block delivery, except for cancellation.
fn tolerate(peer_id: &str, step: &str, error: CoordinatorError) -> Result<(), TransportError> {
    match error {
        CoordinatorError::Cancelled => Err(TransportError::Cancelled),
        other => {
            debug!(peer_id = %peer_id, step = %step, error = %other, "plasticity step skipped");
            Ok(())
        }
    }
}
