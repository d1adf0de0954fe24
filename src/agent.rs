use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::config::PeeringConfig;
use crate::connection::PeeringCapabilities;
use crate::error::ConfigError;
use crate::manager::PeeringManager;
use crate::monitor::HealthMonitor;
use crate::scheduler::BackgroundTasks;
use crate::transport::{PeerMessage, PeerTransport};

/// One agent's peering runtime: manager, health monitor and background
/// timers.
pub struct PeeringNode {
    manager: Arc<PeeringManager>,
    monitor: Arc<HealthMonitor>,
    background: Option<BackgroundTasks>,
    shutdown: CancelToken,
}

impl PeeringNode {
    /// Create a node. Invalid configuration fails here, before anything runs.
    pub fn new(
        config: PeeringConfig,
        capabilities: PeeringCapabilities,
        transport: Arc<dyn PeerTransport>,
        bus: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let manager = Arc::new(PeeringManager::new(
            config,
            capabilities,
            transport,
            bus,
            clock,
        )?);
        let monitor = Arc::new(HealthMonitor::new(manager.clone()));
        info!(agent_id = %manager.agent_id(), "peering node created");

        Ok(Self {
            manager,
            monitor,
            background: None,
            shutdown: CancelToken::new(),
        })
    }

    pub fn manager(&self) -> &Arc<PeeringManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Start the background timers. Idempotent.
    pub fn start(&mut self) {
        if self.background.is_some() {
            return;
        }
        self.background = Some(BackgroundTasks::start(
            self.manager.clone(),
            self.monitor.clone(),
        ));
        info!(agent_id = %self.manager.agent_id(), "peering node started");
    }

    pub fn is_running(&self) -> bool {
        self.background.is_some()
    }

    /// Feed direct messages into the manager until shutdown is requested or
    /// the mailbox closes.
    pub async fn run(&self, mut mailbox: mpsc::Receiver<PeerMessage>) {
        info!(agent_id = %self.manager.agent_id(), "node ready, draining mailbox");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                message = mailbox.recv() => match message {
                    Some(message) => self.manager.handle_inbound(message),
                    None => {
                        warn!(agent_id = %self.manager.agent_id(), "mailbox closed");
                        break;
                    }
                },
            }
        }
    }

    /// Stop timers, disconnect every peer gracefully and close admission.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(background) = self.background.take() {
            background.stop().await;
        }
        for connection in self.manager.connections() {
            self.manager
                .disconnect_peer(&connection.peer_id, "node shutdown")
                .await;
        }
        self.manager.close_admission();
        info!(agent_id = %self.manager.agent_id(), "peering node stopped");
    }
}
