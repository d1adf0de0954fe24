use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use synapse_peering::agent::PeeringNode;
use synapse_peering::clock::SystemClock;
use synapse_peering::config::{MqttConfig, PeeringConfig, Preset};
use synapse_peering::connection::{PeeringCapabilities, PeeringRequest};
use synapse_peering::mqtt::MqttBus;
use synapse_peering::transport::LoopbackTransport;

/// Synapse peering node - direct agent-to-agent channels with plasticity
#[derive(Parser, Debug)]
#[command(name = "synapse-node", version, about)]
struct Args {
    /// Agent ID (unique identifier)
    #[arg(short, long)]
    id: String,

    /// Configuration preset, ignored when --config is given
    #[arg(long, value_enum, default_value_t = Preset::BiologicallyAuthentic)]
    preset: Preset,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT broker address
    #[arg(short, long, default_value = "localhost")]
    broker: String,

    /// MQTT broker port
    #[arg(short, long, default_value_t = 1883)]
    port: u16,

    /// In-process peers to register and negotiate with
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,

    /// Simulated per-hop latency of the in-process transport
    #[arg(long, default_value_t = 2)]
    latency_ms: u64,

    /// Interval between heartbeats sent to every active peer
    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => PeeringConfig::from_file(path)?,
        None => PeeringConfig::preset(args.preset, &args.id),
    };
    config.agent_id = args.id.clone();
    let mqtt = config.bus.clone().unwrap_or(MqttConfig {
        broker: args.broker.clone(),
        port: args.port,
        keep_alive_secs: 30,
    });

    info!(
        agent_id = %config.agent_id,
        broker = %mqtt.broker,
        port = mqtt.port,
        peers = args.peers.len(),
        "starting synapse node"
    );

    let (bus, eventloop) = MqttBus::new(&mqtt, config.agent_id.clone());
    let bus = Arc::new(bus);
    tokio::spawn(bus.clone().pump(eventloop));

    let capabilities = PeeringCapabilities::default();
    let transport = LoopbackTransport::new(Duration::from_millis(args.latency_ms));
    let mailbox = transport.register(&config.agent_id, capabilities.clone(), 1024);
    for peer in &args.peers {
        let mut inbox = transport.register(peer, capabilities.clone(), 1024);
        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                debug!(peer_id = %peer, from = %message.from, event = %message.event, "peer received event");
            }
        });
    }

    let mut node = PeeringNode::new(
        config,
        capabilities.clone(),
        Arc::new(transport),
        bus,
        Arc::new(SystemClock),
    )?;
    node.start();

    let cancel = node.shutdown_token();
    for peer in &args.peers {
        let result = node
            .manager()
            .request_peering(peer, PeeringRequest::new(capabilities.clone()), &cancel)
            .await;
        match result.failure_reason() {
            None => info!(peer_id = %peer, "peered"),
            Some(reason) => warn!(peer_id = %peer, reason = %reason, "peering failed"),
        }
    }

    let manager = node.manager().clone();
    let heartbeat_cancel = cancel.clone();
    let heartbeat_period = Duration::from_secs(args.heartbeat_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(heartbeat_period);
        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = interval.tick() => {
                    for peer in manager.active_peers() {
                        let payload = json!({
                            "agent_id": manager.agent_id(),
                            "strength": manager.coordinator().strength(&peer),
                        });
                        manager.emit_to_peer(&peer, "heartbeat", payload, &heartbeat_cancel).await;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = node.run(mailbox) => {}
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    node.shutdown().await;
    Ok(())
}
