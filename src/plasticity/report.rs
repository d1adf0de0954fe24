use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::state::{EventCounts, PlasticityEvent, PlasticityEventKind, PlasticityState};
use crate::config::PlasticityOptions;

/// Result of an LTP or LTD request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlasticityChange {
    pub kind: PlasticityEventKind,
    pub old_strength: f64,
    pub new_strength: f64,
    /// False when the timing gate turned the request into a no-op
    pub applied: bool,
}

/// Result of evaluating one pre/post pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StdpOutcome {
    pub causal: bool,
    pub gap_ms: f64,
    pub old_strength: f64,
    pub new_strength: f64,
}

/// Replay of one peer's history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReport {
    pub peer_id: String,
    pub current_strength: f64,
    pub current_coherence: f64,
    pub stdp_compliance_rate: f64,
    pub counts: EventCounts,
    pub ltp_events: Vec<PlasticityEvent>,
    pub ltd_events: Vec<PlasticityEvent>,
    pub homeostatic_events: Vec<PlasticityEvent>,
    pub strength_timeline: Vec<(DateTime<Utc>, f64)>,
    pub coherence_timeline: Vec<(DateTime<Utc>, f64)>,
}

impl PeerReport {
    /// Report for a peer with no history
    pub fn empty(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            current_strength: 1.0,
            current_coherence: 1.0,
            stdp_compliance_rate: 1.0,
            counts: EventCounts::default(),
            ltp_events: Vec::new(),
            ltd_events: Vec::new(),
            homeostatic_events: Vec::new(),
            strength_timeline: Vec::new(),
            coherence_timeline: Vec::new(),
        }
    }

    pub fn from_state(state: &PlasticityState) -> Self {
        let of_kind = |kind: PlasticityEventKind| -> Vec<PlasticityEvent> {
            state
                .history()
                .iter()
                .filter(|e| e.kind == kind)
                .cloned()
                .collect()
        };
        Self {
            peer_id: state.peer_id.clone(),
            current_strength: state.strength(),
            current_coherence: state.coherence(),
            stdp_compliance_rate: state.counts().stdp_compliance_rate(),
            counts: state.counts().clone(),
            ltp_events: of_kind(PlasticityEventKind::Ltp),
            ltd_events: of_kind(PlasticityEventKind::Ltd),
            homeostatic_events: of_kind(PlasticityEventKind::HomeostaticScaling),
            strength_timeline: state
                .history()
                .iter()
                .map(|e| (e.timestamp, e.new_strength))
                .collect(),
            coherence_timeline: state
                .history()
                .iter()
                .map(|e| (e.timestamp, e.coherence))
                .collect(),
        }
    }
}

/// Point-in-time view of one peer inside [`NeuralPlasticityMetrics`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPlasticitySnapshot {
    pub strength: f64,
    pub coherence: f64,
    pub timing_compliance: f64,
    pub counts: EventCounts,
}

/// Aggregate over every tracked peer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeuralPlasticityMetrics {
    pub tracked_peers: usize,
    pub ltp_events: u64,
    pub ltd_events: u64,
    pub stdp_events: u64,
    pub stdp_violations: u64,
    pub timing_violations: u64,
    pub homeostatic_events: u64,
    pub average_strength: f64,
    pub average_coherence: f64,
    pub biological_timing_compliance: f64,
    pub peer_details: HashMap<String, PeerPlasticitySnapshot>,
}

impl NeuralPlasticityMetrics {
    pub fn aggregate<'a, I>(states: I) -> Self
    where
        I: IntoIterator<Item = &'a PlasticityState>,
    {
        let mut metrics = Self::default();
        let mut strength_sum = 0.0;
        let mut coherence_sum = 0.0;
        let mut compliance_sum = 0.0;

        for state in states {
            let counts = state.counts();
            metrics.ltp_events += counts.ltp;
            metrics.ltd_events += counts.ltd;
            metrics.stdp_events += counts.stdp;
            metrics.stdp_violations += counts.stdp_violations;
            metrics.timing_violations += counts.timing_violations;
            metrics.homeostatic_events += counts.homeostatic;
            strength_sum += state.strength();
            coherence_sum += state.coherence();
            compliance_sum += counts.compliance_ratio();
            metrics.peer_details.insert(
                state.peer_id.clone(),
                PeerPlasticitySnapshot {
                    strength: state.strength(),
                    coherence: state.coherence(),
                    timing_compliance: counts.compliance_ratio(),
                    counts: counts.clone(),
                },
            );
            metrics.tracked_peers += 1;
        }

        if metrics.tracked_peers > 0 {
            let n = metrics.tracked_peers as f64;
            metrics.average_strength = strength_sum / n;
            metrics.average_coherence = coherence_sum / n;
            metrics.biological_timing_compliance = compliance_sum / n;
        } else {
            metrics.biological_timing_compliance = 1.0;
        }
        metrics
    }
}

/// A peer whose coherence fell below its threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceViolation {
    pub peer_id: String,
    pub coherence: f64,
    pub threshold: f64,
    /// Shortfall below the threshold
    pub severity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CorrectiveAction {
    Resynchronize { peer_id: String },
    HomeostaticScaling { peer_ids: Vec<String> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoherenceValidation {
    pub peer_coherence: HashMap<String, f64>,
    pub violations: Vec<CoherenceViolation>,
    pub recommended_actions: Vec<CorrectiveAction>,
}

impl CoherenceValidation {
    pub fn is_coherent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Parameters of one homeostatic pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeostaticOptions {
    pub target_activity: f64,
    pub tolerance: f64,
    pub min_scaling: f64,
    pub max_scaling: f64,
}

impl From<&PlasticityOptions> for HomeostaticOptions {
    fn from(options: &PlasticityOptions) -> Self {
        Self {
            target_activity: options.target_activity,
            tolerance: options.activity_tolerance,
            min_scaling: options.min_scaling_threshold,
            max_scaling: options.max_scaling_threshold,
        }
    }
}

impl Default for HomeostaticOptions {
    fn default() -> Self {
        Self::from(&PlasticityOptions::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeostaticOutcome {
    pub observed_activity: f64,
    pub target_activity: f64,
    pub scaling_factor: f64,
    pub applied: bool,
    pub peers_scaled: usize,
}
