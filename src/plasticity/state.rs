use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::clock::lookback;
use crate::config::PlasticityOptions;

const CAUSALITY_CAPACITY: usize = 100;
const CAUSALITY_RETAIN: usize = 50;
const HISTORY_CAPACITY: usize = 1000;
const HISTORY_RETAIN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CausalityKind {
    PreSynaptic,
    PostSynaptic,
}

/// One pre- or post-synaptic event in a peer's causality ring
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CausalityEvent {
    pub kind: CausalityKind,
    pub timestamp: DateTime<Utc>,
    /// Event amplitude in [0, 1]
    pub magnitude: f64,
}

impl CausalityEvent {
    pub fn pre(timestamp: DateTime<Utc>, magnitude: f64) -> Self {
        Self {
            kind: CausalityKind::PreSynaptic,
            timestamp,
            magnitude: magnitude.clamp(0.0, 1.0),
        }
    }

    pub fn post(timestamp: DateTime<Utc>, magnitude: f64) -> Self {
        Self {
            kind: CausalityKind::PostSynaptic,
            timestamp,
            magnitude: magnitude.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlasticityEventKind {
    Initialization,
    Ltp,
    Ltd,
    Stdp,
    StdpViolation,
    HomeostaticScaling,
    /// LTP or LTD rejected because its timing fell outside the window
    TimingViolation,
}

/// Append-only history record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlasticityEvent {
    pub kind: PlasticityEventKind,
    pub timestamp: DateTime<Utc>,
    pub old_strength: f64,
    pub new_strength: f64,
    pub delta: f64,
    pub coherence: f64,
    pub biologically_compliant: bool,
    pub description: String,
}

/// Running totals that survive history pruning
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventCounts {
    pub initialization: u64,
    pub ltp: u64,
    pub ltd: u64,
    pub stdp: u64,
    pub stdp_violations: u64,
    pub homeostatic: u64,
    pub timing_violations: u64,
    pub compliant: u64,
    pub total: u64,
}

impl EventCounts {
    fn count(&mut self, event: &PlasticityEvent) {
        match event.kind {
            PlasticityEventKind::Initialization => self.initialization += 1,
            PlasticityEventKind::Ltp => self.ltp += 1,
            PlasticityEventKind::Ltd => self.ltd += 1,
            PlasticityEventKind::Stdp => self.stdp += 1,
            PlasticityEventKind::StdpViolation => self.stdp_violations += 1,
            PlasticityEventKind::HomeostaticScaling => self.homeostatic += 1,
            PlasticityEventKind::TimingViolation => self.timing_violations += 1,
        }
        self.total += 1;
        if event.biologically_compliant {
            self.compliant += 1;
        }
    }

    /// Fraction of biologically compliant events, 1.0 when empty
    pub fn compliance_ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.compliant as f64 / self.total as f64
    }

    /// STDP pairs that were causally valid, 1.0 when none were evaluated
    pub fn stdp_compliance_rate(&self) -> f64 {
        let evaluated = self.stdp + self.stdp_violations;
        if evaluated == 0 {
            return 1.0;
        }
        self.stdp as f64 / evaluated as f64
    }
}

/// Per-peer plasticity state. Strength stays within the configured bounds and
/// coherence within [0, 1].
#[derive(Debug, Clone)]
pub struct PlasticityState {
    pub peer_id: String,
    strength: f64,
    coherence: f64,
    pub last_ltp: Option<DateTime<Utc>>,
    pub last_ltd: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub options: PlasticityOptions,
    causality: VecDeque<CausalityEvent>,
    history: Vec<PlasticityEvent>,
    counts: EventCounts,
}

impl PlasticityState {
    pub fn new(
        peer_id: impl Into<String>,
        options: PlasticityOptions,
        coherence: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let strength = options
            .initial_strength
            .clamp(options.min_synaptic_strength, options.max_synaptic_strength);
        let mut state = Self {
            peer_id: peer_id.into(),
            strength,
            coherence: coherence.clamp(0.0, 1.0),
            last_ltp: None,
            last_ltd: None,
            created_at: now,
            options,
            causality: VecDeque::with_capacity(CAUSALITY_CAPACITY),
            history: Vec::new(),
            counts: EventCounts::default(),
        };
        state.record(
            PlasticityEventKind::Initialization,
            now,
            strength,
            true,
            "plasticity tracking initialized".to_string(),
        );
        state
    }

    pub fn strength(&self) -> f64 {
        self.strength
    }

    pub fn coherence(&self) -> f64 {
        self.coherence
    }

    pub fn set_coherence(&mut self, coherence: f64) {
        self.coherence = coherence.clamp(0.0, 1.0);
    }

    pub fn counts(&self) -> &EventCounts {
        &self.counts
    }

    pub fn history(&self) -> &[PlasticityEvent] {
        &self.history
    }

    pub fn causality(&self) -> impl Iterator<Item = &CausalityEvent> {
        self.causality.iter()
    }

    /// Clamp `strength` into the configured bounds
    pub fn bound(&self, strength: f64) -> f64 {
        strength.clamp(
            self.options.min_synaptic_strength,
            self.options.max_synaptic_strength,
        )
    }

    /// Move strength to `target` (clamped) and append the event describing it.
    /// Returns the strength actually stored.
    pub fn record(
        &mut self,
        kind: PlasticityEventKind,
        timestamp: DateTime<Utc>,
        target: f64,
        compliant: bool,
        description: String,
    ) -> f64 {
        let old = self.strength;
        self.strength = self.bound(target);
        let event = PlasticityEvent {
            kind,
            timestamp,
            old_strength: old,
            new_strength: self.strength,
            delta: self.strength - old,
            coherence: self.coherence,
            biologically_compliant: compliant,
            description,
        };
        self.counts.count(&event);
        self.history.push(event);
        if self.history.len() > HISTORY_CAPACITY {
            let excess = self.history.len() - HISTORY_RETAIN;
            self.history.drain(..excess);
        }
        self.strength
    }

    pub fn push_causality(&mut self, event: CausalityEvent) {
        self.causality.push_back(event);
        if self.causality.len() > CAUSALITY_CAPACITY {
            let excess = self.causality.len() - CAUSALITY_RETAIN;
            self.causality.drain(..excess);
        }
    }

    /// The two most recently appended causality events, oldest first
    pub fn last_causality_pair(&self) -> Option<(CausalityEvent, CausalityEvent)> {
        let n = self.causality.len();
        if n < 2 {
            return None;
        }
        Some((self.causality[n - 2], self.causality[n - 1]))
    }

    /// Recent activity in [0, 1]: causality events inside the activity window
    /// relative to the saturation count.
    pub fn activity(&self, now: DateTime<Utc>) -> f64 {
        let cutoff = lookback(now, self.options.activity_window_secs);
        let recent = self
            .causality
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .count();
        (recent as f64 / self.options.activity_saturation_events as f64).min(1.0)
    }

    /// Timestamp of the newest history or causality event
    pub fn last_event_at(&self) -> DateTime<Utc> {
        let history = self.history.last().map(|e| e.timestamp);
        let causality = self.causality.back().map(|e| e.timestamp);
        [history, causality]
            .into_iter()
            .flatten()
            .fold(self.created_at, |latest, t| latest.max(t))
    }

    /// History events at or after `cutoff`
    pub fn events_since(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = &PlasticityEvent> {
        self.history.iter().filter(move |e| e.timestamp >= cutoff)
    }
}
