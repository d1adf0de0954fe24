//! Synaptic plasticity model governing connection quality.

pub mod coordinator;
pub mod report;
pub mod rules;
pub mod state;

pub use coordinator::PlasticityCoordinator;
pub use report::{
    CoherenceValidation, CoherenceViolation, CorrectiveAction, HomeostaticOptions,
    HomeostaticOutcome, NeuralPlasticityMetrics, PeerPlasticitySnapshot, PeerReport,
    PlasticityChange, StdpOutcome,
};
pub use rules::{LtdContext, LtpContext};
pub use state::{
    CausalityEvent, CausalityKind, EventCounts, PlasticityEvent, PlasticityEventKind,
    PlasticityState,
};
