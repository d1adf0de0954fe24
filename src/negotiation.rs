//! Compatibility scoring and capability negotiation.
//!
//! Both functions are pure; the manager drives them between transport calls.

use crate::connection::{NegotiatedCapabilities, PeeringCapabilities};
use crate::error::NegotiationFailure;

pub const CONSCIOUSNESS_WEIGHT: f64 = 0.4;
pub const LATENCY_WEIGHT: f64 = 0.3;
pub const THROUGHPUT_WEIGHT: f64 = 0.2;
pub const PATHWAY_WEIGHT: f64 = 0.1;

/// Per-factor breakdown of a compatibility score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompatibilityScore {
    pub consciousness: f64,
    pub latency: f64,
    pub throughput: f64,
    pub pathways: f64,
}

impl CompatibilityScore {
    pub fn total(&self) -> f64 {
        CONSCIOUSNESS_WEIGHT * self.consciousness
            + LATENCY_WEIGHT * self.latency
            + THROUGHPUT_WEIGHT * self.throughput
            + PATHWAY_WEIGHT * self.pathways
    }
}

/// Score how well `offered` satisfies `requested`. Every factor is in [0, 1].
///
/// A consciousness shortfall is penalised quadratically: offering half the
/// requested level contributes a quarter of the weight.
pub fn score_compatibility(
    requested: &PeeringCapabilities,
    offered: &PeeringCapabilities,
) -> CompatibilityScore {
    let consciousness = if requested.consciousness_level <= 0.0 {
        1.0
    } else {
        let ratio = (offered.consciousness_level / requested.consciousness_level).clamp(0.0, 1.0);
        ratio * ratio
    };

    let latency = if offered.max_latency_ms <= 0.0 {
        1.0
    } else {
        (requested.max_latency_ms / offered.max_latency_ms).clamp(0.0, 1.0)
    };

    let throughput = if requested.min_throughput <= 0.0 {
        1.0
    } else {
        (offered.min_throughput / requested.min_throughput).clamp(0.0, 1.0)
    };

    let pathways = if requested.pathways.is_empty() {
        1.0
    } else {
        let overlap = requested.pathways.intersection(&offered.pathways).count();
        overlap as f64 / requested.pathways.len() as f64
    };

    CompatibilityScore {
        consciousness,
        latency,
        throughput,
        pathways,
    }
}

/// Intersect and clamp requested against offered capabilities.
///
/// The negotiated channel takes the weaker side of every bound: the lower
/// consciousness level and throughput, the looser latency bound, the common
/// pathways, and the highest common protocol version.
pub fn negotiate(
    requested: &PeeringCapabilities,
    offered: &PeeringCapabilities,
    compatibility_score: f64,
) -> Result<NegotiatedCapabilities, NegotiationFailure> {
    let protocol_version = requested
        .protocol_versions
        .intersection(&offered.protocol_versions)
        .max()
        .copied()
        .ok_or_else(|| NegotiationFailure::Negotiation("no common protocol version".to_string()))?;

    let pathways: std::collections::BTreeSet<String> = if requested.pathways.is_empty() {
        offered.pathways.clone()
    } else {
        requested
            .pathways
            .intersection(&offered.pathways)
            .cloned()
            .collect()
    };
    if !requested.pathways.is_empty() && pathways.is_empty() {
        return Err(NegotiationFailure::Negotiation(
            "no common pathways".to_string(),
        ));
    }

    let capabilities = PeeringCapabilities {
        consciousness_level: requested
            .consciousness_level
            .min(offered.consciousness_level)
            .clamp(0.0, 1.0),
        max_latency_ms: requested.max_latency_ms.max(offered.max_latency_ms),
        min_throughput: requested.min_throughput.min(offered.min_throughput).max(0.0),
        pathways,
        protocol_versions: [protocol_version].into_iter().collect(),
    };

    Ok(NegotiatedCapabilities {
        capabilities,
        protocol_version,
        compatibility_score,
    })
}
