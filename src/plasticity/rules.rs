//! Plasticity formulas. Pure functions; the coordinator applies them under
//! the per-peer lock.

use serde::{Deserialize, Serialize};

pub const LTP_BASE_RATE: f64 = 0.1;
pub const LTD_BASE_RATE: f64 = 0.05;
pub const STDP_RATE: f64 = 0.01;
pub const SUSTAINED_ACTIVITY_SATURATION_MS: f64 = 10_000.0;
pub const COHERENCE_VIOLATION_PENALTY: f64 = 0.1;

/// Inputs to long-term potentiation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LtpContext {
    /// Usage frequency in [0, 1]
    pub usage_frequency: f64,
    pub coherence: f64,
    /// Timing precision in [0, 1]
    pub timing_precision: f64,
    pub sustained_duration_ms: f64,
    /// Elapsed time since the triggering event
    pub timing_ms: f64,
}

/// Inputs to long-term depression. Every factor is normalised to [0, 1]
/// by the caller and capped here.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LtdContext {
    pub inactivity: f64,
    pub error_rate: f64,
    pub latency_degradation: f64,
    pub coherence_loss: f64,
    pub timing_ms: f64,
}

fn unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

pub fn within_window(timing_ms: f64, min_ms: f64, max_ms: f64) -> bool {
    timing_ms >= min_ms && timing_ms <= max_ms
}

/// `0.1 × min(2·usage, 1) × coherence² × precision × min(duration / 10s, 1)`
pub fn ltp_delta(ctx: &LtpContext) -> f64 {
    let usage_factor = (ctx.usage_frequency * 2.0).min(1.0).max(0.0);
    let coherence = unit(ctx.coherence);
    let sustained = (ctx.sustained_duration_ms / SUSTAINED_ACTIVITY_SATURATION_MS)
        .min(1.0)
        .max(0.0);
    LTP_BASE_RATE * usage_factor * coherence * coherence * unit(ctx.timing_precision) * sustained
}

/// `0.05 × (1 + inactivity + 3·errors + 2·latency + 2·coherence loss)`
pub fn ltd_delta(ctx: &LtdContext) -> f64 {
    LTD_BASE_RATE
        * (1.0
            + unit(ctx.inactivity)
            + unit(ctx.error_rate) * 3.0
            + unit(ctx.latency_degradation) * 2.0
            + unit(ctx.coherence_loss) * 2.0)
}

/// A pair is causal iff the post event strictly follows the pre event and
/// lands inside the window.
pub fn is_causal(gap_ms: f64, window_ms: f64) -> bool {
    gap_ms > 0.0 && gap_ms <= window_ms
}

/// Strengthening for a causal pair, decaying with the normalised gap.
pub fn stdp_potentiation(gap_ms: f64, window_ms: f64, avg_magnitude: f64) -> f64 {
    STDP_RATE * (-(gap_ms / window_ms)).exp() * unit(avg_magnitude)
}

/// Weakening for an anti-causal pair when causality is not enforced.
pub fn stdp_depression(gap_ms: f64, window_ms: f64, avg_magnitude: f64) -> f64 {
    -STDP_RATE * (-(gap_ms.abs() / window_ms)).exp() * unit(avg_magnitude)
}

/// Scaling factor pushing `observed` toward `target`, or `None` when the
/// deviation is within tolerance.
pub fn homeostatic_factor(
    observed: f64,
    target: f64,
    tolerance: f64,
    min_scaling: f64,
    max_scaling: f64,
) -> Option<f64> {
    let deviation = (observed - target).abs() / target;
    if deviation <= tolerance {
        return None;
    }
    if observed <= 0.0 {
        return Some(max_scaling);
    }
    Some((target / observed).clamp(min_scaling, max_scaling))
}

/// `avg(coherence) × compliance − 0.1 × violations`, clamped to [0, 1]
pub fn window_coherence(avg_coherence: f64, compliance_ratio: f64, violations: usize) -> f64 {
    (unit(avg_coherence) * unit(compliance_ratio)
        - COHERENCE_VIOLATION_PENALTY * violations as f64)
        .clamp(0.0, 1.0)
}

/// Delivery quality in [0, 1] given a latency and the negotiated bound.
pub fn delivery_quality(latency_ms: f64, max_latency_ms: f64) -> f64 {
    if max_latency_ms <= 0.0 {
        return 1.0;
    }
    1.0 - (latency_ms / max_latency_ms).clamp(0.0, 1.0)
}
