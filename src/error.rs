//! Error taxonomy for peering and plasticity.
//!
//! Only [`ConfigError`] is fatal. Negotiation failures travel inside
//! [`crate::connection::PeeringResult`], transport and bus failures are
//! compensated inside the manager, and timing/causality violations are
//! history events rather than errors.

/// Invalid configuration. Raised at startup, never clamped silently.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} = {value} is outside the allowed range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} window is inverted: min {min} > max {max}")]
    InvalidWindow {
        field: &'static str,
        min: f64,
        max: f64,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Why a negotiation did not produce a connection. The `Display` output is the
/// human-readable reason handed back to the caller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NegotiationFailure {
    #[error("peer {0} is already connected")]
    AlreadyConnected(String),
    #[error("a negotiation with {0} is already in progress")]
    NegotiationInProgress(String),
    #[error("capability discovery failed: {0}")]
    Discovery(String),
    #[error("compatibility score {score:.3} is below the required threshold {threshold:.3}")]
    Incompatible { score: f64, threshold: f64 },
    #[error("capability negotiation failed: {0}")]
    Negotiation(String),
    #[error("connection establishment failed: {0}")]
    Connection(String),
    #[error("synchronization failed: {0}")]
    Synchronization(String),
    #[error("plasticity configuration rejected: {0}")]
    Configuration(String),
    #[error("admission control is closed")]
    AdmissionClosed,
    #[error("negotiation cancelled")]
    Cancelled,
}

/// Failure of the direct peer transport.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),
    #[error("operation timed out after {0} ms")]
    Timeout(u64),
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("operation cancelled")]
    Cancelled,
}

/// Failure of the global event bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish {event}: {reason}")]
    Publish { event: String, reason: String },
    #[error("failed to subscribe to {event}: {reason}")]
    Subscribe { event: String, reason: String },
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failure of a plasticity coordinator operation.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("admission control is closed")]
    AdmissionClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("peer {0} is not tracked")]
    UnknownPeer(String),
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incompatible_reason_mentions_compatibility() {
        let failure = NegotiationFailure::Incompatible {
            score: 0.71,
            threshold: 0.8,
        };
        let reason = failure.to_string();
        assert!(reason.contains("compatibility"));
        assert!(reason.contains("0.710"));
    }

    #[test]
    fn test_out_of_range_message() {
        let err = ConfigError::OutOfRange {
            field: "ltp_window_min_ms",
            value: 2.0,
            min: 5.0,
            max: 15.0,
        };
        assert_eq!(
            err.to_string(),
            "ltp_window_min_ms = 2 is outside the allowed range [5, 15]"
        );
    }

    #[test]
    fn test_coordinator_error_wraps_config() {
        let err: CoordinatorError = ConfigError::Invalid("bad".to_string()).into();
        assert!(matches!(err, CoordinatorError::Configuration(_)));
    }
}
