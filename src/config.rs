use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;

/// Biological bounds for the timing windows. Configured windows must lie
/// entirely inside these ranges.
pub const LTP_WINDOW_RANGE_MS: (f64, f64) = (5.0, 15.0);
pub const LTD_WINDOW_RANGE_MS: (f64, f64) = (10.0, 25.0);
pub const MAX_STDP_CAUSALITY_WINDOW_MS: f64 = 100.0;
/// Upper bound for the activity and coherence look-back windows (one year)
pub const MAX_LOOKBACK_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// Peering node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeeringConfig {
    /// Identifier of the local agent
    pub agent_id: String,

    /// Capacity of the admission semaphore shared by negotiation and plasticity
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_operations: usize,

    /// Minimum compatibility score accepted during negotiation
    #[serde(default = "default_compatibility_threshold")]
    pub compatibility_threshold: f64,

    #[serde(default = "default_target_latency")]
    pub target_latency_ms: f64,

    #[serde(default = "default_max_latency")]
    pub max_latency_ms: f64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_ms: u64,

    /// Active connections idle for longer than this are demoted to Degraded
    #[serde(default = "default_inactivity_threshold")]
    pub inactivity_threshold_secs: u64,

    #[serde(default)]
    pub plasticity: PlasticityOptions,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// MQTT broker backing the global event bus (optional)
    #[serde(default)]
    pub bus: Option<MqttConfig>,
}

/// Parameters of the plasticity model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlasticityOptions {
    pub ltp_window_min_ms: f64,
    pub ltp_window_max_ms: f64,
    pub ltd_window_min_ms: f64,
    pub ltd_window_max_ms: f64,
    pub stdp_causality_window_ms: f64,
    pub min_synaptic_strength: f64,
    pub max_synaptic_strength: f64,
    pub initial_strength: f64,
    pub initial_coherence: f64,
    pub coherence_threshold: f64,
    pub enforce_timing: bool,
    pub enforce_causality: bool,
    pub target_activity: f64,
    pub activity_tolerance: f64,
    pub min_scaling_threshold: f64,
    pub max_scaling_threshold: f64,
    pub activity_window_secs: u64,
    pub activity_saturation_events: usize,
    pub coherence_window_secs: u64,
}

impl Default for PlasticityOptions {
    fn default() -> Self {
        Self {
            ltp_window_min_ms: 5.0,
            ltp_window_max_ms: 15.0,
            ltd_window_min_ms: 10.0,
            ltd_window_max_ms: 25.0,
            stdp_causality_window_ms: 100.0,
            min_synaptic_strength: 0.1,
            max_synaptic_strength: 5.0,
            initial_strength: 1.0,
            initial_coherence: 1.0,
            coherence_threshold: 0.8,
            enforce_timing: true,
            enforce_causality: true,
            target_activity: 0.6,
            activity_tolerance: 0.1,
            min_scaling_threshold: 0.5,
            max_scaling_threshold: 2.0,
            activity_window_secs: 60,
            activity_saturation_events: 100,
            coherence_window_secs: 600,
        }
    }
}

impl PlasticityOptions {
    /// Midpoint of the LTP window. Message delivery always potentiates at
    /// this timing, so the LTP timing gate only rejects values passed to the
    /// coordinator directly.
    pub fn ltp_optimal_timing_ms(&self) -> f64 {
        (self.ltp_window_min_ms + self.ltp_window_max_ms) / 2.0
    }

    /// Midpoint of the LTD window. Delivery failures always depress at this
    /// timing; out-of-window values only arrive through direct coordinator
    /// calls.
    pub fn ltd_optimal_timing_ms(&self) -> f64 {
        (self.ltd_window_min_ms + self.ltd_window_max_ms) / 2.0
    }

    /// Check every value against its biological or operational range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (ltp_lo, ltp_hi) = LTP_WINDOW_RANGE_MS;
        check_range("ltp_window_min_ms", self.ltp_window_min_ms, ltp_lo, ltp_hi)?;
        check_range("ltp_window_max_ms", self.ltp_window_max_ms, ltp_lo, ltp_hi)?;
        check_window("ltp", self.ltp_window_min_ms, self.ltp_window_max_ms)?;

        let (ltd_lo, ltd_hi) = LTD_WINDOW_RANGE_MS;
        check_range("ltd_window_min_ms", self.ltd_window_min_ms, ltd_lo, ltd_hi)?;
        check_range("ltd_window_max_ms", self.ltd_window_max_ms, ltd_lo, ltd_hi)?;
        check_window("ltd", self.ltd_window_min_ms, self.ltd_window_max_ms)?;

        check_positive_at_most(
            "stdp_causality_window_ms",
            self.stdp_causality_window_ms,
            MAX_STDP_CAUSALITY_WINDOW_MS,
        )?;

        check_positive_at_most("min_synaptic_strength", self.min_synaptic_strength, 100.0)?;
        check_positive_at_most("max_synaptic_strength", self.max_synaptic_strength, 100.0)?;
        check_window(
            "synaptic strength",
            self.min_synaptic_strength,
            self.max_synaptic_strength,
        )?;
        if self.min_synaptic_strength >= self.max_synaptic_strength {
            return Err(ConfigError::Invalid(
                "min_synaptic_strength must be below max_synaptic_strength".to_string(),
            ));
        }
        check_range(
            "initial_strength",
            self.initial_strength,
            self.min_synaptic_strength,
            self.max_synaptic_strength,
        )?;

        check_range("initial_coherence", self.initial_coherence, 0.0, 1.0)?;
        check_range("coherence_threshold", self.coherence_threshold, 0.0, 1.0)?;
        check_positive_at_most("target_activity", self.target_activity, 1.0)?;
        check_open_unit("activity_tolerance", self.activity_tolerance)?;
        check_positive_at_most("min_scaling_threshold", self.min_scaling_threshold, 1.0)?;
        check_range("max_scaling_threshold", self.max_scaling_threshold, 1.0, 10.0)?;

        check_range(
            "activity_window_secs",
            self.activity_window_secs as f64,
            1.0,
            MAX_LOOKBACK_WINDOW_SECS as f64,
        )?;
        if self.activity_saturation_events == 0 {
            return Err(ConfigError::Invalid(
                "activity_saturation_events must be positive".to_string(),
            ));
        }
        check_range(
            "coherence_window_secs",
            self.coherence_window_secs as f64,
            1.0,
            MAX_LOOKBACK_WINDOW_SECS as f64,
        )?;
        Ok(())
    }
}

/// Intervals of the background timers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub health_check_secs: u64,
    pub metrics_secs: u64,
    pub plasticity_validation_secs: u64,
    pub homeostatic_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 5,
            metrics_secs: 10,
            plasticity_validation_secs: 5,
            homeostatic_secs: 30,
        }
    }
}

impl ScheduleConfig {
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn metrics(&self) -> Duration {
        Duration::from_secs(self.metrics_secs)
    }

    pub fn plasticity_validation(&self) -> Duration {
        Duration::from_secs(self.plasticity_validation_secs)
    }

    pub fn homeostatic(&self) -> Duration {
        Duration::from_secs(self.homeostatic_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Named configuration presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Strict timing and causality enforcement, higher coherence bar
    BiologicallyAuthentic,
    /// Relaxed enforcement, larger admission pool
    HighPerformance,
    /// Tighter thresholds, smaller pool, more frequent monitoring
    Conservative,
}

fn default_max_concurrent() -> usize {
    100
}

fn default_compatibility_threshold() -> f64 {
    0.8
}

fn default_target_latency() -> f64 {
    10.0
}

fn default_max_latency() -> f64 {
    100.0
}

fn default_connection_timeout() -> u64 {
    5000
}

fn default_inactivity_threshold() -> u64 {
    300
}

fn default_keep_alive() -> u64 {
    30
}

impl PeeringConfig {
    /// Default configuration for an agent
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            max_concurrent_operations: default_max_concurrent(),
            compatibility_threshold: default_compatibility_threshold(),
            target_latency_ms: default_target_latency(),
            max_latency_ms: default_max_latency(),
            connection_timeout_ms: default_connection_timeout(),
            inactivity_threshold_secs: default_inactivity_threshold(),
            plasticity: PlasticityOptions::default(),
            schedule: ScheduleConfig::default(),
            bus: None,
        }
    }

    /// Build one of the named presets
    pub fn preset(preset: Preset, agent_id: impl Into<String>) -> Self {
        let mut config = Self::new(agent_id);
        match preset {
            Preset::BiologicallyAuthentic => {
                config.plasticity.enforce_timing = true;
                config.plasticity.enforce_causality = true;
                config.plasticity.coherence_threshold = 0.9;
            }
            Preset::HighPerformance => {
                config.max_concurrent_operations = 500;
                config.plasticity.enforce_timing = false;
                config.plasticity.enforce_causality = false;
                config.plasticity.coherence_threshold = 0.7;
                config.schedule = ScheduleConfig {
                    health_check_secs: 10,
                    metrics_secs: 30,
                    plasticity_validation_secs: 10,
                    homeostatic_secs: 60,
                };
            }
            Preset::Conservative => {
                config.max_concurrent_operations = 25;
                config.inactivity_threshold_secs = 120;
                config.plasticity.coherence_threshold = 0.85;
                config.plasticity.ltp_window_min_ms = 8.0;
                config.plasticity.ltp_window_max_ms = 12.0;
                config.plasticity.ltd_window_min_ms = 12.0;
                config.plasticity.ltd_window_max_ms = 20.0;
                config.plasticity.stdp_causality_window_ms = 50.0;
                config.plasticity.activity_tolerance = 0.05;
                config.schedule = ScheduleConfig {
                    health_check_secs: 2,
                    metrics_secs: 5,
                    plasticity_validation_secs: 2,
                    homeostatic_secs: 15,
                };
            }
        }
        config
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PeeringConfig = toml::from_str(&content)?;
        config.validate()?;
        info!(agent_id = %config.agent_id, "configuration loaded");
        Ok(config)
    }

    /// Reject any value outside its documented range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent_id.trim().is_empty() {
            return Err(ConfigError::Invalid("agent_id must not be empty".to_string()));
        }
        check_range(
            "max_concurrent_operations",
            self.max_concurrent_operations as f64,
            1.0,
            10_000.0,
        )?;
        check_positive_at_most("compatibility_threshold", self.compatibility_threshold, 1.0)?;
        check_positive_at_most("target_latency_ms", self.target_latency_ms, 60_000.0)?;
        check_positive_at_most("max_latency_ms", self.max_latency_ms, 60_000.0)?;
        check_window("latency", self.target_latency_ms, self.max_latency_ms)?;
        if self.connection_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connection_timeout_ms must be positive".to_string(),
            ));
        }
        if self.inactivity_threshold_secs == 0 {
            return Err(ConfigError::Invalid(
                "inactivity_threshold_secs must be positive".to_string(),
            ));
        }
        let s = &self.schedule;
        for (name, secs) in [
            ("health_check_secs", s.health_check_secs),
            ("metrics_secs", s.metrics_secs),
            ("plasticity_validation_secs", s.plasticity_validation_secs),
            ("homeostatic_secs", s.homeostatic_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        self.plasticity.validate()
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_secs)
    }
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_positive_at_most(field: &'static str, value: f64, max: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max,
        });
    }
    Ok(())
}

fn check_open_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 || value >= 1.0 {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}

fn check_window(field: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidWindow { field, min, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = PeeringConfig::new("agent-a");
        assert!(config.validate().is_ok());
        assert_eq!(config.max_concurrent_operations, 100);
        assert_eq!(config.inactivity_threshold(), Duration::from_secs(300));
        assert_eq!(config.schedule.health_check(), Duration::from_secs(5));
        assert_eq!(config.schedule.homeostatic(), Duration::from_secs(30));
    }

    #[test]
    fn test_presets_are_valid() {
        for preset in [
            Preset::BiologicallyAuthentic,
            Preset::HighPerformance,
            Preset::Conservative,
        ] {
            let config = PeeringConfig::preset(preset, "agent-a");
            assert!(config.validate().is_ok(), "{:?} should validate", preset);
        }
    }

    #[test]
    fn test_preset_characteristics() {
        let bio = PeeringConfig::preset(Preset::BiologicallyAuthentic, "a");
        let fast = PeeringConfig::preset(Preset::HighPerformance, "a");
        let safe = PeeringConfig::preset(Preset::Conservative, "a");

        assert!(bio.plasticity.enforce_timing && bio.plasticity.enforce_causality);
        assert!(bio.plasticity.coherence_threshold > fast.plasticity.coherence_threshold);
        assert!(!fast.plasticity.enforce_timing);
        assert!(fast.max_concurrent_operations > bio.max_concurrent_operations);
        assert!(safe.max_concurrent_operations < bio.max_concurrent_operations);
        assert!(safe.schedule.health_check_secs < bio.schedule.health_check_secs);
    }

    #[test]
    fn test_ltp_window_out_of_range_rejected() {
        let mut config = PeeringConfig::new("a");
        config.plasticity.ltp_window_min_ms = 4.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "ltp_window_min_ms", .. })
        ));

        let mut config = PeeringConfig::new("a");
        config.plasticity.ltp_window_max_ms = 16.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ltd_window_out_of_range_rejected() {
        let mut config = PeeringConfig::new("a");
        config.plasticity.ltd_window_max_ms = 30.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "ltd_window_max_ms", .. })
        ));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let mut config = PeeringConfig::new("a");
        config.plasticity.ltp_window_min_ms = 12.0;
        config.plasticity.ltp_window_max_ms = 8.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWindow { field: "ltp", .. })
        ));
    }

    #[test]
    fn test_stdp_window_limit() {
        let mut config = PeeringConfig::new("a");
        config.plasticity.stdp_causality_window_ms = 100.0;
        assert!(config.validate().is_ok());
        config.plasticity.stdp_causality_window_ms = 100.5;
        assert!(config.validate().is_err());
        config.plasticity.stdp_causality_window_ms = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_lookback_windows_bounded() {
        let mut config = PeeringConfig::new("a");
        config.plasticity.coherence_window_secs = 10_000_000_000_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "coherence_window_secs", .. })
        ));

        let mut config = PeeringConfig::new("a");
        config.plasticity.activity_window_secs = MAX_LOOKBACK_WINDOW_SECS + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "activity_window_secs", .. })
        ));

        let mut config = PeeringConfig::new("a");
        config.plasticity.coherence_window_secs = 0;
        assert!(config.validate().is_err());

        config.plasticity.coherence_window_secs = MAX_LOOKBACK_WINDOW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_strength_bounds_rejected() {
        let mut config = PeeringConfig::new("a");
        config.plasticity.min_synaptic_strength = 5.0;
        config.plasticity.max_synaptic_strength = 5.0;
        assert!(config.validate().is_err());

        let mut config = PeeringConfig::new("a");
        config.plasticity.initial_strength = 6.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pool_rejected() {
        let mut config = PeeringConfig::new("a");
        config.max_concurrent_operations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_agent_id_rejected() {
        let config = PeeringConfig::new("  ");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_optimal_timings() {
        let options = PlasticityOptions::default();
        assert_eq!(options.ltp_optimal_timing_ms(), 10.0);
        assert_eq!(options.ltd_optimal_timing_ms(), 17.5);
    }

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
agent_id = "agent-toml"
max_concurrent_operations = 42

[plasticity]
coherence_threshold = 0.75

[bus]
broker = "localhost"
port = 1883
"#
        )
        .unwrap();

        let config = PeeringConfig::from_file(file.path()).unwrap();
        assert_eq!(config.agent_id, "agent-toml");
        assert_eq!(config.max_concurrent_operations, 42);
        assert_eq!(config.plasticity.coherence_threshold, 0.75);
        assert_eq!(config.plasticity.ltp_window_max_ms, 15.0);
        assert_eq!(config.schedule.metrics_secs, 10);
        let bus = config.bus.unwrap();
        assert_eq!(bus.port, 1883);
        assert_eq!(bus.keep_alive_secs, 30);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
agent_id = "agent-toml"

[plasticity]
ltd_window_min_ms = 2.0
"#
        )
        .unwrap();

        assert!(matches!(
            PeeringConfig::from_file(file.path()),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let result = PeeringConfig::from_file("/nonexistent/synapse.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
