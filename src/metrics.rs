use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Weight of the newest sample in the latency moving average
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Rolling delivery metrics for one peer
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PeerMetrics {
    pub messages_total: u64,
    pub messages_delivered: u64,
    pub messages_failed: u64,
    pub fallback_emissions: u64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: Option<f64>,
    /// Exponential moving average
    pub avg_latency_ms: f64,
    /// Simple mean over every delivery
    pub mean_latency_ms: f64,
    /// Delivered messages per second since the first delivery
    pub throughput: f64,
    pub first_delivery: Option<DateTime<Utc>>,
    pub last_delivery: Option<DateTime<Utc>>,
    pub custom: HashMap<String, f64>,
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a direct delivery and its latency
    pub fn record_delivery(&mut self, latency_ms: f64, at: DateTime<Utc>) {
        self.messages_total += 1;
        self.messages_delivered += 1;

        self.min_latency_ms = Some(self.min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        self.max_latency_ms = Some(self.max_latency_ms.map_or(latency_ms, |m| m.max(latency_ms)));

        if self.messages_delivered == 1 {
            self.avg_latency_ms = latency_ms;
            self.mean_latency_ms = latency_ms;
        } else {
            self.avg_latency_ms =
                LATENCY_EMA_ALPHA * latency_ms + (1.0 - LATENCY_EMA_ALPHA) * self.avg_latency_ms;
            let n = self.messages_delivered as f64;
            self.mean_latency_ms += (latency_ms - self.mean_latency_ms) / n;
        }

        let first = *self.first_delivery.get_or_insert(at);
        self.last_delivery = Some(at);
        let span_secs = (at - first).num_milliseconds() as f64 / 1000.0;
        self.throughput = if span_secs > 0.0 {
            self.messages_delivered as f64 / span_secs
        } else {
            self.messages_delivered as f64
        };
    }

    /// Record a failed direct delivery that fell back to the bus
    pub fn record_failure(&mut self) {
        self.messages_total += 1;
        self.messages_failed += 1;
        self.fallback_emissions += 1;
    }

    /// Set a custom metric
    pub fn set_custom(&mut self, key: impl Into<String>, value: f64) {
        self.custom.insert(key.into(), value);
    }

    /// Get success rate as a fraction in [0, 1]
    pub fn success_rate(&self) -> f64 {
        if self.messages_total == 0 {
            return 1.0;
        }
        self.messages_delivered as f64 / self.messages_total as f64
    }

    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate()
    }
}
