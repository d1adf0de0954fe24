use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use super::report::{
    CoherenceValidation, CoherenceViolation, CorrectiveAction, HomeostaticOptions,
    HomeostaticOutcome, NeuralPlasticityMetrics, PeerReport, PlasticityChange, StdpOutcome,
};
use super::rules::{self, LtdContext, LtpContext};
use super::state::{CausalityEvent, PlasticityEventKind, PlasticityState};
use crate::cancel::CancelToken;
use crate::clock::{lookback, millis_between, Clock};
use crate::config::PlasticityOptions;
use crate::error::{ConfigError, CoordinatorError};

/// Coherence moves this far toward each delivery's quality
const COHERENCE_EMA_ALPHA: f64 = 0.1;

type SharedState = Arc<Mutex<PlasticityState>>;

/// Owns per-peer plasticity state and applies the LTP/LTD/STDP/homeostatic
/// rules to it.
///
/// Each peer's state sits behind its own mutex, so mutations of one peer are
/// serialized while different peers proceed in parallel. Mutating operations
/// first take a slot of the admission semaphore shared with the peering
/// manager.
pub struct PlasticityCoordinator {
    defaults: PlasticityOptions,
    peers: RwLock<HashMap<String, SharedState>>,
    admission: Arc<Semaphore>,
    clock: Arc<dyn Clock>,
    last_metrics: Mutex<Option<NeuralPlasticityMetrics>>,
}

fn lock(state: &SharedState) -> MutexGuard<'_, PlasticityState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl PlasticityCoordinator {
    pub fn new(
        defaults: PlasticityOptions,
        admission: Arc<Semaphore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            defaults,
            peers: RwLock::new(HashMap::new()),
            admission,
            clock,
            last_metrics: Mutex::new(None),
        }
    }

    pub fn defaults(&self) -> &PlasticityOptions {
        &self.defaults
    }

    async fn admit(&self, cancel: &CancelToken) -> Result<SemaphorePermit<'_>, CoordinatorError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
            permit = self.admission.acquire() => permit.map_err(|_| CoordinatorError::AdmissionClosed),
        }
    }

    fn get(&self, peer_id: &str) -> Option<SharedState> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .cloned()
    }

    fn get_or_track(&self, peer_id: &str) -> SharedState {
        if let Some(state) = self.get(peer_id) {
            return state;
        }
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                debug!(peer_id = %peer_id, "tracking previously unknown peer");
                Arc::new(Mutex::new(PlasticityState::new(
                    peer_id,
                    self.defaults.clone(),
                    self.defaults.initial_coherence,
                    self.clock.now(),
                )))
            })
            .clone()
    }

    fn require(&self, peer_id: &str) -> Result<SharedState, CoordinatorError> {
        self.get(peer_id)
            .ok_or_else(|| CoordinatorError::UnknownPeer(peer_id.to_string()))
    }

    /// Validate `options` against the biological ranges and start tracking
    /// `peer_id`, replacing any previous state.
    pub async fn initialize_peering(
        &self,
        peer_id: &str,
        options: &PlasticityOptions,
        cancel: &CancelToken,
    ) -> Result<(), CoordinatorError> {
        options.validate()?;
        let _permit = self.admit(cancel).await?;
        self.register(peer_id, options, options.initial_coherence)?;
        Ok(())
    }

    /// Synchronous registration used by callers already holding an admission
    /// slot. No await point, so it cannot be interrupted half-way.
    pub(crate) fn register(
        &self,
        peer_id: &str,
        options: &PlasticityOptions,
        coherence: f64,
    ) -> Result<(), ConfigError> {
        options.validate()?;
        let state = PlasticityState::new(peer_id, options.clone(), coherence, self.clock.now());
        info!(
            peer_id = %peer_id,
            strength = state.strength(),
            coherence = state.coherence(),
            "plasticity tracking initialized"
        );
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id.to_string(), Arc::new(Mutex::new(state)));
        Ok(())
    }

    pub fn is_tracked(&self, peer_id: &str) -> bool {
        self.get(peer_id).is_some()
    }

    pub fn tracked_peers(&self) -> Vec<String> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn strength(&self, peer_id: &str) -> Option<f64> {
        self.get(peer_id).map(|s| lock(&s).strength())
    }

    pub fn coherence(&self, peer_id: &str) -> Option<f64> {
        self.get(peer_id).map(|s| lock(&s).coherence())
    }

    /// Drop all state for a peer
    pub fn forget(&self, peer_id: &str) -> bool {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .is_some()
    }

    /// Stop tracking every peer that `keep` rejects and whose newest event is
    /// older than `cutoff`. Returns the peers dropped.
    pub fn prune<F>(&self, cutoff: DateTime<Utc>, keep: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut dropped = Vec::new();
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|peer_id, shared| {
                if keep(peer_id) || lock(shared).last_event_at() >= cutoff {
                    return true;
                }
                dropped.push(peer_id.clone());
                false
            });
        if !dropped.is_empty() {
            debug!(peers = dropped.len(), "pruned idle plasticity state");
        }
        dropped.sort();
        dropped
    }

    /// Long-term potentiation. A timing outside the LTP window is recorded as
    /// a timing violation and, when enforcement is on, leaves strength alone.
    pub async fn apply_ltp(
        &self,
        peer_id: &str,
        ctx: LtpContext,
        cancel: &CancelToken,
    ) -> Result<PlasticityChange, CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let shared = self.require(peer_id)?;
        let now = self.clock.now();
        let mut state = lock(&shared);
        let old = state.strength();
        let opts = &state.options;
        let in_window = rules::within_window(ctx.timing_ms, opts.ltp_window_min_ms, opts.ltp_window_max_ms);

        if !in_window && opts.enforce_timing {
            let description = format!(
                "LTP timing {:.2} ms outside [{}, {}] ms",
                ctx.timing_ms, opts.ltp_window_min_ms, opts.ltp_window_max_ms
            );
            debug!(peer_id = %peer_id, timing_ms = ctx.timing_ms, "LTP timing violation");
            state.record(PlasticityEventKind::TimingViolation, now, old, false, description);
            return Ok(PlasticityChange {
                kind: PlasticityEventKind::TimingViolation,
                old_strength: old,
                new_strength: old,
                applied: false,
            });
        }

        let delta = rules::ltp_delta(&ctx);
        let description = format!("LTP +{:.4} at {:.2} ms", delta, ctx.timing_ms);
        let new = state.record(PlasticityEventKind::Ltp, now, old + delta, in_window, description);
        state.last_ltp = Some(now);
        debug!(peer_id = %peer_id, old, new, "LTP applied");
        Ok(PlasticityChange {
            kind: PlasticityEventKind::Ltp,
            old_strength: old,
            new_strength: new,
            applied: true,
        })
    }

    /// Long-term depression. Unknown peers are tracked on first use so every
    /// failure leaves a trace. Errors also erode coherence.
    pub async fn apply_ltd(
        &self,
        peer_id: &str,
        ctx: LtdContext,
        cancel: &CancelToken,
    ) -> Result<PlasticityChange, CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let shared = self.get_or_track(peer_id);
        let now = self.clock.now();
        let mut state = lock(&shared);
        let old = state.strength();
        let opts = &state.options;
        let in_window = rules::within_window(ctx.timing_ms, opts.ltd_window_min_ms, opts.ltd_window_max_ms);

        if !in_window && opts.enforce_timing {
            let description = format!(
                "LTD timing {:.2} ms outside [{}, {}] ms",
                ctx.timing_ms, opts.ltd_window_min_ms, opts.ltd_window_max_ms
            );
            debug!(peer_id = %peer_id, timing_ms = ctx.timing_ms, "LTD timing violation");
            state.record(PlasticityEventKind::TimingViolation, now, old, false, description);
            return Ok(PlasticityChange {
                kind: PlasticityEventKind::TimingViolation,
                old_strength: old,
                new_strength: old,
                applied: false,
            });
        }

        let decayed = state.coherence() * (1.0 - COHERENCE_EMA_ALPHA * ctx.error_rate.clamp(0.0, 1.0));
        state.set_coherence(decayed);
        let delta = rules::ltd_delta(&ctx);
        let description = format!("LTD -{:.4} at {:.2} ms", delta, ctx.timing_ms);
        let new = state.record(PlasticityEventKind::Ltd, now, old - delta, in_window, description);
        state.last_ltd = Some(now);
        debug!(peer_id = %peer_id, old, new, "LTD applied");
        Ok(PlasticityChange {
            kind: PlasticityEventKind::Ltd,
            old_strength: old,
            new_strength: new,
            applied: true,
        })
    }

    /// Append a pre-synaptic event for `peer_id`
    pub async fn record_pre_synaptic(
        &self,
        peer_id: &str,
        at: DateTime<Utc>,
        magnitude: f64,
        cancel: &CancelToken,
    ) -> Result<(), CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let shared = self.require(peer_id)?;
        lock(&shared).push_causality(CausalityEvent::pre(at, magnitude));
        Ok(())
    }

    /// Append a post-synaptic event, fold its magnitude into coherence, and
    /// evaluate causality against the immediately preceding event. Append
    /// and evaluation happen under one lock so no other event can slip in
    /// between.
    pub async fn record_post_synaptic(
        &self,
        peer_id: &str,
        at: DateTime<Utc>,
        magnitude: f64,
        cancel: &CancelToken,
    ) -> Result<Option<StdpOutcome>, CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let shared = self.require(peer_id)?;
        let now = self.clock.now();
        let mut state = lock(&shared);
        state.push_causality(CausalityEvent::post(at, magnitude));
        let coherence = (1.0 - COHERENCE_EMA_ALPHA) * state.coherence()
            + COHERENCE_EMA_ALPHA * magnitude.clamp(0.0, 1.0);
        state.set_coherence(coherence);

        Ok(state
            .last_causality_pair()
            .map(|(pre, post)| Self::evaluate_stdp(&mut state, pre, post, now)))
    }

    /// Evaluate one pre/post pair. Valid iff `0 < post - pre <= window`.
    pub async fn enforce_stdp_causality(
        &self,
        peer_id: &str,
        pre: CausalityEvent,
        post: CausalityEvent,
        cancel: &CancelToken,
    ) -> Result<StdpOutcome, CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let shared = self.require(peer_id)?;
        let now = self.clock.now();
        let mut state = lock(&shared);
        Ok(Self::evaluate_stdp(&mut state, pre, post, now))
    }

    fn evaluate_stdp(
        state: &mut PlasticityState,
        pre: CausalityEvent,
        post: CausalityEvent,
        now: DateTime<Utc>,
    ) -> StdpOutcome {
        let gap_ms = millis_between(pre.timestamp, post.timestamp);
        let window = state.options.stdp_causality_window_ms;
        let avg_magnitude = (pre.magnitude + post.magnitude) / 2.0;
        let old = state.strength();

        if rules::is_causal(gap_ms, window) {
            let delta = rules::stdp_potentiation(gap_ms, window, avg_magnitude);
            let description = format!("causal pair {:.3} ms apart, +{:.5}", gap_ms, delta);
            let new = state.record(PlasticityEventKind::Stdp, now, old + delta, true, description);
            return StdpOutcome {
                causal: true,
                gap_ms,
                old_strength: old,
                new_strength: new,
            };
        }

        let target = if state.options.enforce_causality {
            old
        } else {
            old + rules::stdp_depression(gap_ms, window, avg_magnitude)
        };
        let description = format!("causality violation: post {:.3} ms after pre", gap_ms);
        warn!(peer_id = %state.peer_id, gap_ms, "STDP causality violation");
        let new = state.record(PlasticityEventKind::StdpViolation, now, target, false, description);
        StdpOutcome {
            causal: false,
            gap_ms,
            old_strength: old,
            new_strength: new,
        }
    }

    /// Aggregate event counts and means across every tracked peer.
    pub fn monitor_metrics(&self) -> NeuralPlasticityMetrics {
        let states: Vec<SharedState> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let snapshots: Vec<PlasticityState> = states.iter().map(|s| lock(s).clone()).collect();
        let metrics = NeuralPlasticityMetrics::aggregate(snapshots.iter());
        *self.last_metrics.lock().unwrap_or_else(|e| e.into_inner()) = Some(metrics.clone());
        metrics
    }

    /// Most recent result of [`monitor_metrics`](Self::monitor_metrics)
    pub fn last_metrics(&self) -> Option<NeuralPlasticityMetrics> {
        self.last_metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Recompute each peer's coherence from its recent history and report
    /// peers that fall below their threshold.
    pub async fn validate_coherence(
        &self,
        peer_ids: &[String],
        cancel: &CancelToken,
    ) -> Result<CoherenceValidation, CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let now = self.clock.now();
        let mut validation = CoherenceValidation::default();
        let mut incoherent = Vec::new();

        for peer_id in peer_ids {
            let Some(shared) = self.get(peer_id) else {
                debug!(peer_id = %peer_id, "skipping coherence check for untracked peer");
                continue;
            };
            let mut state = lock(&shared);
            let cutoff = lookback(now, state.options.coherence_window_secs);

            let mut total = 0usize;
            let mut compliant = 0usize;
            let mut violations = 0usize;
            let mut coherence_sum = 0.0;
            for event in state.events_since(cutoff) {
                total += 1;
                coherence_sum += event.coherence;
                if event.biologically_compliant {
                    compliant += 1;
                }
                if matches!(
                    event.kind,
                    PlasticityEventKind::StdpViolation | PlasticityEventKind::TimingViolation
                ) {
                    violations += 1;
                }
            }

            let coherence = if total == 0 {
                state.coherence()
            } else {
                rules::window_coherence(
                    coherence_sum / total as f64,
                    compliant as f64 / total as f64,
                    violations,
                )
            };
            state.set_coherence(coherence);
            validation.peer_coherence.insert(peer_id.clone(), coherence);

            let threshold = state.options.coherence_threshold;
            if coherence < threshold {
                validation.violations.push(CoherenceViolation {
                    peer_id: peer_id.clone(),
                    coherence,
                    threshold,
                    severity: threshold - coherence,
                });
                validation.recommended_actions.push(CorrectiveAction::Resynchronize {
                    peer_id: peer_id.clone(),
                });
                incoherent.push(peer_id.clone());
            }
        }

        if !incoherent.is_empty() {
            warn!(peers = incoherent.len(), "coherence below threshold");
            validation
                .recommended_actions
                .push(CorrectiveAction::HomeostaticScaling { peer_ids: incoherent });
        }
        Ok(validation)
    }

    /// Rescale every listed peer's strength when the population's average
    /// activity strays from the target by more than the tolerance.
    pub async fn apply_homeostatic_scaling(
        &self,
        peer_ids: &[String],
        options: HomeostaticOptions,
        cancel: &CancelToken,
    ) -> Result<HomeostaticOutcome, CoordinatorError> {
        let _permit = self.admit(cancel).await?;
        let now = self.clock.now();
        let states: Vec<SharedState> = peer_ids.iter().filter_map(|id| self.get(id)).collect();

        let mut outcome = HomeostaticOutcome {
            observed_activity: 0.0,
            target_activity: options.target_activity,
            scaling_factor: 1.0,
            applied: false,
            peers_scaled: 0,
        };
        if states.is_empty() {
            return Ok(outcome);
        }

        outcome.observed_activity =
            states.iter().map(|s| lock(s).activity(now)).sum::<f64>() / states.len() as f64;

        let Some(factor) = rules::homeostatic_factor(
            outcome.observed_activity,
            options.target_activity,
            options.tolerance,
            options.min_scaling,
            options.max_scaling,
        ) else {
            return Ok(outcome);
        };

        for shared in &states {
            let mut state = lock(shared);
            let old = state.strength();
            let description = format!(
                "homeostatic scaling x{:.3} (activity {:.3} vs target {:.3})",
                factor, outcome.observed_activity, options.target_activity
            );
            state.record(PlasticityEventKind::HomeostaticScaling, now, old * factor, true, description);
        }
        outcome.scaling_factor = factor;
        outcome.applied = true;
        outcome.peers_scaled = states.len();
        info!(
            factor,
            observed = outcome.observed_activity,
            target = options.target_activity,
            peers = outcome.peers_scaled,
            "homeostatic scaling applied"
        );
        Ok(outcome)
    }

    /// Replay a peer's history into a report
    pub fn peer_report(&self, peer_id: &str) -> PeerReport {
        match self.get(peer_id) {
            Some(shared) => PeerReport::from_state(&lock(&shared)),
            None => PeerReport::empty(peer_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::plasticity::state::CausalityKind;

    fn setup(options: PlasticityOptions) -> (PlasticityCoordinator, ManualClock) {
        let clock = ManualClock::default();
        let coordinator =
            PlasticityCoordinator::new(options, Arc::new(Semaphore::new(4)), Arc::new(clock.clone()));
        (coordinator, clock)
    }

    fn reference_ltp() -> LtpContext {
        LtpContext {
            usage_frequency: 0.8,
            coherence: 0.9,
            timing_precision: 1.0,
            sustained_duration_ms: 10_000.0,
            timing_ms: 10.0,
        }
    }

    fn ltd_ctx() -> LtdContext {
        LtdContext {
            error_rate: 1.0,
            timing_ms: 15.0,
            ..Default::default()
        }
    }

    async fn tracked(options: PlasticityOptions) -> (PlasticityCoordinator, ManualClock, CancelToken) {
        let (coordinator, clock) = setup(options.clone());
        let cancel = CancelToken::new();
        coordinator
            .initialize_peering("peer", &options, &cancel)
            .await
            .unwrap();
        (coordinator, clock, cancel)
    }

    #[tokio::test]
    async fn test_initialize_rejects_out_of_range_windows() {
        let (coordinator, _) = setup(PlasticityOptions::default());
        let cancel = CancelToken::new();
        let mut options = PlasticityOptions::default();
        options.ltp_window_max_ms = 20.0;

        let err = coordinator
            .initialize_peering("peer", &options, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Configuration(_)));
        assert!(!coordinator.is_tracked("peer"));
    }

    #[tokio::test]
    async fn test_ltp_reference_scenario() {
        let (coordinator, _, cancel) = tracked(PlasticityOptions::default()).await;

        let change = coordinator
            .apply_ltp("peer", reference_ltp(), &cancel)
            .await
            .unwrap();
        assert!(change.applied);
        assert!(change.new_strength > 1.0);
        assert!(change.new_strength <= 1.1);
        assert_eq!(coordinator.strength("peer"), Some(change.new_strength));
    }

    #[tokio::test]
    async fn test_ltp_outside_window_is_noop() {
        let (coordinator, _, cancel) = tracked(PlasticityOptions::default()).await;

        for timing in [2.0, 4.9, 15.1, 40.0] {
            let mut ctx = reference_ltp();
            ctx.timing_ms = timing;
            let change = coordinator.apply_ltp("peer", ctx, &cancel).await.unwrap();
            assert!(!change.applied);
            assert_eq!(change.new_strength, change.old_strength);
        }
        assert_eq!(coordinator.strength("peer"), Some(1.0));

        let report = coordinator.peer_report("peer");
        assert_eq!(report.counts.ltp, 0);
        assert_eq!(report.counts.timing_violations, 4);
    }

    #[tokio::test]
    async fn test_ltp_outside_window_applies_without_enforcement() {
        let mut options = PlasticityOptions::default();
        options.enforce_timing = false;
        let (coordinator, _, cancel) = tracked(options).await;

        let mut ctx = reference_ltp();
        ctx.timing_ms = 40.0;
        let change = coordinator.apply_ltp("peer", ctx, &cancel).await.unwrap();
        assert!(change.applied);
        assert!(change.new_strength > 1.0);
        let report = coordinator.peer_report("peer");
        assert!(!report.ltp_events[0].biologically_compliant);
    }

    #[tokio::test]
    async fn test_ltp_unknown_peer() {
        let (coordinator, _) = setup(PlasticityOptions::default());
        let err = coordinator
            .apply_ltp("ghost", reference_ltp(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_ltd_decreases_and_clamps() {
        let (coordinator, _, cancel) = tracked(PlasticityOptions::default()).await;

        let change = coordinator.apply_ltd("peer", ltd_ctx(), &cancel).await.unwrap();
        assert!(change.applied);
        assert!((change.new_strength - 0.8).abs() < 1e-9);

        for _ in 0..20 {
            coordinator.apply_ltd("peer", ltd_ctx(), &cancel).await.unwrap();
        }
        assert_eq!(coordinator.strength("peer"), Some(0.1));
        assert!(coordinator.coherence("peer").unwrap() < 1.0);
    }

    #[tokio::test]
    async fn test_ltd_outside_window_is_noop() {
        let (coordinator, _, cancel) = tracked(PlasticityOptions::default()).await;
        let mut ctx = ltd_ctx();
        ctx.timing_ms = 5.0;
        let change = coordinator.apply_ltd("peer", ctx, &cancel).await.unwrap();
        assert!(!change.applied);
        assert_eq!(coordinator.strength("peer"), Some(1.0));
    }

    #[tokio::test]
    async fn test_ltd_tracks_unknown_peer() {
        let (coordinator, _) = setup(PlasticityOptions::default());
        coordinator
            .apply_ltd("stranger", ltd_ctx(), &CancelToken::new())
            .await
            .unwrap();
        assert!(coordinator.is_tracked("stranger"));
        assert_eq!(coordinator.peer_report("stranger").counts.ltd, 1);
    }

    #[tokio::test]
    async fn test_stdp_causal_pair_strengthens() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();
        let pre = CausalityEvent::pre(t0, 1.0);
        let post = CausalityEvent::post(t0 + chrono::Duration::milliseconds(10), 1.0);

        let outcome = coordinator
            .enforce_stdp_causality("peer", pre, post, &cancel)
            .await
            .unwrap();
        assert!(outcome.causal);
        assert!(outcome.new_strength > outcome.old_strength);
        assert!((outcome.gap_ms - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_stdp_reversed_pair_is_violation() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();

        for gap in [0i64, -1, -50, -100_000] {
            let pre = CausalityEvent::pre(t0, 1.0);
            let post = CausalityEvent::post(t0 + chrono::Duration::milliseconds(gap), 1.0);
            let outcome = coordinator
                .enforce_stdp_causality("peer", pre, post, &cancel)
                .await
                .unwrap();
            assert!(!outcome.causal, "gap {} must not be causal", gap);
            assert_eq!(outcome.new_strength, outcome.old_strength);
        }
        let report = coordinator.peer_report("peer");
        assert_eq!(report.counts.stdp_violations, 4);
        assert_eq!(report.stdp_compliance_rate, 0.0);
    }

    #[tokio::test]
    async fn test_stdp_violation_depresses_without_enforcement() {
        let mut options = PlasticityOptions::default();
        options.enforce_causality = false;
        let (coordinator, clock, cancel) = tracked(options).await;
        let t0 = clock.now();
        let pre = CausalityEvent::pre(t0, 1.0);
        let post = CausalityEvent::post(t0 - chrono::Duration::milliseconds(5), 1.0);

        let outcome = coordinator
            .enforce_stdp_causality("peer", pre, post, &cancel)
            .await
            .unwrap();
        assert!(!outcome.causal);
        assert!(outcome.new_strength < outcome.old_strength);
    }

    #[tokio::test]
    async fn test_stdp_gap_beyond_window() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();
        let outcome = coordinator
            .enforce_stdp_causality(
                "peer",
                CausalityEvent::pre(t0, 1.0),
                CausalityEvent::post(t0 + chrono::Duration::milliseconds(150), 1.0),
                &cancel,
            )
            .await
            .unwrap();
        assert!(!outcome.causal);
    }

    #[tokio::test]
    async fn test_post_synaptic_uses_preceding_event() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();

        coordinator
            .record_pre_synaptic("peer", t0, 0.9, &cancel)
            .await
            .unwrap();
        let outcome = coordinator
            .record_post_synaptic("peer", t0 + chrono::Duration::milliseconds(3), 0.9, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.causal);
        assert!((outcome.gap_ms - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_first_post_synaptic_has_no_pair() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let outcome = coordinator
            .record_post_synaptic("peer", clock.now(), 1.0, &cancel)
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_post_synaptic_moves_coherence_toward_quality() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        coordinator
            .record_post_synaptic("peer", clock.now(), 0.0, &cancel)
            .await
            .unwrap();
        assert!((coordinator.coherence("peer").unwrap() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_strength_stays_bounded_under_mixed_operations() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let mut ltp = reference_ltp();
        ltp.usage_frequency = 1.0;
        ltp.coherence = 1.0;

        for round in 0..200 {
            if round % 3 == 0 {
                coordinator.apply_ltd("peer", ltd_ctx(), &cancel).await.unwrap();
            } else {
                coordinator.apply_ltp("peer", ltp, &cancel).await.unwrap();
            }
            if round % 50 == 0 {
                clock.advance_ms(1);
                coordinator
                    .apply_homeostatic_scaling(
                        &["peer".to_string()],
                        HomeostaticOptions::default(),
                        &cancel,
                    )
                    .await
                    .unwrap();
            }
            let strength = coordinator.strength("peer").unwrap();
            assert!((0.1..=5.0).contains(&strength), "strength {} escaped bounds", strength);
        }
    }

    #[tokio::test]
    async fn test_homeostatic_downscales_overactive_network() {
        let mut options = PlasticityOptions::default();
        options.activity_saturation_events = 10;
        let (coordinator, clock) = setup(options.clone());
        let cancel = CancelToken::new();
        let peers = vec!["a".to_string(), "b".to_string()];
        for peer in &peers {
            coordinator.initialize_peering(peer, &options, &cancel).await.unwrap();
            // 9 of 10 saturation events -> activity 0.9
            for _ in 0..9 {
                coordinator
                    .record_pre_synaptic(peer, clock.now(), 1.0, &cancel)
                    .await
                    .unwrap();
            }
        }

        let outcome = coordinator
            .apply_homeostatic_scaling(&peers, HomeostaticOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(outcome.applied);
        assert!((outcome.observed_activity - 0.9).abs() < 1e-9);
        assert!(outcome.scaling_factor < 1.0);
        assert_eq!(outcome.peers_scaled, 2);
        for peer in &peers {
            assert!(coordinator.strength(peer).unwrap() < 1.0);
        }
    }

    #[tokio::test]
    async fn test_homeostatic_within_tolerance_does_nothing() {
        let mut options = PlasticityOptions::default();
        options.activity_saturation_events = 10;
        let (coordinator, clock) = setup(options.clone());
        let cancel = CancelToken::new();
        coordinator.initialize_peering("a", &options, &cancel).await.unwrap();
        for _ in 0..6 {
            coordinator
                .record_pre_synaptic("a", clock.now(), 1.0, &cancel)
                .await
                .unwrap();
        }

        let outcome = coordinator
            .apply_homeostatic_scaling(&["a".to_string()], HomeostaticOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.scaling_factor, 1.0);
        assert_eq!(coordinator.strength("a"), Some(1.0));
    }

    #[tokio::test]
    async fn test_homeostatic_with_no_peers() {
        let (coordinator, _) = setup(PlasticityOptions::default());
        let outcome = coordinator
            .apply_homeostatic_scaling(&[], HomeostaticOptions::default(), &CancelToken::new())
            .await
            .unwrap();
        assert!(!outcome.applied);
        assert_eq!(outcome.peers_scaled, 0);
    }

    #[tokio::test]
    async fn test_validate_coherence_flags_violating_peer() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();
        for _ in 0..3 {
            coordinator
                .enforce_stdp_causality(
                    "peer",
                    CausalityEvent::pre(t0, 1.0),
                    CausalityEvent::post(t0, 1.0),
                    &cancel,
                )
                .await
                .unwrap();
        }

        let validation = coordinator
            .validate_coherence(&["peer".to_string(), "ghost".to_string()], &cancel)
            .await
            .unwrap();
        assert!(!validation.is_coherent());
        assert_eq!(validation.violations.len(), 1);
        let violation = &validation.violations[0];
        assert_eq!(violation.peer_id, "peer");
        assert!((violation.severity - (violation.threshold - violation.coherence)).abs() < 1e-12);
        assert!(validation
            .recommended_actions
            .contains(&CorrectiveAction::Resynchronize { peer_id: "peer".to_string() }));
        assert!(!validation.peer_coherence.contains_key("ghost"));
        assert_eq!(coordinator.coherence("peer"), Some(violation.coherence));
    }

    #[tokio::test]
    async fn test_validate_coherence_ignores_old_events() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();
        coordinator
            .enforce_stdp_causality(
                "peer",
                CausalityEvent::pre(t0, 1.0),
                CausalityEvent::post(t0, 1.0),
                &cancel,
            )
            .await
            .unwrap();
        clock.advance(std::time::Duration::from_secs(11 * 60));

        let validation = coordinator
            .validate_coherence(&["peer".to_string()], &cancel)
            .await
            .unwrap();
        assert!(validation.is_coherent());
        assert_eq!(validation.peer_coherence["peer"], 1.0);
    }

    #[tokio::test]
    async fn test_monitor_metrics_counts_by_type() {
        let (coordinator, _, cancel) = tracked(PlasticityOptions::default()).await;
        coordinator.apply_ltp("peer", reference_ltp(), &cancel).await.unwrap();
        coordinator.apply_ltd("peer", ltd_ctx(), &cancel).await.unwrap();
        coordinator.apply_ltd("other", ltd_ctx(), &cancel).await.unwrap();

        let metrics = coordinator.monitor_metrics();
        assert_eq!(metrics.tracked_peers, 2);
        assert_eq!(metrics.ltp_events, 1);
        assert_eq!(metrics.ltd_events, 2);
        assert!(metrics.average_strength > 0.0);
        assert_eq!(metrics.biological_timing_compliance, 1.0);
        assert!(coordinator.last_metrics().is_some());
    }

    #[tokio::test]
    async fn test_report_round_trip_counts() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        let t0 = clock.now();
        for _ in 0..4 {
            coordinator.apply_ltp("peer", reference_ltp(), &cancel).await.unwrap();
        }
        for _ in 0..3 {
            coordinator.apply_ltd("peer", ltd_ctx(), &cancel).await.unwrap();
        }
        for i in 1..=2 {
            coordinator
                .enforce_stdp_causality(
                    "peer",
                    CausalityEvent::pre(t0, 1.0),
                    CausalityEvent::post(t0 + chrono::Duration::milliseconds(i), 1.0),
                    &cancel,
                )
                .await
                .unwrap();
        }
        coordinator
            .apply_homeostatic_scaling(&["peer".to_string()], HomeostaticOptions::default(), &cancel)
            .await
            .unwrap();

        let report = coordinator.peer_report("peer");
        assert_eq!(report.ltp_events.len(), 4);
        assert_eq!(report.counts.ltp, 4);
        assert_eq!(report.ltd_events.len(), 3);
        assert_eq!(report.counts.stdp, 2);
        assert_eq!(report.homeostatic_events.len(), 1);
        assert_eq!(report.stdp_compliance_rate, 1.0);
    }

    #[tokio::test]
    async fn test_report_for_unknown_peer() {
        let (coordinator, _) = setup(PlasticityOptions::default());
        let report = coordinator.peer_report("ghost");
        assert_eq!(report.current_strength, 1.0);
        assert_eq!(report.stdp_compliance_rate, 1.0);
    }

    #[tokio::test]
    async fn test_cancelled_operation_releases_nothing_and_mutates_nothing() {
        let clock = ManualClock::default();
        let admission = Arc::new(Semaphore::new(1));
        let coordinator = PlasticityCoordinator::new(
            PlasticityOptions::default(),
            admission.clone(),
            Arc::new(clock),
        );
        let cancel = CancelToken::new();
        coordinator
            .initialize_peering("peer", &PlasticityOptions::default(), &cancel)
            .await
            .unwrap();

        let held = admission.clone().acquire_owned().await.unwrap();
        let blocked = CancelToken::new();
        blocked.cancel();
        let err = coordinator
            .apply_ltp("peer", reference_ltp(), &blocked)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Cancelled));
        drop(held);

        assert_eq!(admission.available_permits(), 1);
        assert_eq!(coordinator.strength("peer"), Some(1.0));
    }

    #[tokio::test]
    async fn test_closed_admission() {
        let admission = Arc::new(Semaphore::new(1));
        let coordinator = PlasticityCoordinator::new(
            PlasticityOptions::default(),
            admission.clone(),
            Arc::new(ManualClock::default()),
        );
        admission.close();
        let err = coordinator
            .initialize_peering("peer", &PlasticityOptions::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AdmissionClosed));
    }

    #[tokio::test]
    async fn test_forget_and_causality_kinds() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        coordinator
            .record_pre_synaptic("peer", clock.now(), 0.5, &cancel)
            .await
            .unwrap();
        let shared = coordinator.get("peer").unwrap();
        let kinds: Vec<CausalityKind> = lock(&shared).causality().map(|e| e.kind).collect();
        drop(shared);
        assert_eq!(kinds, vec![CausalityKind::PreSynaptic]);
        assert!(coordinator.forget("peer"));
        assert!(!coordinator.is_tracked("peer"));
    }

    #[tokio::test]
    async fn test_prune_drops_only_quiet_unkept_peers() {
        let (coordinator, clock, cancel) = tracked(PlasticityOptions::default()).await;
        coordinator.apply_ltd("quiet", ltd_ctx(), &cancel).await.unwrap();
        coordinator.apply_ltd("kept", ltd_ctx(), &cancel).await.unwrap();

        clock.advance(std::time::Duration::from_secs(600));
        coordinator
            .record_pre_synaptic("peer", clock.now(), 0.5, &cancel)
            .await
            .unwrap();
        let cutoff = clock.now() - chrono::Duration::seconds(300);

        let dropped = coordinator.prune(cutoff, |peer| peer == "kept");
        assert_eq!(dropped, vec!["quiet".to_string()]);
        assert!(coordinator.is_tracked("peer"));
        assert!(coordinator.is_tracked("kept"));
        assert!(coordinator.prune(cutoff, |_| false).contains(&"kept".to_string()));
        assert!(coordinator.is_tracked("peer"));
    }
}
