// Copyright 2025 Tierguard Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Admission Engine
//!
//! Owns every piece of admission state in one structure: registry, buckets,
//! concurrency, queues, fairness, gate and controller. Each operation takes
//! the current `Instant` and queues its outbound events in an outbox the
//! host drains with [`AdmissionEngine::take_outbound`].
//!
//! ## Check order
//!
//! An arrival stops at the first failing check:
//!
//! 1. duplicate id (re-query, never double counted)
//! 2. tier resolution (fails closed with `config_error`)
//! 3. system gate
//! 4. token bucket
//! 5. concurrency (queue)
//! 6. tenant fairness (queue)
//! 7. degrade and admit

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::bucket::{bucket_params, BucketLimiter, TokenBucket};
use crate::concurrency::{ConcurrencyTracker, InFlight, ProcessingEstimator};
use crate::controller::{validate_target, ControllerConfig, FeedbackController};
use crate::degrade::{degrade, degrade_hint, DegradeRules};
use crate::error::{Result, TierguardError};
use crate::event::{
    AdmissionDecision, CompletionSignal, Decision, Inbound, Outbound, PolicyUpdate, QueueSnapshot,
    RateUpdated, Reason, RequestArrived, RetryAction, ShedAdvice, ShedEvent, SystemStateChange,
    TelemetrySample,
};
use crate::fairness::{FairnessConfig, FairnessGovernor};
use crate::gate::{SystemMode, SystemState};
use crate::queue::{QueueEntry, WeightedFairQueue};
use crate::stats::EngineCounters;
use crate::tier::{ParamMap, RouteKey, Tier, TierRegistry};

/// Where a request stands in the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Arrived,
    SystemBlocked,
    RateLimited,
    ConcurrencyQueued,
    FairnessQueued,
    Admitted,
    Shed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionEvent {
    GateBlocked,
    RateDenied,
    ConcurrencyFull,
    OverFairShare,
    Admit,
    Shed,
}

impl AdmissionState {
    pub fn transition(self, event: AdmissionEvent) -> Result<AdmissionState> {
        use AdmissionEvent as E;
        use AdmissionState as S;

        let next = match (self, event) {
            (S::Arrived, E::GateBlocked) => S::SystemBlocked,
            (S::Arrived, E::RateDenied) => S::RateLimited,
            (S::Arrived, E::ConcurrencyFull) => S::ConcurrencyQueued,
            (S::Arrived, E::OverFairShare) => S::FairnessQueued,
            (S::Arrived | S::ConcurrencyQueued | S::FairnessQueued, E::Admit) => S::Admitted,
            (
                S::Arrived
                | S::SystemBlocked
                | S::RateLimited
                | S::ConcurrencyQueued
                | S::FairnessQueued,
                E::Shed,
            ) => S::Shed,
            (from, event) => return Err(TierguardError::InvalidTransition { from, event }),
        };
        Ok(next)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AdmissionState::Admitted | AdmissionState::Shed)
    }

    fn queued_for(reason: Reason) -> Self {
        match reason {
            Reason::Fairness => AdmissionState::FairnessQueued,
            _ => AdmissionState::ConcurrencyQueued,
        }
    }
}

/// Engine tunables. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_share_pct_per_tenant: f64,
    pub fairness_window_secs: u64,
    /// Admissions needed in a window before fairness is enforced
    pub fairness_min_requests: u64,
    pub aging_half_life_secs: f64,
    /// Processing estimate before any completion is observed
    pub default_processing_ms: f64,
    pub leak_timeout_ms: u64,
    pub gate_retry_after_ms: u64,
    /// Emit a queue snapshot every N ticks (0 disables)
    pub snapshot_every_ticks: u64,
    pub controller: ControllerConfig,
    pub degrade: DegradeRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_share_pct_per_tenant: 50.0,
            fairness_window_secs: 60,
            fairness_min_requests: 20,
            aging_half_life_secs: 5.0,
            default_processing_ms: 100.0,
            leak_timeout_ms: 60_000,
            gate_retry_after_ms: 5_000,
            snapshot_every_ticks: 10,
            controller: ControllerConfig::default(),
            degrade: DegradeRules::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let share = self.max_share_pct_per_tenant;
        if !(share > 0.0 && share <= 100.0) {
            return Err(TierguardError::invalid_policy(
                "max_share_pct_per_tenant must be in (0, 100]",
            ));
        }
        if self.fairness_window_secs == 0 {
            return Err(TierguardError::invalid_policy(
                "fairness_window_secs must be positive",
            ));
        }
        if !self.aging_half_life_secs.is_finite() || self.aging_half_life_secs <= 0.0 {
            return Err(TierguardError::invalid_policy(
                "aging_half_life_secs must be positive",
            ));
        }
        if !self.default_processing_ms.is_finite() || self.default_processing_ms <= 0.0 {
            return Err(TierguardError::invalid_policy(
                "default_processing_ms must be positive",
            ));
        }
        if self.leak_timeout_ms == 0 {
            return Err(TierguardError::invalid_policy(
                "leak_timeout_ms must be positive",
            ));
        }
        if let Some(rule) = self.degrade.rules.iter().find(|r| !r.floor.is_finite()) {
            return Err(TierguardError::invalid_policy(format!(
                "degrade floor for {:?} must be finite",
                rule.param
            )));
        }
        self.controller.validate()
    }

    fn fairness(&self) -> FairnessConfig {
        FairnessConfig {
            max_share_pct: self.max_share_pct_per_tenant,
            window: Duration::from_secs(self.fairness_window_secs),
            min_requests: self.fairness_min_requests,
        }
    }
}

pub struct AdmissionEngine {
    config: EngineConfig,
    registry: Arc<TierRegistry>,
    system: SystemState,
    buckets: BucketLimiter,
    concurrency: ConcurrencyTracker,
    processing: ProcessingEstimator,
    queue: WeightedFairQueue,
    fairness: FairnessGovernor,
    controller: FeedbackController,
    counters: EngineCounters,
    outbox: Vec<Outbound>,
    last_tick: Option<Instant>,
    ticks_since_snapshot: u64,
}

impl AdmissionEngine {
    /// Build an engine from configuration and the initial policy (version 1).
    pub fn new(config: EngineConfig, policy: PolicyUpdate, now: Instant) -> Result<Self> {
        config.validate()?;
        for target in policy.targets.values() {
            validate_target(*target)?;
        }
        let registry = TierRegistry::build(1, policy.tiers, policy.rules)?;

        info!(
            version = registry.version(),
            tiers = registry.tiers().count(),
            rules = registry.rules().len(),
            "Admission engine initialized"
        );

        Ok(Self {
            registry: Arc::new(registry),
            system: SystemState::default(),
            buckets: BucketLimiter::new(),
            concurrency: ConcurrencyTracker::new(),
            processing: ProcessingEstimator::new(
                config.default_processing_ms,
                config.controller.ewma_alpha,
            ),
            queue: WeightedFairQueue::new(Duration::from_secs_f64(config.aging_half_life_secs)),
            fairness: FairnessGovernor::new(config.fairness(), now),
            controller: FeedbackController::new(config.controller.clone(), policy.targets),
            counters: EngineCounters::default(),
            outbox: Vec::new(),
            last_tick: None,
            ticks_since_snapshot: 0,
            config,
        })
    }

    /// Dispatch one inbound event and return everything it produced.
    pub fn handle(&mut self, event: Inbound, now: Instant) -> Vec<Outbound> {
        match event {
            Inbound::RequestArrived(request) => {
                self.arrive(request, now);
            }
            // errors are logged and counted where they occur
            Inbound::TelemetrySample(sample) => {
                let _ = self.record_telemetry(&sample, now);
            }
            Inbound::SystemStateChange(change) => {
                let _ = self.apply_system_change(&change);
            }
            Inbound::PolicyUpdate(update) => {
                let _ = self.apply_policy(update, now);
            }
            Inbound::CompletionSignal(signal) => self.complete(&signal, now),
        }
        self.take_outbound()
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Decide on an arriving request. The decision is also queued outbound.
    pub fn arrive(&mut self, request: RequestArrived, now: Instant) -> AdmissionDecision {
        self.counters.arrivals += 1;
        let request_id = request.id.clone();
        let tier = request.tier.clone();
        let tenant = request.tenant.clone();

        match self.decide(request, now) {
            Ok(decision) => decision,
            Err(err) => {
                error!(request_id = %request_id, error = %err, "admission pipeline failed");
                self.shed(&request_id, tier, &tenant, Reason::ConfigError, None, None)
            }
        }
    }

    fn decide(&mut self, request: RequestArrived, now: Instant) -> Result<AdmissionDecision> {
        // re-queries of known ids answer from existing state
        if let Some(record) = self.concurrency.get(&request.id) {
            self.counters.duplicates += 1;
            let decision = AdmissionDecision {
                request_id: request.id.clone(),
                tier: Some(record.tier.clone()),
                tenant: record.tenant.clone(),
                decision: Decision::Admit,
                queue_pos: None,
                queue_eta_ms: None,
                applied_degrade: record.applied_degrade.clone(),
                rationale: Reason::DuplicateInFlight,
            };
            return Ok(self.emit_decision(decision));
        }

        if let Some((entry, pos)) = self.queue.position(&request.id, now) {
            self.counters.duplicates += 1;
            let decision = AdmissionDecision {
                request_id: request.id.clone(),
                tier: Some(entry.tier.clone()),
                tenant: entry.tenant().to_string(),
                decision: Decision::Queue,
                queue_pos: Some(pos),
                queue_eta_ms: Some(self.eta_ms(&entry.tier, pos)),
                applied_degrade: ParamMap::new(),
                rationale: Reason::DuplicateQueued,
            };
            return Ok(self.emit_decision(decision));
        }

        let tier = match self.registry.resolve(&request) {
            Ok(tier) => tier,
            Err(unresolved) => {
                debug!(request_id = %request.id, reason = %unresolved, "tier resolution failed");
                return Ok(self.shed(
                    &request.id,
                    request.tier.clone(),
                    &request.tenant,
                    Reason::ConfigError,
                    None,
                    None,
                ));
            }
        };

        if let Some(reason) = self.system.blocks(&tier) {
            return Ok(self.shed_request(&request, &tier, reason, None));
        }

        let route = request.route();
        let multiplier = self.controller.multiplier(&route);
        let check = self.buckets.check(&tier, &route, multiplier, now);
        if !check.allowed {
            return Ok(self.shed_request(&request, &tier, Reason::RateLimit, Some(check.wait_ms)));
        }

        if !self.concurrency.has_capacity(&tier, &route) {
            let state = AdmissionState::Arrived.transition(AdmissionEvent::ConcurrencyFull)?;
            return self.enqueue(state, request, &tier, Reason::ConcurrencyLimit, now);
        }

        if self.fairness.over_cap(&request.tenant) {
            let state = AdmissionState::Arrived.transition(AdmissionEvent::OverFairShare)?;
            return self.enqueue(state, request, &tier, Reason::Fairness, now);
        }

        Ok(self.admit(&request, &tier, route, Reason::Admitted, now))
    }

    fn enqueue(
        &mut self,
        state: AdmissionState,
        request: RequestArrived,
        tier: &Tier,
        reason: Reason,
        now: Instant,
    ) -> Result<AdmissionDecision> {
        let deadline_ms = request
            .deadline_hint_ms()
            .map_or(tier.deadline_ms, |hint| hint.min(tier.deadline_ms));
        let deadline = now + Duration::from_millis(deadline_ms);

        let pos = self.queue.depth(&tier.name) + 1;
        let eta_ms = self.eta_ms(&tier.name, pos);
        if eta_ms > tier.queue_ms_max {
            state.transition(AdmissionEvent::Shed)?;
            return Ok(self.shed_request(&request, tier, Reason::QueueOverflow, None));
        }
        if now + Duration::from_millis(eta_ms) > deadline {
            state.transition(AdmissionEvent::Shed)?;
            return Ok(self.shed_request(&request, tier, Reason::DeadlineViolation, None));
        }

        let decision = AdmissionDecision {
            request_id: request.id.clone(),
            tier: Some(tier.name.clone()),
            tenant: request.tenant.clone(),
            decision: Decision::Queue,
            queue_pos: Some(pos),
            queue_eta_ms: Some(eta_ms),
            applied_degrade: ParamMap::new(),
            rationale: reason,
        };
        self.queue.push(request, tier, reason, deadline, now);
        self.counters.queued += 1;
        Ok(self.emit_decision(decision))
    }

    fn admit(
        &mut self,
        request: &RequestArrived,
        tier: &Tier,
        route: RouteKey,
        rationale: Reason,
        now: Instant,
    ) -> AdmissionDecision {
        let applied_degrade = degrade(tier, &self.system, &self.config.degrade);
        self.concurrency.admit(
            &request.id,
            InFlight {
                tier: tier.name.clone(),
                route,
                tenant: request.tenant.clone(),
                admitted_at: now,
                applied_degrade: applied_degrade.clone(),
            },
        );
        self.fairness.record_admit(&request.tenant);
        self.counters.admitted += 1;
        if rationale == Reason::AdmittedFromQueue {
            self.counters.admitted_from_queue += 1;
        }

        self.emit_decision(AdmissionDecision {
            request_id: request.id.clone(),
            tier: Some(tier.name.clone()),
            tenant: request.tenant.clone(),
            decision: Decision::Admit,
            queue_pos: None,
            queue_eta_ms: None,
            applied_degrade,
            rationale,
        })
    }

    fn shed_request(
        &mut self,
        request: &RequestArrived,
        tier: &Tier,
        reason: Reason,
        bucket_wait_ms: Option<u64>,
    ) -> AdmissionDecision {
        self.shed(
            &request.id,
            Some(tier.name.clone()),
            &request.tenant,
            reason,
            Some(tier),
            bucket_wait_ms,
        )
    }

    fn shed(
        &mut self,
        request_id: &str,
        tier_name: Option<String>,
        tenant: &str,
        reason: Reason,
        tier: Option<&Tier>,
        bucket_wait_ms: Option<u64>,
    ) -> AdmissionDecision {
        let (retry_after_ms, advice) = self.shed_advice(reason, tier, bucket_wait_ms);
        self.counters.record_shed(reason);

        let decision = self.emit_decision(AdmissionDecision {
            request_id: request_id.to_string(),
            tier: tier_name.clone(),
            tenant: tenant.to_string(),
            decision: Decision::Shed,
            queue_pos: None,
            queue_eta_ms: None,
            applied_degrade: ParamMap::new(),
            rationale: reason,
        });
        self.outbox.push(Outbound::ShedEvent(ShedEvent {
            request_id: request_id.to_string(),
            tier: tier_name,
            reason,
            retry_after_ms,
            advice,
        }));
        decision
    }

    /// Retry guidance for a shed.
    fn shed_advice(
        &self,
        reason: Reason,
        tier: Option<&Tier>,
        bucket_wait_ms: Option<u64>,
    ) -> (Option<u64>, ShedAdvice) {
        if reason.is_config() {
            return (
                None,
                ShedAdvice {
                    action: RetryAction::DoNotRetry,
                    degrade_hint: ParamMap::new(),
                },
            );
        }

        let retry_after_ms = match reason {
            Reason::RateLimit => bucket_wait_ms,
            r if r.is_gate() => Some(self.config.gate_retry_after_ms),
            _ => tier.map(|tier| self.processing_ms(&tier.name)),
        };
        let advice = match (reason, tier) {
            (Reason::RateLimit, _) | (_, None) => ShedAdvice {
                action: RetryAction::RetryAfter,
                degrade_hint: ParamMap::new(),
            },
            (_, Some(tier)) => ShedAdvice {
                action: RetryAction::RetryDegraded,
                degrade_hint: degrade_hint(tier, &self.config.degrade),
            },
        };
        (retry_after_ms, advice)
    }

    fn emit_decision(&mut self, decision: AdmissionDecision) -> AdmissionDecision {
        debug!(
            request_id = %decision.request_id,
            tier = ?decision.tier,
            tenant = %decision.tenant,
            decision = ?decision.decision,
            rationale = decision.rationale.as_str(),
            queue_pos = ?decision.queue_pos,
            "admission decision"
        );
        self.outbox.push(Outbound::AdmissionDecision(decision.clone()));
        decision
    }

    fn processing_ms(&self, tier: &str) -> u64 {
        self.processing.estimate_ms(tier).ceil() as u64
    }

    fn eta_ms(&self, tier: &str, pos: usize) -> u64 {
        (pos as f64 * self.processing.estimate_ms(tier)).ceil() as u64
    }

    /// Release the slot of a finished request.
    pub fn complete(&mut self, signal: &CompletionSignal, now: Instant) {
        match self.concurrency.release(&signal.id) {
            Some(record) => {
                let elapsed = now.saturating_duration_since(record.admitted_at);
                self.processing.observe(&record.tier, elapsed);
                self.counters.completions += 1;
                debug!(
                    request_id = %signal.id,
                    tier = %record.tier,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "request completed"
                );
            }
            None => debug!(request_id = %signal.id, "completion for unknown request ignored"),
        }
    }

    /// Feed latency telemetry to the controller; retunes buckets on change.
    pub fn record_telemetry(&mut self, sample: &TelemetrySample, now: Instant) -> Result<()> {
        match self.controller.record_sample(sample, now) {
            Ok(Some(_)) => {
                self.retune_route(&sample.route(), now);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.counters.rejected_telemetry += 1;
                warn!(error = %err, "Rejected telemetry sample");
                Err(err)
            }
        }
    }

    /// Rescale a route's buckets in every tier and report the new rates.
    fn retune_route(&mut self, route: &RouteKey, now: Instant) {
        let multiplier = self.controller.multiplier(route);
        self.buckets
            .rescale_route(&self.registry, route, multiplier, now);

        let snapshot = self.controller.snapshot(route);
        for tier in self.registry.tiers() {
            let (rps_target, burst) = bucket_params(tier, multiplier);
            self.outbox.push(Outbound::RateUpdated(RateUpdated {
                route: route.clone(),
                tier: tier.name.clone(),
                rps_target,
                burst,
                concurrency_limit: tier.concurrency_max,
                controller: snapshot.clone(),
            }));
            self.counters.rate_updates += 1;
        }
        debug!(route = %route, multiplier, "Route retuned");
    }

    pub fn apply_system_change(&mut self, change: &SystemStateChange) -> Result<()> {
        let before = self.system.mode();
        if let Err(err) = self.system.apply(change) {
            warn!(error = %err, "Ignored system state change");
            return Err(err);
        }
        info!(
            component = %change.component,
            value = %change.value,
            from = %before,
            mode = %self.system.mode(),
            "System state changed"
        );
        Ok(())
    }

    /// Swap in a new registry and targets. Queued requests of removed tiers
    /// are shed with `config_obsoleted`.
    pub fn apply_policy(&mut self, update: PolicyUpdate, now: Instant) -> Result<()> {
        let built = update
            .targets
            .values()
            .try_for_each(|target| validate_target(*target))
            .and_then(|_| {
                TierRegistry::build(self.registry.version() + 1, update.tiers, update.rules)
            });
        let registry = match built {
            Ok(registry) => Arc::new(registry),
            Err(err) => {
                self.counters.rejected_policies += 1;
                warn!(error = %err, version = self.registry.version(), "Rejected policy update");
                return Err(err);
            }
        };
        self.registry = registry;

        let reset = self.controller.set_targets(update.targets);
        let controller = &self.controller;
        self.buckets
            .apply_registry(&self.registry, |route| controller.multiplier(route), now);
        for route in reset {
            self.retune_route(&route, now);
        }

        let registry = Arc::clone(&self.registry);
        let obsolete = self.queue.retain_tiers(|tier| registry.contains(tier));
        for entry in obsolete {
            self.shed_entry(entry, Reason::ConfigObsoleted);
        }

        info!(
            version = self.registry.version(),
            tiers = self.registry.tiers().count(),
            rules = self.registry.rules().len(),
            "Policy applied"
        );
        Ok(())
    }

    fn shed_entry(&mut self, entry: QueueEntry, reason: Reason) {
        if let Err(err) = AdmissionState::queued_for(entry.reason).transition(AdmissionEvent::Shed) {
            error!(request_id = %entry.id(), error = %err, "queued request in invalid state");
        }
        let tier = self.registry.get(&entry.tier).cloned();
        self.shed(
            entry.id(),
            Some(entry.tier.clone()),
            entry.tenant(),
            reason,
            tier.as_deref(),
            None,
        );
    }

    /// Periodic maintenance: fairness window, controller decay, leak sweep,
    /// queue expiry and drain, counter pruning, snapshots.
    pub fn tick(&mut self, now: Instant) {
        if let Some(last) = self.last_tick {
            if now < last {
                debug!("Ignoring tick from the past");
                return;
            }
        }
        self.last_tick = Some(now);
        self.counters.ticks += 1;

        if self.fairness.roll_window(now) {
            debug!("Fairness window rolled");
        }

        for route in self.controller.decay_stale(now) {
            self.retune_route(&route, now);
        }

        let leak_timeout = Duration::from_millis(self.config.leak_timeout_ms);
        for (request_id, record) in self.concurrency.sweep_leaked(now, leak_timeout) {
            self.counters.leaked_slots += 1;
            warn!(
                request_id = %request_id,
                tier = %record.tier,
                route = %record.route,
                "Force-released leaked concurrency slot"
            );
        }

        for entry in self.queue.expire(now) {
            self.shed_entry(entry, Reason::DeadlineViolation);
        }
        self.drain(now);

        let registry = Arc::clone(&self.registry);
        self.concurrency.prune_idle(|tier| registry.contains(tier));

        self.ticks_since_snapshot += 1;
        let every = self.config.snapshot_every_ticks;
        if every > 0 && self.ticks_since_snapshot >= every {
            self.ticks_since_snapshot = 0;
            let snapshot = self.snapshot();
            self.outbox.push(Outbound::QueueSnapshot(snapshot));
        }
    }

    /// Admit queued requests in priority order wherever capacity allows.
    fn drain(&mut self, now: Instant) {
        let tiers: Vec<Arc<Tier>> = self.registry.tiers().cloned().collect();
        for tier in tiers {
            if self.queue.depth(&tier.name) == 0 {
                continue;
            }
            if let Some(reason) = self.system.blocks(&tier) {
                debug!(tier = %tier.name, reason = reason.as_str(), "Gate holds queue");
                continue;
            }

            for seq in self.queue.priority_order(&tier.name, now) {
                let Some(entry) = self.queue.get(&tier.name, seq) else {
                    continue;
                };
                if !self.concurrency.has_capacity(&tier, &entry.route)
                    || self.fairness.over_cap(entry.tenant())
                {
                    continue;
                }

                let Some(entry) = self.queue.remove(&tier.name, seq) else {
                    continue;
                };
                match AdmissionState::queued_for(entry.reason).transition(AdmissionEvent::Admit) {
                    Ok(_) => {
                        self.admit(
                            &entry.request,
                            &tier,
                            entry.route.clone(),
                            Reason::AdmittedFromQueue,
                            now,
                        );
                    }
                    Err(err) => {
                        error!(request_id = %entry.id(), error = %err, "queued request in invalid state");
                    }
                }
            }
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            registry_version: self.registry.version(),
            mode: self.system.mode(),
            queue_depths: self.queue.depths(),
            in_flight: self.concurrency.in_flight(),
            counters: self.counters.clone(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TierRegistry> {
        &self.registry
    }

    pub fn system_state(&self) -> &SystemState {
        &self.system
    }

    pub fn mode(&self) -> SystemMode {
        self.system.mode()
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.counters
    }

    pub fn queue_depth(&self, tier: &str) -> usize {
        self.queue.depth(tier)
    }

    pub fn queue_depths(&self) -> BTreeMap<String, usize> {
        self.queue.depths()
    }

    pub fn in_flight(&self) -> usize {
        self.concurrency.in_flight()
    }

    pub fn concurrency(&self, tier: &str, route: &RouteKey) -> u32 {
        self.concurrency.count(tier, route)
    }

    pub fn multiplier(&self, route: &RouteKey) -> f64 {
        self.controller.multiplier(route)
    }

    pub fn bucket(&self, tier: &str, route: &RouteKey) -> Option<&TokenBucket> {
        self.buckets.get(tier, route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::test_tier;

    fn engine(now: Instant) -> AdmissionEngine {
        let policy = PolicyUpdate {
            tiers: vec![test_tier("gold"), test_tier("bronze")],
            ..Default::default()
        };
        AdmissionEngine::new(EngineConfig::default(), policy, now).unwrap()
    }

    fn request(id: &str, tier: &str) -> RequestArrived {
        RequestArrived {
            id: id.to_string(),
            service: "search".to_string(),
            path: "/q".to_string(),
            tier: Some(tier.to_string()),
            tenant: "acme".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        let state = AdmissionState::Arrived;
        assert_eq!(
            state.transition(AdmissionEvent::ConcurrencyFull).unwrap(),
            AdmissionState::ConcurrencyQueued
        );
        assert_eq!(
            AdmissionState::FairnessQueued
                .transition(AdmissionEvent::Admit)
                .unwrap(),
            AdmissionState::Admitted
        );
        assert!(AdmissionState::Shed.is_terminal());
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let err = AdmissionState::Admitted
            .transition(AdmissionEvent::Shed)
            .unwrap_err();
        assert_eq!(
            err,
            TierguardError::InvalidTransition {
                from: AdmissionState::Admitted,
                event: AdmissionEvent::Shed,
            }
        );
        assert!(AdmissionState::RateLimited
            .transition(AdmissionEvent::Admit)
            .is_err());
        assert!(AdmissionState::ConcurrencyQueued
            .transition(AdmissionEvent::RateDenied)
            .is_err());
    }

    #[test]
    fn test_queued_paths_end_in_terminal_states() {
        use AdmissionEvent as E;

        for reason in [Reason::ConcurrencyLimit, Reason::Fairness] {
            let queued = AdmissionState::queued_for(reason);
            assert!(!queued.is_terminal());
            assert!(queued.transition(E::Admit).unwrap().is_terminal());
            assert!(queued.transition(E::Shed).unwrap().is_terminal());
            // a queued request never re-enters the check pipeline
            assert!(queued.transition(E::OverFairShare).is_err());
        }
        assert!(AdmissionState::Arrived
            .transition(E::GateBlocked)
            .and_then(|s| s.transition(E::Shed))
            .unwrap()
            .is_terminal());
    }

    #[test]
    fn test_admit_records_in_flight() {
        let now = Instant::now();
        let mut engine = engine(now);
        let decision = engine.arrive(request("r1", "gold"), now);

        assert!(decision.is_admit());
        assert_eq!(decision.rationale, Reason::Admitted);
        assert_eq!(engine.in_flight(), 1);
        let out = engine.take_outbound();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_decision(), Some(&decision));
    }

    #[test]
    fn test_unknown_tier_fails_closed() {
        let now = Instant::now();
        let mut engine = engine(now);
        let decision = engine.arrive(request("r1", "platinum"), now);

        assert!(decision.is_shed());
        assert_eq!(decision.rationale, Reason::ConfigError);
        let out = engine.take_outbound();
        let shed = out.iter().find_map(Outbound::as_shed).unwrap();
        assert_eq!(shed.retry_after_ms, None);
        assert_eq!(shed.advice.action, RetryAction::DoNotRetry);
    }

    #[test]
    fn test_completion_releases_and_feeds_estimate() {
        let start = Instant::now();
        let mut engine = engine(start);
        engine.arrive(request("r1", "gold"), start);
        engine.complete(
            &CompletionSignal {
                id: "r1".to_string(),
            },
            start + Duration::from_millis(40),
        );

        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.processing_ms("gold"), 40);
        assert_eq!(engine.counters().completions, 1);

        // unknown or repeated completions are ignored
        engine.complete(
            &CompletionSignal {
                id: "r1".to_string(),
            },
            start + Duration::from_millis(50),
        );
        assert_eq!(engine.counters().completions, 1);
    }

    #[test]
    fn test_deadline_hint_only_shortens() {
        let now = Instant::now();
        let mut tier = test_tier("bronze");
        tier.concurrency_max = 1;
        tier.deadline_ms = 1_000;
        let policy = PolicyUpdate {
            tiers: vec![tier],
            ..Default::default()
        };
        let mut engine = AdmissionEngine::new(EngineConfig::default(), policy, now).unwrap();
        engine.arrive(request("r1", "bronze"), now);

        // eta 100ms fits a 1s deadline but not a 50ms one
        let mut short = request("r2", "bronze");
        short
            .hints
            .insert("deadline_ms".to_string(), "50".to_string());
        assert_eq!(
            engine.arrive(short, now).rationale,
            Reason::DeadlineViolation
        );

        let mut long = request("r3", "bronze");
        long.hints
            .insert("deadline_ms".to_string(), "60000".to_string());
        let decision = engine.arrive(long, now);
        assert!(decision.is_queue());

        engine.tick(now + Duration::from_millis(1_000));
        assert_eq!(engine.queue_depth("bronze"), 0);
        assert_eq!(engine.counters().shed_for(Reason::DeadlineViolation), 2);
    }

    #[test]
    fn test_stale_tick_is_ignored() {
        let start = Instant::now();
        let mut engine = engine(start);
        engine.tick(start + Duration::from_secs(2));
        engine.tick(start + Duration::from_secs(1));
        assert_eq!(engine.counters().ticks, 1);
    }

    #[test]
    fn test_snapshot_cadence() {
        let start = Instant::now();
        let config = EngineConfig {
            snapshot_every_ticks: 2,
            ..EngineConfig::default()
        };
        let policy = PolicyUpdate {
            tiers: vec![test_tier("gold")],
            ..Default::default()
        };
        let mut engine = AdmissionEngine::new(config, policy, start).unwrap();

        engine.tick(start);
        assert!(engine.take_outbound().is_empty());
        engine.tick(start + Duration::from_secs(1));
        let out = engine.take_outbound();
        match out.as_slice() {
            [Outbound::QueueSnapshot(snapshot)] => {
                assert_eq!(snapshot.registry_version, 1);
                assert_eq!(snapshot.counters.ticks, 2);
            }
            other => panic!("expected one snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig {
            max_share_pct_per_tenant: 0.0,
            ..EngineConfig::default()
        };
        assert!(bad.validate().is_err());

        let policy = PolicyUpdate {
            tiers: vec![test_tier("gold")],
            ..Default::default()
        };
        assert!(AdmissionEngine::new(bad, policy, Instant::now()).is_err());
    }
}
