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

//! Inbound and outbound events.
//!
//! Everything the engine consumes or produces crosses this boundary as a
//! plain serde type, tagged by `type` in snake_case. Times are never carried
//! on inbound events; the host stamps each event with the `Instant` it was
//! handled at.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::controller::ControllerSnapshot;
use crate::gate::{SystemComponent, SystemMode};
use crate::stats::EngineCounters;
use crate::tier::{Importance, ParamMap, RouteKey, Tier, TierRule};

/// A request asking for an admission decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestArrived {
    pub id: String,
    pub service: String,
    pub path: String,
    #[serde(default)]
    pub tier: Option<String>,
    pub tenant: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub hints: BTreeMap<String, String>,
}

impl RequestArrived {
    pub fn route(&self) -> RouteKey {
        RouteKey::new(&self.service, &self.path)
    }

    /// Deadline hint in milliseconds, if the caller sent a usable one.
    pub fn deadline_hint_ms(&self) -> Option<u64> {
        self.hints
            .get("deadline_ms")
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
    }
}

/// Aggregated latency telemetry for one route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Aggregation window in seconds
    #[serde(default)]
    pub window: u64,
    pub service: String,
    pub path: String,
    pub latency_p95_ms: f64,
    #[serde(default)]
    pub latency_p50_ms: f64,
    #[serde(default)]
    pub error_pct: f64,
    #[serde(default)]
    pub queue_depth: u64,
    #[serde(default)]
    pub active_concurrency: u64,
    #[serde(default)]
    pub rps: f64,
}

impl TelemetrySample {
    pub fn route(&self) -> RouteKey {
        RouteKey::new(&self.service, &self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStateChange {
    pub component: SystemComponent,
    pub value: String,
}

/// Wholesale replacement of tiers, resolution rules and latency targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyUpdate {
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub rules: Vec<TierRule>,
    /// Target p95 latency in milliseconds per route
    #[serde(default)]
    pub targets: BTreeMap<RouteKey, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    RequestArrived(RequestArrived),
    TelemetrySample(TelemetrySample),
    SystemStateChange(SystemStateChange),
    PolicyUpdate(PolicyUpdate),
    CompletionSignal(CompletionSignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Admit,
    Queue,
    Shed,
}

/// Rationale codes attached to decisions and shed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Admitted,
    AdmittedFromQueue,
    DuplicateInFlight,
    DuplicateQueued,
    FreezeActive,
    BudgetGuard,
    SloDegraded,
    DerateMode,
    RateLimit,
    ConcurrencyLimit,
    QueueOverflow,
    Fairness,
    DeadlineViolation,
    ConfigError,
    ConfigObsoleted,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::Admitted => "admitted",
            Reason::AdmittedFromQueue => "admitted_from_queue",
            Reason::DuplicateInFlight => "duplicate_in_flight",
            Reason::DuplicateQueued => "duplicate_queued",
            Reason::FreezeActive => "freeze_active",
            Reason::BudgetGuard => "budget_guard",
            Reason::SloDegraded => "slo_degraded",
            Reason::DerateMode => "derate_mode",
            Reason::RateLimit => "rate_limit",
            Reason::ConcurrencyLimit => "concurrency_limit",
            Reason::QueueOverflow => "queue_overflow",
            Reason::Fairness => "fairness",
            Reason::DeadlineViolation => "deadline_violation",
            Reason::ConfigError => "config_error",
            Reason::ConfigObsoleted => "config_obsoleted",
        }
    }

    pub fn is_gate(self) -> bool {
        matches!(
            self,
            Reason::FreezeActive | Reason::BudgetGuard | Reason::SloDegraded | Reason::DerateMode
        )
    }

    pub fn is_config(self) -> bool {
        matches!(self, Reason::ConfigError | Reason::ConfigObsoleted)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionDecision {
    pub request_id: String,
    pub tier: Option<String>,
    pub tenant: String,
    pub decision: Decision,
    pub queue_pos: Option<usize>,
    pub queue_eta_ms: Option<u64>,
    pub applied_degrade: ParamMap,
    pub rationale: Reason,
}

impl AdmissionDecision {
    pub fn is_admit(&self) -> bool {
        self.decision == Decision::Admit
    }

    pub fn is_queue(&self) -> bool {
        self.decision == Decision::Queue
    }

    pub fn is_shed(&self) -> bool {
        self.decision == Decision::Shed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryAction {
    RetryAfter,
    /// Retry with the attached degrade hint applied.
    RetryDegraded,
    DoNotRetry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShedAdvice {
    pub action: RetryAction,
    pub degrade_hint: ParamMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShedEvent {
    pub request_id: String,
    pub tier: Option<String>,
    pub reason: Reason,
    pub retry_after_ms: Option<u64>,
    pub advice: ShedAdvice,
}

/// Informational: bucket parameters for one (route, tier) after a retune.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateUpdated {
    pub route: RouteKey,
    pub tier: String,
    pub rps_target: f64,
    pub burst: f64,
    pub concurrency_limit: u32,
    pub controller: ControllerSnapshot,
}

/// Periodic counters, for observability only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub registry_version: u64,
    pub mode: SystemMode,
    pub queue_depths: BTreeMap<String, usize>,
    pub in_flight: usize,
    pub counters: EngineCounters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    AdmissionDecision(AdmissionDecision),
    ShedEvent(ShedEvent),
    RateUpdated(RateUpdated),
    QueueSnapshot(QueueSnapshot),
}

impl Outbound {
    pub fn as_decision(&self) -> Option<&AdmissionDecision> {
        match self {
            Outbound::AdmissionDecision(decision) => Some(decision),
            _ => None,
        }
    }

    pub fn as_shed(&self) -> Option<&ShedEvent> {
        match self {
            Outbound::ShedEvent(shed) => Some(shed),
            _ => None,
        }
    }

    pub fn as_rate_update(&self) -> Option<&RateUpdated> {
        match self {
            Outbound::RateUpdated(update) => Some(update),
            _ => None,
        }
    }
}
