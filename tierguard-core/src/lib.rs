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

//! Tierguard Core
//!
//! SLA-aware admission control: tiered token buckets, concurrency limits,
//! weighted-fair queueing with aging, tenant fairness, a system-health gate,
//! response degradation and a latency feedback controller, all owned by a
//! single [`AdmissionEngine`].

pub mod bucket;
pub mod concurrency;
pub mod controller;
pub mod degrade;
pub mod engine;
pub mod error;
pub mod event;
pub mod fairness;
pub mod gate;
pub mod queue;
pub mod stats;
pub mod tier;

pub use controller::{ControllerConfig, ControllerSnapshot, FeedbackController};
pub use degrade::{DegradeRule, DegradeRules};
pub use engine::{AdmissionEngine, AdmissionEvent, AdmissionState, EngineConfig};
pub use error::{Result, TierguardError};
pub use event::{
    AdmissionDecision, CompletionSignal, Decision, Inbound, Outbound, PolicyUpdate, QueueSnapshot,
    RateUpdated, Reason, RequestArrived, RetryAction, ShedAdvice, ShedEvent, SystemStateChange,
    TelemetrySample,
};
pub use gate::{SystemComponent, SystemMode, SystemState};
pub use stats::EngineCounters;
pub use tier::{DropPolicy, Importance, ParamMap, RouteKey, Tier, TierRegistry, TierRule};
