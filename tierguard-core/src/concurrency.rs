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

//! Concurrency Tracker
//!
//! In-flight counters per (tier, route). Slots are taken on admission and
//! given back by an explicit completion signal from the execution layer.
//! [`ConcurrencyTracker::sweep_leaked`] is the leak-prevention fallback for
//! completions that never arrive; it is best-effort only.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::controller::Ewma;
use crate::tier::{LimitKey, ParamMap, RouteKey, Tier};

/// An admitted request still holding a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlight {
    pub tier: String,
    pub route: RouteKey,
    pub tenant: String,
    pub admitted_at: Instant,
    pub applied_degrade: ParamMap,
}

#[derive(Debug, Default)]
pub struct ConcurrencyTracker {
    counts: HashMap<LimitKey, u32>,
    in_flight: HashMap<String, InFlight>,
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, tier: &str, route: &RouteKey) -> u32 {
        self.counts
            .get(&LimitKey::new(tier, route))
            .copied()
            .unwrap_or(0)
    }

    pub fn has_capacity(&self, tier: &Tier, route: &RouteKey) -> bool {
        self.count(&tier.name, route) < tier.concurrency_max
    }

    pub fn get(&self, request_id: &str) -> Option<&InFlight> {
        self.in_flight.get(request_id)
    }

    /// Take a slot for `request_id`. Returns false if it already holds one.
    pub fn admit(&mut self, request_id: &str, record: InFlight) -> bool {
        if self.in_flight.contains_key(request_id) {
            return false;
        }
        *self
            .counts
            .entry(LimitKey::new(&record.tier, &record.route))
            .or_insert(0) += 1;
        self.in_flight.insert(request_id.to_string(), record);
        true
    }

    /// Give back the slot held by `request_id`, if any.
    pub fn release(&mut self, request_id: &str) -> Option<InFlight> {
        let record = self.in_flight.remove(request_id)?;
        let key = LimitKey::new(&record.tier, &record.route);
        if let Some(count) = self.counts.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
        Some(record)
    }

    /// Force-release every slot held longer than `timeout`.
    pub fn sweep_leaked(&mut self, now: Instant, timeout: Duration) -> Vec<(String, InFlight)> {
        let leaked: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, record)| now.saturating_duration_since(record.admitted_at) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        leaked
            .into_iter()
            .filter_map(|id| self.release(&id).map(|record| (id, record)))
            .collect()
    }

    /// Drop zero counters for tiers that no longer exist.
    pub fn prune_idle(&mut self, keep_tier: impl Fn(&str) -> bool) {
        self.counts
            .retain(|key, count| *count > 0 || keep_tier(&key.tier));
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Per-tier average processing time, fed by completion signals.
#[derive(Debug)]
pub struct ProcessingEstimator {
    default_ms: f64,
    alpha: f64,
    per_tier: HashMap<String, Ewma>,
}

impl ProcessingEstimator {
    pub fn new(default_ms: f64, alpha: f64) -> Self {
        Self {
            default_ms,
            alpha,
            per_tier: HashMap::new(),
        }
    }

    pub fn observe(&mut self, tier: &str, elapsed: Duration) {
        let alpha = self.alpha;
        self.per_tier
            .entry(tier.to_string())
            .or_insert_with(|| Ewma::new(alpha))
            .update(elapsed.as_micros() as f64 / 1000.0);
    }

    pub fn estimate_ms(&self, tier: &str) -> f64 {
        self.per_tier
            .get(tier)
            .and_then(Ewma::value)
            .unwrap_or(self.default_ms)
    }
}
