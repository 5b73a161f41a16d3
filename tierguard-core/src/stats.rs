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

//! Engine counters published in queue snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::event::Reason;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineCounters {
    pub arrivals: u64,
    pub admitted: u64,
    pub admitted_from_queue: u64,
    pub queued: u64,
    pub shed: u64,
    pub duplicates: u64,
    pub completions: u64,
    pub leaked_slots: u64,
    pub rate_updates: u64,
    pub rejected_telemetry: u64,
    pub rejected_policies: u64,
    pub ticks: u64,
    /// Shed count by reason code
    pub shed_by_reason: BTreeMap<Reason, u64>,
}

impl EngineCounters {
    pub fn record_shed(&mut self, reason: Reason) {
        self.shed += 1;
        *self.shed_by_reason.entry(reason).or_insert(0) += 1;
    }

    pub fn shed_for(&self, reason: Reason) -> u64 {
        self.shed_by_reason.get(&reason).copied().unwrap_or(0)
    }
}
