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

//! System Constraint Gate
//!
//! External health flags folded into one totally ordered [`SystemMode`].
//! The most restrictive component wins; a tier is blocked once the effective
//! mode reaches the threshold of its [`DropPolicy`](crate::tier::DropPolicy).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TierguardError};
use crate::event::{Reason, SystemStateChange};
use crate::tier::Tier;

/// Effective system mode, least to most restrictive.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    #[default]
    Normal,
    Degraded,
    Slowdown,
    BlockAggressive,
    HaltEntry,
    StreamsPanic,
}

impl fmt::Display for SystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemMode::Normal => "normal",
            SystemMode::Degraded => "degraded",
            SystemMode::Slowdown => "slowdown",
            SystemMode::BlockAggressive => "block_aggressive",
            SystemMode::HaltEntry => "halt_entry",
            SystemMode::StreamsPanic => "streams_panic",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemComponent {
    Slo,
    Cost,
    Freeze,
    Derate,
}

impl fmt::Display for SystemComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemComponent::Slo => "slo",
            SystemComponent::Cost => "cost",
            SystemComponent::Freeze => "freeze",
            SystemComponent::Derate => "derate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostStatus {
    #[default]
    Ok,
    Warning,
    Exceeded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreezeStatus {
    #[default]
    Thawed,
    Frozen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerateStatus {
    #[default]
    Off,
    Derated,
    Panic,
}

/// Current value of every external health flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemState {
    pub slo: SloStatus,
    pub cost: CostStatus,
    pub freeze: FreezeStatus,
    pub derate: DerateStatus,
}

impl SystemState {
    /// Apply an external change. Unknown values leave the state untouched.
    pub fn apply(&mut self, change: &SystemStateChange) -> Result<()> {
        let value = change.value.trim().to_ascii_lowercase();
        let unknown = || TierguardError::UnknownSystemValue {
            component: change.component.to_string(),
            value: change.value.clone(),
        };

        match change.component {
            SystemComponent::Slo => {
                self.slo = match value.as_str() {
                    "healthy" => SloStatus::Healthy,
                    "degraded" => SloStatus::Degraded,
                    "unhealthy" => SloStatus::Unhealthy,
                    _ => return Err(unknown()),
                }
            }
            SystemComponent::Cost => {
                self.cost = match value.as_str() {
                    "ok" => CostStatus::Ok,
                    "warning" => CostStatus::Warning,
                    "exceeded" => CostStatus::Exceeded,
                    _ => return Err(unknown()),
                }
            }
            SystemComponent::Freeze => {
                self.freeze = match value.as_str() {
                    "thawed" => FreezeStatus::Thawed,
                    "frozen" => FreezeStatus::Frozen,
                    _ => return Err(unknown()),
                }
            }
            SystemComponent::Derate => {
                self.derate = match value.as_str() {
                    "off" => DerateStatus::Off,
                    "derated" => DerateStatus::Derated,
                    "panic" => DerateStatus::Panic,
                    _ => return Err(unknown()),
                }
            }
        }
        Ok(())
    }

    /// Mode contributed by each component, in tie-break order.
    fn contributions(&self) -> [(SystemMode, Reason); 4] {
        let freeze = match self.freeze {
            FreezeStatus::Thawed => SystemMode::Normal,
            FreezeStatus::Frozen => SystemMode::HaltEntry,
        };
        let cost = match self.cost {
            CostStatus::Ok => SystemMode::Normal,
            CostStatus::Warning => SystemMode::Degraded,
            CostStatus::Exceeded => SystemMode::BlockAggressive,
        };
        let slo = match self.slo {
            SloStatus::Healthy => SystemMode::Normal,
            SloStatus::Degraded => SystemMode::Degraded,
            SloStatus::Unhealthy => SystemMode::Slowdown,
        };
        let derate = match self.derate {
            DerateStatus::Off => SystemMode::Normal,
            DerateStatus::Derated => SystemMode::Slowdown,
            DerateStatus::Panic => SystemMode::StreamsPanic,
        };

        [
            (freeze, Reason::FreezeActive),
            (cost, Reason::BudgetGuard),
            (slo, Reason::SloDegraded),
            (derate, Reason::DerateMode),
        ]
    }

    /// Effective mode and the component responsible for it.
    pub fn resolve(&self) -> (SystemMode, Option<Reason>) {
        let mut best = (SystemMode::Normal, None);
        for (mode, reason) in self.contributions() {
            if mode > best.0 {
                best = (mode, Some(reason));
            }
        }
        best
    }

    pub fn mode(&self) -> SystemMode {
        self.resolve().0
    }

    /// Gate check for one tier: `Some(reason)` when admission is blocked.
    pub fn blocks(&self, tier: &Tier) -> Option<Reason> {
        match self.resolve() {
            (mode, Some(reason)) if mode >= tier.drop_policy.blocks_at() => Some(reason),
            _ => None,
        }
    }
}
