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

//! Degradation Selector
//!
//! Pure mapping from a tier's default profile and the current system health
//! to the response-quality parameters attached to an admission. Floors are
//! applied on every call, healthy or not.

use serde::{Deserialize, Serialize};

use crate::gate::{CostStatus, SloStatus, SystemState};
use crate::tier::{ParamMap, Tier};

/// Tightening rule for one numeric parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradeRule {
    pub param: String,
    /// Added when the SLO is unhealthy (usually negative)
    #[serde(default)]
    pub slo_delta: f64,
    /// Added when cost is at warning or above
    #[serde(default)]
    pub cost_delta: f64,
    /// Lower bound, always enforced
    pub floor: f64,
}

impl DegradeRule {
    pub fn new(param: &str, slo_delta: f64, cost_delta: f64, floor: f64) -> Self {
        Self {
            param: param.to_string(),
            slo_delta,
            cost_delta,
            floor,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradeRules {
    #[serde(default = "default_rules")]
    pub rules: Vec<DegradeRule>,
    /// Feature toggles switched off (set to 0.0) under cost pressure
    #[serde(default = "default_optional_features")]
    pub optional_features: Vec<String>,
}

fn default_rules() -> Vec<DegradeRule> {
    vec![
        DegradeRule::new("max_output_tokens", -256.0, -256.0, 64.0),
        DegradeRule::new("top_k", -5.0, -5.0, 1.0),
        DegradeRule::new("timeout_ms", -500.0, 0.0, 250.0),
    ]
}

fn default_optional_features() -> Vec<String> {
    vec![
        "rerank".to_string(),
        "personalization".to_string(),
        "streaming".to_string(),
    ]
}

impl Default for DegradeRules {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            optional_features: default_optional_features(),
        }
    }
}

/// Select the parameters for `tier` under `state`.
pub fn degrade(tier: &Tier, state: &SystemState, rules: &DegradeRules) -> ParamMap {
    let mut params = tier.degrade_profile.clone();
    let slo_unhealthy = state.slo == SloStatus::Unhealthy;
    let cost_pressure = state.cost >= CostStatus::Warning;

    if cost_pressure {
        for feature in &rules.optional_features {
            if let Some(value) = params.get_mut(feature) {
                *value = 0.0;
            }
        }
    }

    for rule in &rules.rules {
        let Some(value) = params.get_mut(&rule.param) else {
            continue;
        };
        if slo_unhealthy {
            *value += rule.slo_delta;
        }
        if cost_pressure {
            *value += rule.cost_delta;
        }
        *value = value.max(rule.floor);
    }

    params
}

/// Parameters a shed caller could retry with: the fully tightened profile.
pub fn degrade_hint(tier: &Tier, rules: &DegradeRules) -> ParamMap {
    let worst = SystemState {
        slo: SloStatus::Unhealthy,
        cost: CostStatus::Warning,
        ..SystemState::default()
    };
    degrade(tier, &worst, rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::test_tier;

    fn profiled_tier() -> Tier {
        let mut tier = test_tier("silver");
        tier.degrade_profile = ParamMap::from([
            ("max_output_tokens".to_string(), 512.0),
            ("top_k".to_string(), 4.0),
            ("timeout_ms".to_string(), 2_000.0),
            ("rerank".to_string(), 1.0),
            ("temperature".to_string(), 0.7),
        ]);
        tier
    }

    #[test]
    fn test_healthy_returns_profile() {
        let tier = profiled_tier();
        let params = degrade(&tier, &SystemState::default(), &DegradeRules::default());
        assert_eq!(params, tier.degrade_profile);
    }

    #[test]
    fn test_slo_unhealthy_tightens_with_floor() {
        let tier = profiled_tier();
        let state = SystemState {
            slo: SloStatus::Unhealthy,
            ..SystemState::default()
        };
        let params = degrade(&tier, &state, &DegradeRules::default());

        assert_eq!(params["max_output_tokens"], 256.0);
        // 4 - 5 clamps to the floor
        assert_eq!(params["top_k"], 1.0);
        assert_eq!(params["timeout_ms"], 1_500.0);
        assert_eq!(params["rerank"], 1.0);
        assert_eq!(params["temperature"], 0.7);
    }

    #[test]
    fn test_cost_warning_disables_optional_features() {
        let tier = profiled_tier();
        let state = SystemState {
            cost: CostStatus::Warning,
            ..SystemState::default()
        };
        let params = degrade(&tier, &state, &DegradeRules::default());

        assert_eq!(params["rerank"], 0.0);
        assert_eq!(params["max_output_tokens"], 256.0);
        assert_eq!(params["timeout_ms"], 2_000.0);
    }

    #[test]
    fn test_floors_apply_when_healthy() {
        let mut tier = profiled_tier();
        tier.degrade_profile.insert("max_output_tokens".to_string(), 10.0);
        let params = degrade(&tier, &SystemState::default(), &DegradeRules::default());
        assert_eq!(params["max_output_tokens"], 64.0);
    }

    #[test]
    fn test_deterministic() {
        let tier = profiled_tier();
        let state = SystemState {
            slo: SloStatus::Unhealthy,
            cost: CostStatus::Exceeded,
            ..SystemState::default()
        };
        let rules = DegradeRules::default();
        assert_eq!(degrade(&tier, &state, &rules), degrade(&tier, &state, &rules));
        assert_eq!(degrade(&tier, &state, &rules), degrade_hint(&tier, &rules));
    }
}
