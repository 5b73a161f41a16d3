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

//! Tier Registry
//!
//! A versioned, immutable catalog of SLA tiers plus the ordered rule table
//! used to resolve a tier for requests that do not name one. The engine holds
//! the registry behind an `Arc` and replaces it wholesale on policy updates,
//! so a decision always sees exactly one registry version.
//!
//! ## Resolution
//!
//! 1. An explicit tier on the request must exist in the registry.
//! 2. Otherwise the first rule whose predicates all match wins.
//! 3. No match fails closed: the engine sheds with `config_error`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, TierguardError};
use crate::event::RequestArrived;
use crate::gate::SystemMode;

/// Numeric response-quality parameters (degrade profiles and their output).
pub type ParamMap = BTreeMap<String, f64>;

/// Routing key: telemetry, buckets and controllers are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(service: &str, path: &str) -> Self {
        Self(format!("{}:{}", service, path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Key for per-(tier, route) limiter state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimitKey {
    pub tier: String,
    pub route: RouteKey,
}

impl LimitKey {
    pub fn new(tier: &str, route: &RouteKey) -> Self {
        Self {
            tier: tier.to_string(),
            route: route.clone(),
        }
    }
}

/// Caller-declared request importance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Importance {
    /// Weight added to the tier weight when the request waits in a queue.
    pub fn boost(self) -> f64 {
        match self {
            Importance::Low => 0.0,
            Importance::Normal => 1.0,
            Importance::High => 2.0,
            Importance::Critical => 4.0,
        }
    }
}

/// How early a tier gets blocked as the system mode escalates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Blocked from `slowdown` upward.
    Eager,
    /// Blocked from `block_aggressive` upward.
    #[default]
    Standard,
    /// Only blocked once entry halts.
    Protected,
}

impl DropPolicy {
    pub fn blocks_at(self) -> SystemMode {
        match self {
            DropPolicy::Eager => SystemMode::Slowdown,
            DropPolicy::Standard => SystemMode::BlockAggressive,
            DropPolicy::Protected => SystemMode::HaltEntry,
        }
    }
}

/// An SLA tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    pub name: String,
    /// Steady-state requests per second per route
    pub rps_max: f64,
    /// Bucket capacity per route
    pub burst: u32,
    /// In-flight limit per route
    pub concurrency_max: u32,
    /// Longest acceptable estimated queue wait
    pub queue_ms_max: u64,
    /// Relative deadline for queued requests
    pub deadline_ms: u64,
    /// Base WFQ weight
    pub weight: f64,
    #[serde(default)]
    pub drop_policy: DropPolicy,
    #[serde(default)]
    pub degrade_profile: ParamMap,
}

impl Tier {
    fn validate(&self) -> Result<()> {
        let fail = |what: &str| {
            Err(TierguardError::invalid_policy(format!(
                "tier {:?}: {}",
                self.name, what
            )))
        };

        if self.name.trim().is_empty() {
            return Err(TierguardError::invalid_policy("tier name must not be empty"));
        }
        if !self.rps_max.is_finite() || self.rps_max <= 0.0 {
            return fail("rps_max must be a positive number");
        }
        if self.burst == 0 {
            return fail("burst must be at least 1");
        }
        if self.concurrency_max == 0 {
            return fail("concurrency_max must be at least 1");
        }
        if self.deadline_ms == 0 {
            return fail("deadline_ms must be positive");
        }
        if !self.weight.is_finite() || self.weight <= 0.0 {
            return fail("weight must be a positive number");
        }
        if let Some((param, _)) = self.degrade_profile.iter().find(|(_, v)| !v.is_finite()) {
            return fail(&format!("degrade parameter {:?} is not a finite number", param));
        }
        Ok(())
    }
}

/// One row of the ordered tier-resolution table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierRule {
    pub tier: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub min_importance: Option<Importance>,
}

impl TierRule {
    pub fn matches(&self, request: &RequestArrived) -> bool {
        self.service
            .as_deref()
            .map_or(true, |service| service == request.service)
            && self
                .path_prefix
                .as_deref()
                .map_or(true, |prefix| request.path.starts_with(prefix))
            && self
                .tenant
                .as_deref()
                .map_or(true, |tenant| tenant == request.tenant)
            && self
                .min_importance
                .map_or(true, |min| request.importance >= min)
    }
}

/// Why a request could not be mapped to a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolved {
    UnknownTier(String),
    NoMatchingRule,
}

impl fmt::Display for Unresolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unresolved::UnknownTier(name) => write!(f, "unknown tier {:?}", name),
            Unresolved::NoMatchingRule => f.write_str("no tier rule matched"),
        }
    }
}

/// Immutable catalog of tiers for one policy version.
#[derive(Debug, Clone, Default)]
pub struct TierRegistry {
    version: u64,
    tiers: BTreeMap<String, Arc<Tier>>,
    rules: Vec<TierRule>,
}

impl TierRegistry {
    /// Validate and build a registry.
    pub fn build(version: u64, tiers: Vec<Tier>, rules: Vec<TierRule>) -> Result<Self> {
        let mut by_name = BTreeMap::new();
        for tier in tiers {
            tier.validate()?;
            let name = tier.name.clone();
            if by_name.insert(name.clone(), Arc::new(tier)).is_some() {
                return Err(TierguardError::invalid_policy(format!(
                    "duplicate tier {:?}",
                    name
                )));
            }
        }

        for rule in &rules {
            if !by_name.contains_key(&rule.tier) {
                return Err(TierguardError::invalid_policy(format!(
                    "rule references unknown tier {:?}",
                    rule.tier
                )));
            }
        }

        Ok(Self {
            version,
            tiers: by_name,
            rules,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Tier>> {
        self.tiers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    pub fn tiers(&self) -> impl Iterator<Item = &Arc<Tier>> {
        self.tiers.values()
    }

    pub fn rules(&self) -> &[TierRule] {
        &self.rules
    }

    pub fn resolve(&self, request: &RequestArrived) -> std::result::Result<Arc<Tier>, Unresolved> {
        if let Some(name) = request.tier.as_deref() {
            return self
                .tiers
                .get(name)
                .cloned()
                .ok_or_else(|| Unresolved::UnknownTier(name.to_string()));
        }

        self.rules
            .iter()
            .find(|rule| rule.matches(request))
            .and_then(|rule| self.tiers.get(&rule.tier).cloned())
            .ok_or(Unresolved::NoMatchingRule)
    }
}

#[cfg(test)]
pub(crate) fn test_tier(name: &str) -> Tier {
    Tier {
        name: name.to_string(),
        rps_max: 100.0,
        burst: 100,
        concurrency_max: 10,
        queue_ms_max: 2_000,
        deadline_ms: 5_000,
        weight: 1.0,
        drop_policy: DropPolicy::Standard,
        degrade_profile: ParamMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(service: &str, path: &str, tenant: &str) -> RequestArrived {
        RequestArrived {
            id: "r1".to_string(),
            service: service.to_string(),
            path: path.to_string(),
            tenant: tenant.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_duplicate_tiers() {
        let result = TierRegistry::build(1, vec![test_tier("gold"), test_tier("gold")], vec![]);
        assert!(matches!(result, Err(TierguardError::InvalidPolicy(_))));
    }

    #[test]
    fn test_rejects_invalid_numbers() {
        let mut tier = test_tier("gold");
        tier.rps_max = f64::NAN;
        assert!(TierRegistry::build(1, vec![tier], vec![]).is_err());

        let mut tier = test_tier("gold");
        tier.concurrency_max = 0;
        assert!(TierRegistry::build(1, vec![tier], vec![]).is_err());
    }

    #[test]
    fn test_rejects_rule_for_unknown_tier() {
        let rule = TierRule {
            tier: "platinum".to_string(),
            ..Default::default()
        };
        assert!(TierRegistry::build(1, vec![test_tier("gold")], vec![rule]).is_err());
    }

    #[test]
    fn test_explicit_tier_wins_over_rules() {
        let rules = vec![TierRule {
            tier: "bronze".to_string(),
            ..Default::default()
        }];
        let registry =
            TierRegistry::build(1, vec![test_tier("gold"), test_tier("bronze")], rules).unwrap();

        let mut req = request("search", "/v1/query", "acme");
        req.tier = Some("gold".to_string());
        assert_eq!(registry.resolve(&req).unwrap().name, "gold");

        req.tier = Some("missing".to_string());
        assert_eq!(
            registry.resolve(&req).unwrap_err(),
            Unresolved::UnknownTier("missing".to_string())
        );
    }

    #[test]
    fn test_rules_are_ordered() {
        let rules = vec![
            TierRule {
                tier: "gold".to_string(),
                tenant: Some("acme".to_string()),
                min_importance: Some(Importance::High),
                ..Default::default()
            },
            TierRule {
                tier: "silver".to_string(),
                service: Some("search".to_string()),
                path_prefix: Some("/v1/".to_string()),
                ..Default::default()
            },
            TierRule {
                tier: "bronze".to_string(),
                ..Default::default()
            },
        ];
        let registry = TierRegistry::build(
            1,
            vec![test_tier("gold"), test_tier("silver"), test_tier("bronze")],
            rules,
        )
        .unwrap();

        let mut req = request("search", "/v1/query", "acme");
        assert_eq!(registry.resolve(&req).unwrap().name, "silver");

        req.importance = Importance::Critical;
        assert_eq!(registry.resolve(&req).unwrap().name, "gold");

        let req = request("feed", "/home", "globex");
        assert_eq!(registry.resolve(&req).unwrap().name, "bronze");
    }

    #[test]
    fn test_no_rule_fails_closed() {
        let registry = TierRegistry::build(1, vec![test_tier("gold")], vec![]).unwrap();
        let req = request("search", "/v1/query", "acme");
        assert_eq!(registry.resolve(&req).unwrap_err(), Unresolved::NoMatchingRule);
    }
}
