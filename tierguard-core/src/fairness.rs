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

//! Tenant Fairness Governor
//!
//! Tracks each tenant's share of admitted requests in a fixed accounting
//! window and flags tenants above `max_share_pct`. The check runs before
//! admission, so a tenant can overshoot its cap by at most one request.
//!
//! Enforcement waits until the window holds `min_requests` admissions from
//! at least two tenants; a lone tenant always owns 100% of the window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct FairnessConfig {
    pub max_share_pct: f64,
    pub window: Duration,
    pub min_requests: u64,
}

impl Default for FairnessConfig {
    fn default() -> Self {
        Self {
            max_share_pct: 50.0,
            window: Duration::from_secs(60),
            min_requests: 20,
        }
    }
}

#[derive(Debug)]
pub struct FairnessGovernor {
    config: FairnessConfig,
    window_start: Instant,
    admitted: HashMap<String, u64>,
    total: u64,
}

impl FairnessGovernor {
    pub fn new(config: FairnessConfig, now: Instant) -> Self {
        Self {
            config,
            window_start: now,
            admitted: HashMap::new(),
            total: 0,
        }
    }

    pub fn is_enforcing(&self) -> bool {
        self.total >= self.config.min_requests && self.admitted.len() >= 2
    }

    /// Tenant share of the current window, in percent.
    pub fn share_pct(&self, tenant: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let count = self.admitted.get(tenant).copied().unwrap_or(0);
        count as f64 * 100.0 / self.total as f64
    }

    pub fn over_cap(&self, tenant: &str) -> bool {
        self.is_enforcing() && self.share_pct(tenant) > self.config.max_share_pct
    }

    pub fn record_admit(&mut self, tenant: &str) {
        *self.admitted.entry(tenant.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    /// Start a fresh window once the current one has run out.
    pub fn roll_window(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) < self.config.window {
            return false;
        }
        self.window_start = now;
        self.admitted.clear();
        self.total = 0;
        true
    }

    pub fn admitted(&self, tenant: &str) -> u64 {
        self.admitted.get(tenant).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn tenants(&self) -> usize {
        self.admitted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(now: Instant) -> FairnessGovernor {
        FairnessGovernor::new(
            FairnessConfig {
                max_share_pct: 50.0,
                window: Duration::from_secs(10),
                min_requests: 10,
            },
            now,
        )
    }

    #[test]
    fn test_single_tenant_is_never_capped() {
        let now = Instant::now();
        let mut gov = governor(now);
        for _ in 0..100 {
            gov.record_admit("acme");
        }
        assert_eq!(gov.share_pct("acme"), 100.0);
        assert!(!gov.over_cap("acme"));
    }

    #[test]
    fn test_cap_applies_after_warmup() {
        let now = Instant::now();
        let mut gov = governor(now);
        for _ in 0..7 {
            gov.record_admit("acme");
        }
        gov.record_admit("globex");
        assert!(!gov.over_cap("acme"));

        gov.record_admit("globex");
        gov.record_admit("acme");
        assert!(gov.is_enforcing());
        assert!(gov.over_cap("acme"));
        assert!(!gov.over_cap("globex"));
    }

    #[test]
    fn test_window_roll_resets() {
        let start = Instant::now();
        let mut gov = governor(start);
        gov.record_admit("acme");
        assert!(!gov.roll_window(start + Duration::from_secs(5)));
        assert!(gov.roll_window(start + Duration::from_secs(10)));
        assert_eq!(gov.total(), 0);
        assert_eq!(gov.admitted("acme"), 0);
    }

    #[test]
    fn test_share_overshoot_is_bounded() {
        let now = Instant::now();
        let mut gov = governor(now);
        // a greedy tenant asks nine times for every request of the other
        for i in 0..1_000 {
            let tenant = if i % 10 == 0 { "globex" } else { "acme" };
            if !gov.over_cap(tenant) {
                gov.record_admit(tenant);
            }
            if gov.is_enforcing() {
                let slack = 100.0 / gov.total() as f64;
                assert!(gov.share_pct("acme") <= 50.0 + slack);
            }
        }
    }
}
