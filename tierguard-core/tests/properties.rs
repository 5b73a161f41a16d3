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

//! Randomized invariants over long engine runs.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tierguard_core::{
    AdmissionEngine, CompletionSignal, DropPolicy, EngineConfig, Outbound, ParamMap,
    PolicyUpdate, Reason, RequestArrived, RouteKey, Tier,
};

const TENANTS: [&str; 3] = ["acme", "globex", "initech"];
const ROUTES: [&str; 2] = ["/q", "/suggest"];

#[derive(Debug, Clone)]
enum Op {
    Arrive { tenant: usize, route: usize },
    Complete(usize),
    Advance(u64),
    Tick,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0..TENANTS.len(), 0..ROUTES.len())
            .prop_map(|(tenant, route)| Op::Arrive { tenant, route }),
        2 => (0usize..64).prop_map(Op::Complete),
        2 => (1u64..300).prop_map(Op::Advance),
        1 => Just(Op::Tick),
    ]
}

fn bronze(concurrency_max: u32, deadline_ms: u64) -> Tier {
    Tier {
        name: "bronze".to_string(),
        rps_max: 10_000.0,
        burst: 10_000,
        concurrency_max,
        queue_ms_max: 60_000,
        deadline_ms,
        weight: 1.0,
        drop_policy: DropPolicy::Standard,
        degrade_profile: ParamMap::new(),
    }
}

fn engine(tier: Tier, config: EngineConfig, now: Instant) -> AdmissionEngine {
    let policy = PolicyUpdate {
        tiers: vec![tier],
        ..Default::default()
    };
    AdmissionEngine::new(config, policy, now).unwrap()
}

fn request(id: usize, tenant: usize, route: usize) -> RequestArrived {
    RequestArrived {
        id: format!("r{}", id),
        service: "search".to_string(),
        path: ROUTES[route].to_string(),
        tier: Some("bronze".to_string()),
        tenant: TENANTS[tenant].to_string(),
        ..Default::default()
    }
}

/// Test-side bookkeeping of everything the engine reported.
#[derive(Default)]
struct Ledger {
    /// queued id -> deadline
    queued: HashMap<String, Instant>,
    admitted: Vec<String>,
    per_tenant: BTreeMap<String, u64>,
    total: u64,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_concurrency_never_exceeds_limit(
        limit in 1u32..5,
        ops in prop::collection::vec(op(), 1..300),
    ) {
        let mut now = Instant::now();
        let mut engine = engine(bronze(limit, 2_000), EngineConfig::default(), now);
        let mut ledger = Ledger::default();
        let mut next_id = 0;

        for op in ops {
            match op {
                Op::Arrive { tenant, route } => {
                    let decision = engine.arrive(request(next_id, tenant, route), now);
                    next_id += 1;
                    if decision.is_admit() {
                        ledger.admitted.push(decision.request_id);
                    }
                }
                Op::Complete(idx) => {
                    if !ledger.admitted.is_empty() {
                        let id = ledger.admitted.remove(idx % ledger.admitted.len());
                        engine.complete(&CompletionSignal { id }, now);
                    }
                }
                Op::Advance(ms) => now += Duration::from_millis(ms),
                Op::Tick => {
                    engine.tick(now);
                    for event in engine.take_outbound() {
                        if let Some(d) = event.as_decision().filter(|d| d.is_admit()) {
                            ledger.admitted.push(d.request_id.clone());
                        }
                    }
                }
            }
            engine.take_outbound();

            for path in ROUTES {
                let route = RouteKey::new("search", path);
                prop_assert!(engine.concurrency("bronze", &route) <= limit);
            }
        }
    }

    #[test]
    fn prop_queued_requests_never_admitted_late(
        deadline_ms in 100u64..1_500,
        ops in prop::collection::vec(op(), 1..300),
    ) {
        let mut now = Instant::now();
        let mut engine = engine(bronze(2, deadline_ms), EngineConfig::default(), now);
        let mut ledger = Ledger::default();
        let mut next_id = 0;

        for op in ops {
            match op {
                Op::Arrive { tenant, route } => {
                    engine.arrive(request(next_id, tenant, route), now);
                    next_id += 1;
                }
                Op::Complete(idx) => {
                    if !ledger.admitted.is_empty() {
                        let id = ledger.admitted.remove(idx % ledger.admitted.len());
                        engine.complete(&CompletionSignal { id }, now);
                    }
                }
                Op::Advance(ms) => now += Duration::from_millis(ms),
                Op::Tick => engine.tick(now),
            }

            for event in engine.take_outbound() {
                let Outbound::AdmissionDecision(d) = event else { continue };
                match d.rationale {
                    Reason::ConcurrencyLimit | Reason::Fairness => {
                        ledger
                            .queued
                            .insert(d.request_id.clone(), now + Duration::from_millis(deadline_ms));
                    }
                    Reason::AdmittedFromQueue => {
                        let deadline = ledger.queued.remove(&d.request_id).unwrap();
                        prop_assert!(now < deadline, "admitted after its deadline");
                        ledger.admitted.push(d.request_id);
                    }
                    Reason::Admitted => ledger.admitted.push(d.request_id),
                    Reason::DeadlineViolation => {
                        ledger.queued.remove(&d.request_id);
                    }
                    _ => {}
                }
            }

            if matches!(op, Op::Tick) {
                for (id, deadline) in &ledger.queued {
                    prop_assert!(*deadline > now, "{} outlived its deadline by a tick", id);
                }
            }
        }
    }

    #[test]
    fn prop_tenant_over_cap_is_never_admitted(
        weights in prop::collection::vec(1usize..10, TENANTS.len()),
        ops in prop::collection::vec(op(), 1..400),
    ) {
        let mut now = Instant::now();
        let config = EngineConfig {
            fairness_min_requests: 10,
            ..EngineConfig::default()
        };
        let mut engine = engine(bronze(10_000, 60_000), config.clone(), now);
        let mut ledger = Ledger::default();
        let mut next_id = 0;
        // skew arrivals by tenant weight
        let schedule: Vec<usize> = weights
            .iter()
            .enumerate()
            .flat_map(|(tenant, w)| std::iter::repeat(tenant).take(*w))
            .collect();

        for op in ops {
            match op {
                Op::Arrive { tenant, route } => {
                    let tenant = schedule[(tenant + next_id) % schedule.len()];
                    engine.arrive(request(next_id, tenant, route), now);
                    next_id += 1;
                }
                Op::Advance(ms) => now += Duration::from_millis(ms.min(100)),
                Op::Tick => engine.tick(now),
                Op::Complete(_) => {}
            }

            for event in engine.take_outbound() {
                let Outbound::AdmissionDecision(d) = event else { continue };
                if !d.is_admit() {
                    continue;
                }
                let count = ledger.per_tenant.get(&d.tenant).copied().unwrap_or(0);
                let enforcing = ledger.total >= config.fairness_min_requests
                    && ledger.per_tenant.len() >= 2;
                if enforcing {
                    let share = count as f64 * 100.0 / ledger.total as f64;
                    prop_assert!(
                        share <= config.max_share_pct_per_tenant,
                        "{} admitted at {:.1}% share",
                        d.tenant,
                        share
                    );
                }
                *ledger.per_tenant.entry(d.tenant.clone()).or_insert(0) += 1;
                ledger.total += 1;
            }
        }
    }
}
