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

//! Weighted Fair Queue with Aging
//!
//! One queue per tier. Entries are served by priority
//!
//! ```text
//! priority = tier.weight + importance.boost() + age_secs / aging_half_life_secs
//! ```
//!
//! recomputed at every drain, so long waiters eventually overtake heavier
//! newcomers. Equal priorities keep arrival order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::event::{Reason, RequestArrived};
use crate::tier::{RouteKey, Tier};

/// A deferred request.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub request: RequestArrived,
    pub tier: String,
    pub route: RouteKey,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    /// `ConcurrencyLimit` or `Fairness`
    pub reason: Reason,
    pub seq: u64,
    base_weight: f64,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        &self.request.id
    }

    pub fn tenant(&self) -> &str {
        &self.request.tenant
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn priority(&self, now: Instant, aging_half_life: Duration) -> f64 {
        let age = now.saturating_duration_since(self.enqueued_at).as_secs_f64();
        let half_life = aging_half_life.as_secs_f64().max(f64::EPSILON);
        self.base_weight + age / half_life
    }
}

#[derive(Debug)]
pub struct WeightedFairQueue {
    aging_half_life: Duration,
    next_seq: u64,
    queues: BTreeMap<String, Vec<QueueEntry>>,
    /// request id -> tier
    index: HashMap<String, String>,
}

impl WeightedFairQueue {
    pub fn new(aging_half_life: Duration) -> Self {
        Self {
            aging_half_life,
            next_seq: 0,
            queues: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn depth(&self, tier: &str) -> usize {
        self.queues.get(tier).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.index.contains_key(request_id)
    }

    /// Append a request; returns its arrival-order depth (1-based).
    pub fn push(
        &mut self,
        request: RequestArrived,
        tier: &Tier,
        reason: Reason,
        deadline: Instant,
        now: Instant,
    ) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = QueueEntry {
            route: request.route(),
            base_weight: tier.weight + request.importance.boost(),
            request,
            tier: tier.name.clone(),
            enqueued_at: now,
            deadline,
            reason,
            seq,
        };
        self.index
            .insert(entry.request.id.clone(), tier.name.clone());
        let queue = self.queues.entry(tier.name.clone()).or_default();
        queue.push(entry);
        queue.len()
    }

    /// Sequence numbers of a tier's entries, highest priority first.
    pub fn priority_order(&self, tier: &str, now: Instant) -> Vec<u64> {
        let Some(queue) = self.queues.get(tier) else {
            return Vec::new();
        };
        let mut ranked: Vec<(f64, u64)> = queue
            .iter()
            .map(|entry| (entry.priority(now, self.aging_half_life), entry.seq))
            .collect();
        ranked.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        ranked.into_iter().map(|(_, seq)| seq).collect()
    }

    /// Current 1-based priority position of a queued request.
    pub fn position(&self, request_id: &str, now: Instant) -> Option<(&QueueEntry, usize)> {
        let tier = self.index.get(request_id)?;
        let queue = self.queues.get(tier)?;
        let entry = queue.iter().find(|entry| entry.id() == request_id)?;
        let pos = self
            .priority_order(tier, now)
            .iter()
            .position(|seq| *seq == entry.seq)?;
        Some((entry, pos + 1))
    }

    pub fn get(&self, tier: &str, seq: u64) -> Option<&QueueEntry> {
        self.queues.get(tier)?.iter().find(|entry| entry.seq == seq)
    }

    pub fn remove(&mut self, tier: &str, seq: u64) -> Option<QueueEntry> {
        let queue = self.queues.get_mut(tier)?;
        let idx = queue.iter().position(|entry| entry.seq == seq)?;
        let entry = queue.remove(idx);
        self.index.remove(entry.id());
        if queue.is_empty() {
            self.queues.remove(tier);
        }
        Some(entry)
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<QueueEntry> {
        let mut expired = Vec::new();
        for queue in self.queues.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = queue
                .drain(..)
                .partition(|entry| entry.is_expired(now));
            *queue = kept;
            expired.extend(gone);
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        for entry in &expired {
            self.index.remove(entry.id());
        }
        expired.sort_by_key(|entry| entry.seq);
        expired
    }

    /// Remove the queues of tiers for which `keep` is false.
    pub fn retain_tiers(&mut self, keep: impl Fn(&str) -> bool) -> Vec<QueueEntry> {
        let obsolete: Vec<String> = self
            .queues
            .keys()
            .filter(|tier| !keep(tier.as_str()))
            .cloned()
            .collect();

        let mut removed = Vec::new();
        for tier in obsolete {
            if let Some(entries) = self.queues.remove(&tier) {
                removed.extend(entries);
            }
        }
        for entry in &removed {
            self.index.remove(entry.id());
        }
        removed.sort_by_key(|entry| entry.seq);
        removed
    }

    pub fn tiers(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn depths(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(tier, queue)| (tier.clone(), queue.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::{test_tier, Importance};
    use proptest::prelude::*;

    fn request(id: &str, importance: Importance) -> RequestArrived {
        RequestArrived {
            id: id.to_string(),
            service: "search".to_string(),
            path: "/q".to_string(),
            tenant: "acme".to_string(),
            importance,
            ..Default::default()
        }
    }

    fn enqueue(
        queue: &mut WeightedFairQueue,
        id: &str,
        importance: Importance,
        now: Instant,
    ) -> usize {
        let tier = test_tier("bronze");
        queue.push(
            request(id, importance),
            &tier,
            Reason::ConcurrencyLimit,
            now + Duration::from_secs(60),
            now,
        )
    }

    fn ids(queue: &WeightedFairQueue, now: Instant) -> Vec<String> {
        queue
            .priority_order("bronze", now)
            .into_iter()
            .filter_map(|seq| queue.get("bronze", seq))
            .map(|entry| entry.id().to_string())
            .collect()
    }

    #[test]
    fn test_importance_orders_entries() {
        let now = Instant::now();
        let mut queue = WeightedFairQueue::new(Duration::from_secs(5));
        enqueue(&mut queue, "low", Importance::Low, now);
        enqueue(&mut queue, "critical", Importance::Critical, now);
        assert_eq!(enqueue(&mut queue, "normal", Importance::Normal, now), 3);

        assert_eq!(ids(&queue, now), vec!["critical", "normal", "low"]);
        assert_eq!(queue.position("low", now).map(|(_, pos)| pos), Some(3));
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let now = Instant::now();
        let mut queue = WeightedFairQueue::new(Duration::from_secs(5));
        for id in ["a", "b", "c"] {
            enqueue(&mut queue, id, Importance::Normal, now);
        }
        assert_eq!(ids(&queue, now), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_aging_prevents_starvation() {
        let start = Instant::now();
        let mut queue = WeightedFairQueue::new(Duration::from_secs(5));
        enqueue(&mut queue, "old-low", Importance::Low, start);

        // 25s of age is worth 5 priority points, more than critical's boost
        let later = start + Duration::from_secs(25);
        enqueue(&mut queue, "new-critical", Importance::Critical, later);
        assert_eq!(ids(&queue, later), vec!["old-low", "new-critical"]);
    }

    #[test]
    fn test_expire_removes_only_overdue() {
        let start = Instant::now();
        let tier = test_tier("bronze");
        let mut queue = WeightedFairQueue::new(Duration::from_secs(5));
        queue.push(
            request("soon", Importance::Normal),
            &tier,
            Reason::ConcurrencyLimit,
            start + Duration::from_millis(100),
            start,
        );
        queue.push(
            request("later", Importance::Normal),
            &tier,
            Reason::Fairness,
            start + Duration::from_secs(10),
            start,
        );

        let expired = queue.expire(start + Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id(), "soon");
        assert!(!queue.contains("soon"));
        assert!(queue.contains("later"));
        assert_eq!(queue.depth("bronze"), 1);
    }

    #[test]
    fn test_remove_and_retain_tiers() {
        let now = Instant::now();
        let mut queue = WeightedFairQueue::new(Duration::from_secs(5));
        enqueue(&mut queue, "a", Importance::Normal, now);
        let gold = test_tier("gold");
        queue.push(
            request("g", Importance::Normal),
            &gold,
            Reason::Fairness,
            now + Duration::from_secs(1),
            now,
        );

        let seq = queue.priority_order("bronze", now)[0];
        assert_eq!(queue.remove("bronze", seq).unwrap().id(), "a");
        assert_eq!(queue.depth("bronze"), 0);

        let removed = queue.retain_tiers(|tier| tier != "gold");
        assert_eq!(removed.len(), 1);
        assert!(queue.is_empty());
        assert!(queue.depths().is_empty());
    }

    proptest! {
        #[test]
        fn prop_expire_leaves_no_overdue_entries(
            deadlines in prop::collection::vec(1u64..10_000, 1..50),
            check_at in 0u64..12_000,
        ) {
            let start = Instant::now();
            let tier = test_tier("bronze");
            let mut queue = WeightedFairQueue::new(Duration::from_secs(5));
            for (i, ms) in deadlines.iter().enumerate() {
                queue.push(
                    request(&format!("r{}", i), Importance::Normal),
                    &tier,
                    Reason::ConcurrencyLimit,
                    start + Duration::from_millis(*ms),
                    start,
                );
            }

            let now = start + Duration::from_millis(check_at);
            let expired = queue.expire(now);
            prop_assert_eq!(expired.len() + queue.len(), deadlines.len());
            for seq in queue.priority_order("bronze", now) {
                let entry = queue.get("bronze", seq).unwrap();
                prop_assert!(!entry.is_expired(now));
            }
        }
    }
}
