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

//! Token Bucket Limiter
//!
//! One lazily created bucket per (tier, route). Refill happens on access:
//! `elapsed × refill_rate` tokens are added, capped at `max_tokens`, before
//! each check. The feedback controller rescales buckets through
//! [`BucketLimiter::rescale_route`].

use std::collections::HashMap;
use std::time::Instant;

use crate::tier::{LimitKey, RouteKey, Tier, TierRegistry};

/// Bucket rate and capacity for `tier` under a controller multiplier.
pub fn bucket_params(tier: &Tier, multiplier: f64) -> (f64, f64) {
    let refill_rate = tier.rps_max * multiplier;
    let max_tokens = (tier.burst as f64 * multiplier).max(1.0);
    (refill_rate, max_tokens)
}

/// Outcome of a single bucket check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketCheck {
    pub allowed: bool,
    pub tokens_remaining: f64,
    /// Suggested wait before retrying (0 when allowed)
    pub wait_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(max_tokens: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        // Instants older than the last refill add nothing.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if now > self.last_refill {
            self.last_refill = now;
        }
        let added = elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + added).clamp(0.0, self.max_tokens);
    }

    /// Refill, then try to take one token.
    pub fn try_acquire(&mut self, now: Instant) -> BucketCheck {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            BucketCheck {
                allowed: true,
                tokens_remaining: self.tokens,
                wait_ms: 0,
            }
        } else {
            BucketCheck {
                allowed: false,
                tokens_remaining: self.tokens,
                wait_ms: self.wait_ms(),
            }
        }
    }

    /// Replace rate and capacity; tokens are re-capped to the new maximum.
    pub fn rescale(&mut self, refill_rate: f64, max_tokens: f64, now: Instant) {
        self.refill(now);
        self.refill_rate = refill_rate;
        self.max_tokens = max_tokens;
        self.tokens = self.tokens.min(max_tokens);
    }

    pub fn wait_ms(&self) -> u64 {
        if self.refill_rate <= 0.0 {
            return u64::MAX;
        }
        (1000.0 / self.refill_rate).ceil() as u64
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

/// All buckets, keyed by (tier, route).
#[derive(Debug, Default)]
pub struct BucketLimiter {
    buckets: HashMap<LimitKey, TokenBucket>,
}

impl BucketLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(
        &mut self,
        tier: &Tier,
        route: &RouteKey,
        multiplier: f64,
        now: Instant,
    ) -> BucketCheck {
        let bucket = self
            .buckets
            .entry(LimitKey::new(&tier.name, route))
            .or_insert_with(|| {
                let (refill_rate, max_tokens) = bucket_params(tier, multiplier);
                TokenBucket::new(max_tokens, refill_rate, now)
            });
        bucket.try_acquire(now)
    }

    /// Rescale the buckets of one route in every tier of `registry`.
    pub fn rescale_route(
        &mut self,
        registry: &TierRegistry,
        route: &RouteKey,
        multiplier: f64,
        now: Instant,
    ) {
        for tier in registry.tiers() {
            if let Some(bucket) = self.buckets.get_mut(&LimitKey::new(&tier.name, route)) {
                let (refill_rate, max_tokens) = bucket_params(tier, multiplier);
                bucket.rescale(refill_rate, max_tokens, now);
            }
        }
    }

    /// Follow a registry swap: drop buckets of removed tiers, resize the rest.
    pub fn apply_registry(
        &mut self,
        registry: &TierRegistry,
        multiplier_for: impl Fn(&RouteKey) -> f64,
        now: Instant,
    ) {
        self.buckets.retain(|key, _| registry.contains(&key.tier));
        for (key, bucket) in self.buckets.iter_mut() {
            if let Some(tier) = registry.get(&key.tier) {
                let (refill_rate, max_tokens) = bucket_params(tier, multiplier_for(&key.route));
                bucket.rescale(refill_rate, max_tokens, now);
            }
        }
    }

    pub fn get(&self, tier: &str, route: &RouteKey) -> Option<&TokenBucket> {
        self.buckets.get(&LimitKey::new(tier, route))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
