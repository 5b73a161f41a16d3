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

//! Feedback Controller
//!
//! Latency telemetry per route is smoothed by an [`Ewma`] and fed to a
//! [`Pid`] loop whose output is a rate multiplier in
//! `[MIN_MULTIPLIER, MAX_MULTIPLIER]`:
//!
//! ```text
//! error      = ewma_p95 - target
//! multiplier = clamp(1 - (Kp·e + Ki·I + Kd·D) / 1000, 0.1, 2.0)
//! ```
//!
//! The engine rescales every bucket of the route with the multiplier. Routes
//! whose telemetry goes quiet drift back to a neutral 1.0 on each tick.

mod ewma;
mod pid;

pub use ewma::Ewma;
pub use pid::{Pid, PidGains};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Result, TierguardError};
use crate::event::TelemetrySample;
use crate::tier::RouteKey;

pub const MIN_MULTIPLIER: f64 = 0.1;
pub const MAX_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// EWMA smoothing factor in (0, 1]
    pub ewma_alpha: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Anti-windup bound for the integral term
    pub integral_limit: f64,
    /// PID updates per route are at least this far apart
    pub min_update_interval_ms: u64,
    /// Telemetry silence after which the multiplier decays toward 1.0
    pub stale_after_secs: u64,
    pub decay_per_sec: f64,
    /// Target for routes without an explicit one
    pub default_target_p95_ms: Option<f64>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.3,
            kp: 1.0,
            ki: 0.2,
            kd: 0.1,
            integral_limit: 5_000.0,
            min_update_interval_ms: 1_000,
            stale_after_secs: 30,
            decay_per_sec: 0.05,
            default_target_p95_ms: None,
        }
    }
}

impl ControllerConfig {
    pub fn gains(&self) -> PidGains {
        PidGains {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
            integral_limit: self.integral_limit,
        }
    }

    pub fn min_update_interval(&self) -> Duration {
        Duration::from_millis(self.min_update_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(TierguardError::invalid_policy(
                "controller ewma_alpha must be in (0, 1]",
            ));
        }
        if ![self.kp, self.ki, self.kd].iter().all(|g| g.is_finite()) {
            return Err(TierguardError::invalid_policy(
                "controller gains must be finite",
            ));
        }
        if !self.integral_limit.is_finite() || self.integral_limit <= 0.0 {
            return Err(TierguardError::invalid_policy(
                "controller integral_limit must be positive",
            ));
        }
        if !self.decay_per_sec.is_finite() || self.decay_per_sec < 0.0 {
            return Err(TierguardError::invalid_policy(
                "controller decay_per_sec must not be negative",
            ));
        }
        if let Some(target) = self.default_target_p95_ms {
            validate_target(target)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_target(target: f64) -> Result<()> {
    if target.is_finite() && target > 0.0 {
        Ok(())
    } else {
        Err(TierguardError::invalid_policy(format!(
            "latency target {} must be a positive number",
            target
        )))
    }
}

/// Controller state attached to `RateUpdated` events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub target_ms: Option<f64>,
    pub ewma_ms: Option<f64>,
    pub integral: f64,
    pub last_error: f64,
    pub multiplier: f64,
}

#[derive(Debug)]
struct RouteController {
    target_ms: f64,
    ewma: Ewma,
    pid: Pid,
    multiplier: f64,
    last_update: Option<Instant>,
    last_sample: Option<Instant>,
    last_decay: Option<Instant>,
}

impl RouteController {
    fn new(target_ms: f64, config: &ControllerConfig) -> Self {
        Self {
            target_ms,
            ewma: Ewma::new(config.ewma_alpha),
            pid: Pid::new(config.gains()),
            multiplier: 1.0,
            last_update: None,
            last_sample: None,
            last_decay: None,
        }
    }

    fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            target_ms: Some(self.target_ms),
            ewma_ms: self.ewma.value(),
            integral: self.pid.integral(),
            last_error: self.pid.last_error(),
            multiplier: self.multiplier,
        }
    }
}

/// Per-route EWMA + PID loops.
#[derive(Debug)]
pub struct FeedbackController {
    config: ControllerConfig,
    targets: BTreeMap<RouteKey, f64>,
    routes: HashMap<RouteKey, RouteController>,
}

impl FeedbackController {
    pub fn new(config: ControllerConfig, targets: BTreeMap<RouteKey, f64>) -> Self {
        let mut controller = Self {
            config,
            targets: BTreeMap::new(),
            routes: HashMap::new(),
        };
        controller.set_targets(targets);
        controller
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn target_for(&self, route: &RouteKey) -> Option<f64> {
        self.targets
            .get(route)
            .copied()
            .or(self.config.default_target_p95_ms)
    }

    /// Current multiplier for `route`; 1.0 when nothing controls it.
    pub fn multiplier(&self, route: &RouteKey) -> f64 {
        self.routes.get(route).map_or(1.0, |state| state.multiplier)
    }

    pub fn snapshot(&self, route: &RouteKey) -> ControllerSnapshot {
        match self.routes.get(route) {
            Some(state) => state.snapshot(),
            None => ControllerSnapshot {
                target_ms: self.target_for(route),
                multiplier: 1.0,
                ..ControllerSnapshot::default()
            },
        }
    }

    /// Feed one telemetry sample.
    ///
    /// Returns the new multiplier when the PID loop ran, `None` when the
    /// sample only fed the EWMA or the route has no target.
    pub fn record_sample(&mut self, sample: &TelemetrySample, now: Instant) -> Result<Option<f64>> {
        let route = sample.route();
        for (field, value) in [
            ("latency_p95_ms", sample.latency_p95_ms),
            ("latency_p50_ms", sample.latency_p50_ms),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(TierguardError::InvalidTelemetry {
                    route: route.to_string(),
                    reason: format!("{} is {}", field, value),
                });
            }
        }

        let Some(target) = self.target_for(&route) else {
            debug!(route = %route, "no latency target, sample ignored");
            return Ok(None);
        };

        let config = &self.config;
        let state = self
            .routes
            .entry(route.clone())
            .or_insert_with(|| RouteController::new(target, config));
        state.target_ms = target;
        state.last_sample = Some(now);
        state.last_decay = None;

        let smoothed = state.ewma.update(sample.latency_p95_ms);
        let interval = config.min_update_interval();
        let dt = match state.last_update {
            Some(last) if now.saturating_duration_since(last) < interval => return Ok(None),
            Some(last) => now.saturating_duration_since(last).as_secs_f64(),
            None => interval.as_secs_f64().max(f64::EPSILON),
        };

        let correction = state.pid.update(smoothed - target, dt);
        state.multiplier = (1.0 - correction / 1_000.0).clamp(MIN_MULTIPLIER, MAX_MULTIPLIER);
        state.last_update = Some(now);

        debug!(
            route = %route,
            ewma_ms = smoothed,
            target_ms = target,
            multiplier = state.multiplier,
            "controller updated"
        );
        Ok(Some(state.multiplier))
    }

    /// Move the multiplier of every stale route toward 1.0.
    ///
    /// Returns the routes whose multiplier changed.
    pub fn decay_stale(&mut self, now: Instant) -> Vec<RouteKey> {
        let stale_after = self.config.stale_after();
        let decay_per_sec = self.config.decay_per_sec;
        let mut changed = Vec::new();

        for (route, state) in self.routes.iter_mut() {
            let Some(last_sample) = state.last_sample else {
                continue;
            };
            if now.saturating_duration_since(last_sample) < stale_after {
                continue;
            }

            // the next sample starts over as if the route were new
            state.pid.reset();
            state.ewma.reset();
            state.last_update = None;
            let since = state.last_decay.unwrap_or(last_sample + stale_after);
            state.last_decay = Some(now);
            if state.multiplier == 1.0 {
                continue;
            }

            let step = decay_per_sec * now.saturating_duration_since(since).as_secs_f64();
            let previous = state.multiplier;
            state.multiplier = if previous < 1.0 {
                (previous + step).min(1.0)
            } else {
                (previous - step).max(1.0)
            };
            if state.multiplier != previous {
                changed.push(route.clone());
            }
        }

        changed.sort();
        changed
    }

    /// Replace the latency targets.
    ///
    /// Routes left without any target lose their controller; those that
    /// were not neutral are returned so their buckets can be reset.
    pub fn set_targets(&mut self, targets: BTreeMap<RouteKey, f64>) -> Vec<RouteKey> {
        self.targets = targets;

        let mut reset = Vec::new();
        let default_target = self.config.default_target_p95_ms;
        let targets = &self.targets;
        self.routes.retain(|route, state| {
            match targets.get(route).copied().or(default_target) {
                Some(target) => {
                    state.target_ms = target;
                    true
                }
                None => {
                    if state.multiplier != 1.0 {
                        reset.push(route.clone());
                    }
                    false
                }
            }
        });

        for (route, target) in self.targets.iter() {
            if !self.routes.contains_key(route) {
                self.routes
                    .insert(route.clone(), RouteController::new(*target, &self.config));
            }
        }

        reset.sort();
        reset
    }

    pub fn routes(&self) -> impl Iterator<Item = &RouteKey> {
        self.routes.keys()
    }
}
