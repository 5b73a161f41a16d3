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

//! Dispatcher - single-owner actor around the admission engine
//!
//! Every inbound event travels over a bounded channel to one task that owns
//! the [`AdmissionEngine`]. The task stamps each event with the time it is
//! handled, runs the periodic maintenance tick and forwards everything the
//! engine emits to a bounded outbound channel.
//!
//! ```text
//! policy ──────┐
//! system ──────┤                     ┌─► outbound channel
//! completions ─┼─► AdmissionEngine ──┤
//! telemetry ───┤         ▲           └─► QueueSnapshot (RwLock)
//! arrivals ────┘         └── tick interval
//! ```
//!
//! Control events (policy, system state, completions) are polled before
//! telemetry and arrivals so a burst of arrivals cannot hide a freeze or a
//! freed slot. A full outbound channel drops the event with a warning; the
//! engine never waits on a slow consumer.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use tierguard_core::{
    AdmissionDecision, AdmissionEngine, CompletionSignal, Inbound, Outbound, PolicyUpdate,
    QueueSnapshot, RequestArrived, SystemStateChange, TelemetrySample,
};

/// Configuration for the dispatcher task.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maintenance tick interval
    pub tick_interval_ms: u64,
    /// Capacity of each inbound channel (backpressure control)
    pub channel_capacity: usize,
    /// Capacity of the outbound channel
    pub outbound_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            channel_capacity: 1_024,
            outbound_capacity: 4_096,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher is shut down")]
    Closed,

    #[error("dispatcher dropped the request without a decision")]
    NoResponse,
}

/// Internal message for the arrival channel.
struct Arrival {
    request: RequestArrived,
    respond: Option<oneshot::Sender<AdmissionDecision>>,
}

/// Handle to interact with the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    arrivals: mpsc::Sender<Arrival>,
    completions: mpsc::Sender<CompletionSignal>,
    telemetry: mpsc::Sender<TelemetrySample>,
    system: mpsc::Sender<SystemStateChange>,
    policy: mpsc::Sender<PolicyUpdate>,
    snapshot: Arc<RwLock<QueueSnapshot>>,
}

impl DispatcherHandle {
    /// Submit a request and wait for its immediate decision.
    pub async fn admit(&self, request: RequestArrived) -> Result<AdmissionDecision, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.arrivals
            .send(Arrival {
                request,
                respond: Some(tx),
            })
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::NoResponse)
    }

    pub async fn complete(&self, signal: CompletionSignal) -> Result<(), DispatchError> {
        self.completions
            .send(signal)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    pub async fn telemetry(&self, sample: TelemetrySample) -> Result<(), DispatchError> {
        self.telemetry
            .send(sample)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    pub async fn system_change(&self, change: SystemStateChange) -> Result<(), DispatchError> {
        self.system
            .send(change)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    pub async fn policy(&self, update: PolicyUpdate) -> Result<(), DispatchError> {
        self.policy
            .send(update)
            .await
            .map_err(|_| DispatchError::Closed)
    }

    /// Route a decoded inbound event. Arrivals sent this way are
    /// fire-and-forget; their decision only appears on the outbound stream.
    pub async fn submit(&self, event: Inbound) -> Result<(), DispatchError> {
        match event {
            Inbound::RequestArrived(request) => self
                .arrivals
                .send(Arrival {
                    request,
                    respond: None,
                })
                .await
                .map_err(|_| DispatchError::Closed),
            Inbound::CompletionSignal(signal) => self.complete(signal).await,
            Inbound::TelemetrySample(sample) => self.telemetry(sample).await,
            Inbound::SystemStateChange(change) => self.system_change(change).await,
            Inbound::PolicyUpdate(update) => self.policy(update).await,
        }
    }

    /// Most recently published queue snapshot.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.read().clone()
    }
}

/// Owns the engine until every handle is dropped.
pub struct Dispatcher {
    engine: AdmissionEngine,
    config: DispatcherConfig,
}

struct Inboxes {
    arrivals: mpsc::Receiver<Arrival>,
    completions: mpsc::Receiver<CompletionSignal>,
    telemetry: mpsc::Receiver<TelemetrySample>,
    system: mpsc::Receiver<SystemStateChange>,
    policy: mpsc::Receiver<PolicyUpdate>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl Dispatcher {
    pub fn new(engine: AdmissionEngine, config: DispatcherConfig) -> Self {
        Self { engine, config }
    }

    /// Spawn the dispatcher task. Returns the handle, the outbound stream and
    /// the task's join handle; the task ends once every handle is dropped.
    pub fn spawn(self) -> (DispatcherHandle, mpsc::Receiver<Outbound>, JoinHandle<()>) {
        let capacity = self.config.channel_capacity.max(1);
        let (arrivals_tx, arrivals) = mpsc::channel(capacity);
        let (completions_tx, completions) = mpsc::channel(capacity);
        let (telemetry_tx, telemetry) = mpsc::channel(capacity);
        let (system_tx, system) = mpsc::channel(capacity);
        let (policy_tx, policy) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(self.config.outbound_capacity.max(1));

        let snapshot = Arc::new(RwLock::new(self.engine.snapshot()));
        let handle = DispatcherHandle {
            arrivals: arrivals_tx,
            completions: completions_tx,
            telemetry: telemetry_tx,
            system: system_tx,
            policy: policy_tx,
            snapshot: Arc::clone(&snapshot),
        };
        let inboxes = Inboxes {
            arrivals,
            completions,
            telemetry,
            system,
            policy,
        };

        let task = tokio::spawn(self.run(inboxes, out_tx, snapshot));
        (handle, out_rx, task)
    }

    async fn run(
        mut self,
        mut inboxes: Inboxes,
        outbound: mpsc::Sender<Outbound>,
        snapshot: Arc<RwLock<QueueSnapshot>>,
    ) {
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut policy_open = true;
        let mut system_open = true;
        let mut completions_open = true;
        let mut telemetry_open = true;
        let mut arrivals_open = true;
        let mut dropped: u64 = 0;

        info!(
            tick_ms = self.config.tick_interval_ms,
            "Dispatcher started"
        );

        while policy_open || system_open || completions_open || telemetry_open || arrivals_open {
            let mut publish = false;

            tokio::select! {
                biased;

                update = inboxes.policy.recv(), if policy_open => match update {
                    Some(update) => {
                        let _ = self.engine.apply_policy(update, now());
                        publish = true;
                    }
                    None => policy_open = false,
                },
                change = inboxes.system.recv(), if system_open => match change {
                    Some(change) => {
                        let _ = self.engine.apply_system_change(&change);
                        publish = true;
                    }
                    None => system_open = false,
                },
                signal = inboxes.completions.recv(), if completions_open => match signal {
                    Some(signal) => self.engine.complete(&signal, now()),
                    None => completions_open = false,
                },
                _ = ticker.tick() => {
                    self.engine.tick(now());
                    publish = true;
                }
                sample = inboxes.telemetry.recv(), if telemetry_open => match sample {
                    Some(sample) => {
                        let _ = self.engine.record_telemetry(&sample, now());
                    }
                    None => telemetry_open = false,
                },
                arrival = inboxes.arrivals.recv(), if arrivals_open => match arrival {
                    Some(Arrival { request, respond }) => {
                        let decision = self.engine.arrive(request, now());
                        if let Some(respond) = respond {
                            if respond.send(decision).is_err() {
                                debug!("Caller went away before its decision");
                            }
                        }
                    }
                    None => arrivals_open = false,
                },
            }

            for event in self.engine.take_outbound() {
                match outbound.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        dropped += 1;
                        warn!(dropped, event = ?event, "Outbound channel full, dropping event");
                    }
                    // nobody listens; the engine keeps deciding for `admit` callers
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }

            if publish {
                *snapshot.write() = self.engine.snapshot();
            }
        }

        *snapshot.write() = self.engine.snapshot();
        info!(dropped, "Dispatcher stopped");
    }
}
