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

//! Error types for the admission engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TierguardError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TierguardError {
    /// A policy update was rejected; the previous registry stays active.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Unknown value {value:?} for system component {component}")]
    UnknownSystemValue { component: String, value: String },

    /// A telemetry sample carried unusable numbers and was dropped.
    #[error("Invalid telemetry for route {route}: {reason}")]
    InvalidTelemetry { route: String, reason: String },

    #[error("Invalid admission transition: {from:?} on {event:?}")]
    InvalidTransition {
        from: crate::engine::AdmissionState,
        event: crate::engine::AdmissionEvent,
    },
}

impl TierguardError {
    pub fn invalid_policy(reason: impl Into<String>) -> Self {
        Self::InvalidPolicy(reason.into())
    }
}
