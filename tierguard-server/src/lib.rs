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

//! Tierguard Server
//!
//! Hosts the admission engine behind a dispatcher task and speaks
//! newline-delimited JSON on stdin/stdout. Logs go to stderr.

pub mod config;
pub mod dispatcher;
pub mod wire;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tierguard_core::AdmissionEngine;

use crate::config::{LogConfig, LogFormat, ServerConfig};
use crate::dispatcher::Dispatcher;

pub use dispatcher::{DispatchError, DispatcherConfig, DispatcherHandle};

/// Install the global subscriber. RUST_LOG overrides the configured filter.
pub fn init_tracing(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| log.filter.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);

    match log.format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    }
    .context("failed to install tracing subscriber")
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    init_tracing(&config.log)?;

    tracing::info!("Starting Tierguard");
    tracing::debug!("Configuration: {:#?}", config);

    config.validate()?;

    let now = tokio::time::Instant::now().into_std();
    let engine = AdmissionEngine::new(config.engine.clone(), config.policy(), now)
        .context("failed to initialize admission engine")?;

    let (handle, outbound, dispatcher) =
        Dispatcher::new(engine, config.dispatcher.clone()).spawn();

    let writer = tokio::spawn(wire::pump_outbound(outbound, tokio::io::stdout()));
    let reader = wire::pump_inbound(tokio::io::BufReader::new(tokio::io::stdin()), handle);

    tokio::select! {
        result = reader => {
            let submitted = result?;
            tracing::info!(submitted, "Input exhausted, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
    }

    // every handle is gone now, so the dispatcher drains and closes the output
    dispatcher.await.context("dispatcher task panicked")?;
    let written = writer.await.context("output task panicked")??;
    tracing::info!(written, "Tierguard stopped");

    Ok(())
}
