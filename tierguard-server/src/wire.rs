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

//! Newline-delimited JSON transport.
//!
//! One [`Inbound`] event per input line, one [`Outbound`] event per output
//! line, both tagged by `type`. Malformed lines are logged and skipped.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tierguard_core::{Inbound, Outbound};

use crate::dispatcher::DispatcherHandle;

/// Decode one line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Inbound>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("malformed inbound event")?;
    Ok(Some(event))
}

pub fn encode(event: &Outbound) -> Result<String> {
    serde_json::to_string(event).context("failed to encode outbound event")
}

/// Feed inbound lines to the dispatcher until EOF. Returns the number of
/// events submitted.
pub async fn pump_inbound<R>(reader: R, handle: DispatcherHandle) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut submitted = 0;
    let mut line_no: u64 = 0;

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        match parse_line(&line) {
            Ok(Some(event)) => {
                handle.submit(event).await?;
                submitted += 1;
            }
            Ok(None) => {}
            Err(e) => warn!(line = line_no, error = %format!("{:#}", e), "Skipping input line"),
        }
    }

    debug!(submitted, "Input closed");
    Ok(submitted)
}

/// Write every outbound event as one JSON line until the channel closes.
pub async fn pump_outbound<W>(mut rx: mpsc::Receiver<Outbound>, mut writer: W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while let Some(event) = rx.recv().await {
        let mut line = encode(&event)?;
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .context("failed to write output")?;
        writer.flush().await.context("failed to flush output")?;
        written += 1;
    }
    Ok(written)
}
