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

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tierguard_server::{
    config::{LogFormat, ServerConfig},
    run_server,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "TIERGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Maintenance tick interval in milliseconds (overrides config file)
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Log format: text or json (overrides config file)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = ServerConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(tick_ms) = args.tick_ms {
        config.dispatcher.tick_interval_ms = tick_ms;
    }
    if let Some(format) = args.log_format {
        config.log.format = format;
    }

    run_server(config).await
}
