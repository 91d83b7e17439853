// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! CLI subcommand implementations for the `pricewatch` binary.

pub mod check_cmd;
pub mod history_cmd;
pub mod run_cmd;
pub mod status;
pub mod validate_cmd;

use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default level.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pricewatch=info,pricewatch_runtime=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
