// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use pricewatch_runtime::cli;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pricewatch",
    about = "Pricewatch: headless-browser price monitor",
    version,
    after_help = "Settings are read from PRICEWATCH_* environment variables.\nRun 'pricewatch <command> --help' for details on each command."
)]
struct Cli {
    /// Output results as JSON (machine-readable)
    #[arg(long, global = true)]
    json: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor every target in the catalog until interrupted
    Run {
        /// Catalog of rules and targets
        #[arg(long, default_value = "catalog.json")]
        catalog: PathBuf,
        /// Print every monitor event to stdout as a JSON line
        #[arg(long)]
        events: bool,
    },
    /// Fetch one target once and show what the rule reads (nothing is stored)
    Check {
        /// Target id
        target: String,
        #[arg(long, default_value = "catalog.json")]
        catalog: PathBuf,
        /// Read the page from a saved HTML file instead of the browser
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Classify the reading against the last stored observation
        #[arg(long)]
        compare: bool,
    },
    /// Show stored price history for a target
    History {
        /// Target id
        target: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show the health ledger of a running monitor
    Status,
    /// Validate a catalog file
    Validate {
        catalog: PathBuf,
    },
    /// Generate shell completions
    Completions {
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Run { catalog, events } => cli::run_cmd::run(&catalog, events).await,
        Commands::Check {
            target,
            catalog,
            fixture,
            compare,
        } => cli::check_cmd::run(&catalog, &target, fixture.as_deref(), compare, cli.json).await,
        Commands::History { target, limit } => cli::history_cmd::run(&target, limit, cli.json).await,
        Commands::Status => cli::status::run(cli.json).await,
        Commands::Validate { catalog } => cli::validate_cmd::run(&catalog, cli.json).await,
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "pricewatch", &mut std::io::stdout());
            Ok(())
        }
    };

    // Consistent exit codes: 0=success, 1=error
    if let Err(e) = &result {
        if cli.json {
            println!(
                "{}",
                serde_json::json!({ "error": true, "message": format!("{e:#}") })
            );
        } else {
            eprintln!("  Error: {e:#}");
        }
        std::process::exit(1);
    }

    result
}
