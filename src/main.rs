// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! CLI entry point: read a script, run it, map the result to an exit code.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "thistle", about = "Run a Thistle script", version)]
struct Cli {
    /// Script to execute.
    path: PathBuf,

    /// Dump bytecode and trace each instruction as it executes. Only
    /// available when the crate is built with the `trace` feature.
    #[arg(long)]
    #[cfg(feature = "trace")]
    trace: bool,

    /// Force a GC cycle before every allocation.
    #[arg(long)]
    stress_gc: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("THISTLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let source = match std::fs::read_to_string(&cli.path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("thistle: can't read {}: {e}", cli.path.display());
            return ExitCode::from(66); // EX_NOINPUT
        }
    };

    #[cfg(feature = "trace")]
    let trace = cli.trace;
    #[cfg(not(feature = "trace"))]
    let trace = false;

    let options = thistle::RunOptions {
        trace,
        stress_gc: cli.stress_gc,
    };

    match thistle::run(&source, options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
