// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reader constants check for CI
//!
//! Usage:
//!   verify-constants --export constants.json
//!   verify-constants --file constants.json

use anyhow::Result;
use chebai_eval::reader::{verify_constants_file, ReaderConstants, EXPECTED_CONSTANTS};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "verify-constants")]
#[command(about = "Check exported token reader constants against their expected values")]
#[command(version)]
struct Args {
    /// Constants JSON to verify
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Write this build's constants to the given path first
    #[arg(short, long)]
    export: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if let Some(ref path) = args.export {
        ReaderConstants::current().export(path)?;
        tracing::info!("Constants exported to {}", path.display());
    }

    let Some(path) = args.file.or(args.export) else {
        anyhow::bail!("Nothing to verify (use --file or --export)");
    };

    let mismatches = verify_constants_file(&path)?;

    if mismatches.is_empty() {
        println!("All {} constants match in {}", EXPECTED_CONSTANTS.len(), path.display());
        return Ok(());
    }

    for mismatch in &mismatches {
        eprintln!("Constant mismatch: {}", mismatch);
    }
    tracing::error!("{} of {} constants differ in {}", mismatches.len(), EXPECTED_CONSTANTS.len(), path.display());
    std::process::exit(1);
}
