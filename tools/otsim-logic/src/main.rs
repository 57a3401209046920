// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logic module host: runs the periodic expression program against bus
//! tags.

use clap::Parser;
use otsim::ModuleRegistry;
use std::path::PathBuf;

/// OT-sim logic module
#[derive(Parser, Debug)]
#[command(name = "ot-sim-logic-module")]
#[command(about = "OT-sim logic module")]
#[command(version)]
struct Args {
    /// Path to the XML config file
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let mut registry = ModuleRegistry::new();
    registry.register("logic", Box::new(otsim::logic::Factory));

    std::process::exit(otsim::run(&args.config, &registry));
}
